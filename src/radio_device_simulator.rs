//! Multi-node in-process radio: every frame a node transmits is delivered
//! to every other node registered on the same [`MeshBus`], with simulated
//! link quality. Lets a whole mesh run inside one executor.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;
use log::{log, Level};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::{RawFrame, ReceivedFrame, RxFrameQueueSender, TxFrameQueueReceiver, MAX_NODE_COUNT};

/// Shared medium connecting the simulated radios. One static instance per
/// simulated mesh.
pub struct MeshBus {
    senders: Mutex<CriticalSectionRawMutex, RefCell<Vec<RxFrameQueueSender, MAX_NODE_COUNT>>>,
}

impl MeshBus {
    pub const fn new() -> Self {
        MeshBus {
            senders: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    fn register(&self, sender: RxFrameQueueSender) -> Option<usize> {
        self.senders.lock(|senders| {
            let mut senders = senders.borrow_mut();
            let index = senders.len();
            senders.push(sender).ok().map(|_| index)
        })
    }

    fn broadcast(&self, from: usize, frame: &RawFrame, rssi: f32, snr: f32) {
        self.senders.lock(|senders| {
            for (index, sender) in senders.borrow().iter().enumerate() {
                if index == from {
                    continue;
                }
                if sender
                    .try_send(ReceivedFrame {
                        frame: frame.clone(),
                        rssi,
                        snr,
                    })
                    .is_err()
                {
                    log!(Level::Warn, "RX queue of node {} full, frame lost", index);
                }
            }
        });
    }
}

#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub(crate) async fn radio_device_task(
    radio_device: RadioDevice,
    tx_receiver: TxFrameQueueReceiver,
    rx_sender: RxFrameQueueSender,
    rng_seed: u64,
) -> ! {
    log!(Level::Info, "Simulated radio device task started");
    radio_device.run(tx_receiver, rx_sender, rng_seed).await
}

pub struct RadioDevice {
    bus: &'static MeshBus,
}

impl RadioDevice {
    pub const fn new(bus: &'static MeshBus) -> Self {
        RadioDevice { bus }
    }

    async fn run(self, tx_receiver: TxFrameQueueReceiver, rx_sender: RxFrameQueueSender, rng_seed: u64) -> ! {
        let mut rng = WyRand::seed_from_u64(rng_seed);
        let Some(own_index) = self.bus.register(rx_sender) else {
            log!(Level::Warn, "Mesh bus full, radio stays silent");
            loop {
                let _ = tx_receiver.receive().await;
            }
        };
        loop {
            let frame = tx_receiver.receive().await;
            // Link quality jitter keeps presence tables from looking uniform.
            let rssi = -90.0 + (rng.next_u32() % 30) as f32;
            let snr = -5.0 + (rng.next_u32() % 15) as f32;
            self.bus.broadcast(own_index, &frame, rssi, snr);
        }
    }
}
