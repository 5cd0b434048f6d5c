//! Loopback radio for tests and host-side development: every transmitted
//! frame comes straight back as a received frame with a fixed link quality.

use crate::{ReceivedFrame, RxFrameQueueSender, TxFrameQueueReceiver, MAX_NODE_COUNT};
use log::{log, Level};

const ECHO_RSSI: f32 = -60.0;
const ECHO_SNR: f32 = 10.0;

#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub(crate) async fn radio_device_task(
    mut radio_device: RadioDevice,
    tx_receiver: TxFrameQueueReceiver,
    rx_sender: RxFrameQueueSender,
    _rng_seed: u64,
) -> ! {
    log!(Level::Info, "Echo radio device task started");
    radio_device.run(tx_receiver, rx_sender).await
}

pub struct RadioDevice {}

impl RadioDevice {
    pub const fn new() -> Self {
        RadioDevice {}
    }

    async fn run(&mut self, tx_receiver: TxFrameQueueReceiver, rx_sender: RxFrameQueueSender) -> ! {
        loop {
            let frame = tx_receiver.receive().await;
            match rx_sender.try_send(ReceivedFrame {
                frame,
                rssi: ECHO_RSSI,
                snr: ECHO_SNR,
            }) {
                Ok(_) => {}
                Err(embassy_sync::channel::TrySendError::Full(received_frame)) => {
                    log!(
                        Level::Warn,
                        "RX queue full, dropping echoed frame ({} bytes)",
                        received_frame.frame.len()
                    );
                }
            }
        }
    }
}
