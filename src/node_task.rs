//! Embassy task wrapping the deterministic [`MeshEngine`].
//!
//! The engine itself never blocks and never reads a clock; this task feeds
//! it received frames, host commands and periodic ticks, stamping each call
//! with the monotonic time, then drains its outgoing frames and events into
//! the channels.

use embassy_futures::select::{select3, Either3};
use embassy_time::{Duration, Instant, Timer};
use log::{log, Level};

use crate::engine::MeshEngine;
use crate::{
    CommandQueueReceiver, EventQueueSender, MeshConfiguration, NodeName, RxFrameQueueReceiver,
    TxFrameQueueSender, MAX_NODE_COUNT,
};

const TICK_INTERVAL_MS: u64 = 1_000;

#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
pub(crate) async fn node_task(
    config: MeshConfiguration,
    node_name: NodeName,
    command_receiver: CommandQueueReceiver,
    event_sender: EventQueueSender,
    rx_receiver: RxFrameQueueReceiver,
    tx_sender: TxFrameQueueSender,
    rng_seed: u64,
) -> ! {
    log!(Level::Info, "Mesh node task started: {}", node_name.as_str());
    let mut engine = MeshEngine::new(node_name.as_str(), config, rng_seed);
    loop {
        match select3(
            rx_receiver.receive(),
            command_receiver.receive(),
            Timer::after(Duration::from_millis(TICK_INTERVAL_MS)),
        )
        .await
        {
            Either3::First(received) => {
                engine.handle_frame(
                    received.frame.as_str(),
                    received.rssi,
                    received.snr,
                    Instant::now().as_millis(),
                );
            }
            Either3::Second(command) => {
                engine.handle_command(command, Instant::now().as_millis());
            }
            Either3::Third(()) => {}
        }
        engine.tick(Instant::now().as_millis());

        while let Some(frame) = engine.next_outgoing() {
            if tx_sender.try_send(frame).is_err() {
                log!(Level::Warn, "TX queue full, dropping outgoing frame");
            }
        }
        while let Some(event) = engine.next_event() {
            if event_sender.try_send(event).is_err() {
                log!(Level::Warn, "Event queue full, dropping event");
            }
        }
    }
}
