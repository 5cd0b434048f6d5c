#![cfg_attr(not(feature = "std"), no_std)]

//! Mesh protocol core for battery-powered text-relay radio nodes.
//!
//! Nodes discover each other with periodic beacons, flood-relay short text
//! messages with a hop limit, and keep two shared datasets (users and
//! per-team pages) eventually consistent via a chunked request/response
//! sync protocol. The protocol logic lives in [`MeshEngine`] and is fully
//! deterministic; [`MeshNodeManager`] wires it to a radio device and a host
//! application through embassy tasks and channels.

#[cfg(all(feature = "radio-device-echo", feature = "radio-device-simulator"))]
compile_error!("Only one radio implementation feature can be enabled at a time");

#[cfg(all(not(test), not(any(feature = "radio-device-echo", feature = "radio-device-simulator"))))]
compile_error!("At least one radio implementation feature must be enabled");

#[cfg(feature = "radio-device-echo")]
pub mod radio_device_echo;

#[cfg(feature = "radio-device-simulator")]
pub mod radio_device_simulator;

#[cfg(feature = "radio-device-echo")]
use crate::radio_device_echo::radio_device_task;
#[cfg(feature = "radio-device-echo")]
pub use crate::radio_device_echo::RadioDevice;

#[cfg(feature = "radio-device-simulator")]
use crate::radio_device_simulator::radio_device_task;
#[cfg(feature = "radio-device-simulator")]
pub use crate::radio_device_simulator::RadioDevice;

mod dedup;
mod engine;
pub mod frame;
mod message_log;
mod node_task;
mod presence;
mod reassembly;
mod sync;

use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::{String, Vec};
use log::log;

pub use engine::MeshEngine;
pub use frame::{FrameError, Packet, RawFrame};
pub use message_log::RoutedMessage;
pub use presence::Neighbor;

// Wire-compatibility constants; changing these changes what peers this node
// can talk to.
pub const MAX_FRAME_LEN: usize = 200;
pub const MAX_CHUNK_LEN: usize = 180;
pub const MAX_SYNC_PARTS: usize = 32;

// Capacity constants; these only bound local memory, not the protocol.
pub const MAX_NODE_NAME_LEN: usize = 48;
pub const MAX_MSG_ID_LEN: usize = 16;
pub const MAX_USER_LEN: usize = 32;
pub const MAX_OBJECT_LEN: usize = 16;
pub const MAX_PARAMS_LEN: usize = 160;
pub const MAX_TEAM_LEN: usize = 32;
pub const MAX_STAMP_LEN: usize = 40;
pub const MAX_HASH_LEN: usize = 64;
pub const MAX_PAGE_HTML_LEN: usize = 2048;
pub const MAX_COMBINED_LEN: usize = MAX_SYNC_PARTS * (MAX_CHUNK_LEN + 1);
pub const MAX_USERS_PER_BATCH: usize = 32;
pub const MAX_ONLINE: usize = 20;
pub const MSG_LOG_SIZE: usize = 20;
pub const MAX_PAGE_TEAMS: usize = 4;

// Protocol timing, all in milliseconds of the monotonic clock.
pub const BEACON_INTERVAL_MS: u64 = 30_000;
pub const PRESENCE_STALE_TIMEOUT_MS: u64 = 60_000;
pub const USERS_STREAM_TIMEOUT_MS: u64 = 90_000;
pub const PAGES_STREAM_TIMEOUT_MS: u64 = 120_000;
pub const PAGE_SLOT_TIMEOUT_MS: u64 = 120_000;
pub const USERS_SYNC_INTERVAL_MS: u64 = 45_000;
pub const PAGES_SYNC_INTERVAL_MS: u64 = 45_000;
pub const SYNC_STALL_WINDOW_MS: u64 = 15_000;
pub const SYNC_RESEND_COOLDOWN_MS: u64 = 10_000;
pub const SYNC_GRACE_MS: u64 = 10_000;
pub const DEFAULT_TTL: u8 = 3;

pub(crate) const OUTBOX_DEPTH: usize = 8;
pub(crate) const EVENT_QUEUE_DEPTH: usize = 8;

#[cfg(feature = "radio-device-simulator")]
pub const MAX_NODE_COUNT: usize = 16;

#[cfg(not(feature = "radio-device-simulator"))]
pub const MAX_NODE_COUNT: usize = 1;

pub type NodeName = String<MAX_NODE_NAME_LEN>;

/// Timing and flooding parameters of one node.
#[derive(Debug, Clone, Copy)]
pub struct MeshConfiguration {
    pub beacon_interval_ms: u64,
    pub presence_stale_timeout_ms: u64,
    /// Hop budget stamped on messages originated by this node.
    pub default_ttl: u8,
}

impl Default for MeshConfiguration {
    fn default() -> Self {
        Self {
            beacon_interval_ms: BEACON_INTERVAL_MS,
            presence_stale_timeout_ms: PRESENCE_STALE_TIMEOUT_MS,
            default_ttl: DEFAULT_TTL,
        }
    }
}

/// One credential tuple from the shared users dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String<MAX_USER_LEN>,
    pub password_hash: String<MAX_HASH_LEN>,
    pub team: String<MAX_TEAM_LEN>,
}

/// Events raised towards the host application (user store, page store, UI).
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    UserRecordsReady(Vec<UserRecord, MAX_USERS_PER_BATCH>),
    TeamPageReady {
        team: String<MAX_TEAM_LEN>,
        html: String<MAX_PAGE_HTML_LEN>,
        updated_at: String<MAX_STAMP_LEN>,
    },
    MessageAppended(RoutedMessage),
    SyncStatusChanged {
        users: bool,
        pages: bool,
    },
}

/// Commands from the host application into the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeCommand {
    SendMessage {
        user: String<MAX_USER_LEN>,
        object: String<MAX_OBJECT_LEN>,
        function: String<MAX_OBJECT_LEN>,
        parameters: String<MAX_PARAMS_LEN>,
    },
    SendBroadcast {
        user: String<MAX_USER_LEN>,
        content: String<MAX_PARAMS_LEN>,
        ttl: u8,
    },
    RefreshUsers,
    RefreshPages,
}

/// One raw frame off the air, with the link quality it arrived at.
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub frame: RawFrame,
    pub rssi: f32,
    pub snr: f32,
}

#[derive(Debug)]
pub enum SendCommandError {
    ChannelFull,
    NotInited,
}

#[derive(Debug)]
pub enum ReceiveEventError {
    NotInited,
}

const COMMAND_QUEUE_SIZE: usize = 4;
type CommandQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, NodeCommand, COMMAND_QUEUE_SIZE>;
type CommandQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, NodeCommand, COMMAND_QUEUE_SIZE>;
type CommandQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, NodeCommand, COMMAND_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static COMMAND_QUEUE: CommandQueue = Channel::new();

const EVENT_QUEUE_SIZE: usize = 8;
type EventQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, MeshEvent, EVENT_QUEUE_SIZE>;
type EventQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, MeshEvent, EVENT_QUEUE_SIZE>;
type EventQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, MeshEvent, EVENT_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static EVENT_QUEUE: EventQueue = Channel::new();

const TX_FRAME_QUEUE_SIZE: usize = 8;
type TxFrameQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, RawFrame, TX_FRAME_QUEUE_SIZE>;
type TxFrameQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, RawFrame, TX_FRAME_QUEUE_SIZE>;
type TxFrameQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, RawFrame, TX_FRAME_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static TX_FRAME_QUEUE: TxFrameQueue = Channel::new();

const RX_FRAME_QUEUE_SIZE: usize = 16;
type RxFrameQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, ReceivedFrame, RX_FRAME_QUEUE_SIZE>;
type RxFrameQueueReceiver = embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, ReceivedFrame, RX_FRAME_QUEUE_SIZE>;
type RxFrameQueueSender = embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, ReceivedFrame, RX_FRAME_QUEUE_SIZE>;

#[cfg(feature = "embedded")]
static RX_FRAME_QUEUE: RxFrameQueue = Channel::new();

enum MeshNodeManagerState {
    Uninitialized,
    Initialized {
        command_queue_sender: CommandQueueSender,
        event_queue_receiver: EventQueueReceiver,
    },
}

/// Host-facing handle. Owns the channel endpoints towards the node task
/// once initialized; all protocol state lives inside the task.
pub struct MeshNodeManager {
    state: MeshNodeManagerState,
}

impl MeshNodeManager {
    pub const fn new() -> Self {
        MeshNodeManager {
            state: MeshNodeManagerState::Uninitialized,
        }
    }

    #[cfg(all(feature = "embedded", any(feature = "radio-device-echo", feature = "radio-device-simulator")))]
    pub fn initialize(
        &mut self,
        config: MeshConfiguration,
        spawner: Spawner,
        radio_device: RadioDevice,
        node_name: &str,
        rng_seed: u64,
    ) -> Result<(), ()> {
        self.initialize_common(
            config,
            spawner,
            radio_device,
            &COMMAND_QUEUE,
            &EVENT_QUEUE,
            &TX_FRAME_QUEUE,
            &RX_FRAME_QUEUE,
            node_name,
            rng_seed,
        )
    }

    #[cfg(all(feature = "std", any(feature = "radio-device-echo", feature = "radio-device-simulator")))]
    pub fn initialize(
        &mut self,
        config: MeshConfiguration,
        spawner: Spawner,
        radio_device: RadioDevice,
        node_name: &str,
        rng_seed: u64,
    ) -> Result<(), ()> {
        let command_queue: &'static CommandQueue = Box::leak(Box::new(Channel::new()));
        let event_queue: &'static EventQueue = Box::leak(Box::new(Channel::new()));
        let tx_frame_queue: &'static TxFrameQueue = Box::leak(Box::new(Channel::new()));
        let rx_frame_queue: &'static RxFrameQueue = Box::leak(Box::new(Channel::new()));
        self.initialize_common(
            config,
            spawner,
            radio_device,
            command_queue,
            event_queue,
            tx_frame_queue,
            rx_frame_queue,
            node_name,
            rng_seed,
        )
    }

    #[allow(clippy::too_many_arguments)]
    #[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
    fn initialize_common(
        &mut self,
        config: MeshConfiguration,
        spawner: Spawner,
        radio_device: RadioDevice,
        command_queue: &'static CommandQueue,
        event_queue: &'static EventQueue,
        tx_frame_queue: &'static TxFrameQueue,
        rx_frame_queue: &'static RxFrameQueue,
        node_name: &str,
        rng_seed: u64,
    ) -> Result<(), ()> {
        let node_name = NodeName::try_from(node_name).map_err(|_| ())?;

        let radio_device_task_result = spawner.spawn(radio_device_task(
            radio_device,
            tx_frame_queue.receiver(),
            rx_frame_queue.sender(),
            rng_seed.wrapping_add(1),
        ));
        if radio_device_task_result.is_err() {
            return Err(());
        }
        log!(log::Level::Debug, "Radio device task spawned");

        let node_task_result = spawner.spawn(node_task::node_task(
            config,
            node_name,
            command_queue.receiver(),
            event_queue.sender(),
            rx_frame_queue.receiver(),
            tx_frame_queue.sender(),
            rng_seed,
        ));
        if node_task_result.is_err() {
            return Err(());
        }
        log!(log::Level::Debug, "Mesh node task spawned");
        log!(log::Level::Info, "Mesh node initialized");

        self.state = MeshNodeManagerState::Initialized {
            command_queue_sender: command_queue.sender(),
            event_queue_receiver: event_queue.receiver(),
        };
        Ok(())
    }

    pub fn send_command(&self, command: NodeCommand) -> Result<(), SendCommandError> {
        let command_queue_sender = match &self.state {
            MeshNodeManagerState::Uninitialized => {
                return Err(SendCommandError::NotInited);
            }
            MeshNodeManagerState::Initialized { command_queue_sender, .. } => command_queue_sender,
        };
        command_queue_sender.try_send(command).map_err(|_| SendCommandError::ChannelFull)?;
        Ok(())
    }

    pub async fn receive_event(&self) -> Result<MeshEvent, ReceiveEventError> {
        let event_queue_receiver = match &self.state {
            MeshNodeManagerState::Uninitialized => {
                return Err(ReceiveEventError::NotInited);
            }
            MeshNodeManagerState::Initialized { event_queue_receiver, .. } => event_queue_receiver,
        };
        Ok(event_queue_receiver.receive().await)
    }
}
