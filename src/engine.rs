//! # Mesh Engine
//!
//! Owns every piece of protocol state and drives it from two entry points:
//! [`MeshEngine::tick`] for the timers (sync requests, beacon, presence
//! pruning) and [`MeshEngine::handle_frame`] for inbound frames. Both take
//! the current monotonic time in milliseconds, so the whole engine is
//! deterministic and testable without a clock.
//!
//! Outgoing frames and events for the host are buffered in small queues and
//! drained by the caller between ticks. The engine never blocks and never
//! waits for the radio.

use core::fmt::Write;

use heapless::{Deque, String, Vec};
use rand_core::{RngCore, SeedableRng};
use rand_wyrand::WyRand;

use crate::dedup::DedupCache;
use crate::frame::{self, Packet, RawFrame};
use crate::message_log::{MessageLog, RoutedMessage};
use crate::presence::{Neighbor, PresenceTable};
use crate::reassembly::{PagePool, StreamReassembler};
use crate::sync::{SyncRequest, SyncScheduler, TransferStatus};
use crate::{
    MeshConfiguration, MeshEvent, NodeCommand, NodeName, UserRecord, EVENT_QUEUE_DEPTH,
    MAX_MSG_ID_LEN, MAX_ONLINE, MAX_PAGE_TEAMS, MAX_STAMP_LEN, MAX_SYNC_PARTS, MAX_TEAM_LEN,
    MAX_USERS_PER_BATCH, MSG_LOG_SIZE, OUTBOX_DEPTH, PAGES_STREAM_TIMEOUT_MS, PAGE_SLOT_TIMEOUT_MS,
    USERS_STREAM_TIMEOUT_MS,
};

pub struct MeshEngine {
    node_name: NodeName,
    config: MeshConfiguration,
    dedup: DedupCache<MSG_LOG_SIZE>,
    log: MessageLog<MSG_LOG_SIZE>,
    presence: PresenceTable<MAX_ONLINE>,
    users_rx: StreamReassembler<MAX_SYNC_PARTS>,
    pages_rx: StreamReassembler<MAX_SYNC_PARTS>,
    page_pool: PagePool<MAX_PAGE_TEAMS, MAX_SYNC_PARTS>,
    sync: SyncScheduler,
    next_beacon_at_ms: u64,
    msg_counter: u32,
    outbox: Deque<RawFrame, OUTBOX_DEPTH>,
    events: Deque<MeshEvent, EVENT_QUEUE_DEPTH>,
}

impl MeshEngine {
    pub fn new(node_name: &str, config: MeshConfiguration, rng_seed: u64) -> Self {
        let mut rng = WyRand::seed_from_u64(rng_seed);
        let mut name = NodeName::new();
        for ch in node_name.chars() {
            if name.push(ch).is_err() {
                log::warn!("node name truncated to {} bytes", name.len());
                break;
            }
        }
        let mut presence = PresenceTable::new();
        // Synthetic self-entry so the node shows up in its own list.
        presence.upsert(name.as_str(), 0.0, 0.0, 0);
        // Random beacon phase so colliding cold boots do not stay in lockstep.
        let next_beacon_at_ms = rng.next_u64() % config.beacon_interval_ms;
        Self {
            node_name: name,
            config,
            dedup: DedupCache::new(),
            log: MessageLog::new(),
            presence,
            users_rx: StreamReassembler::with(USERS_STREAM_TIMEOUT_MS, true),
            pages_rx: StreamReassembler::with(PAGES_STREAM_TIMEOUT_MS, true),
            page_pool: PagePool::with(PAGE_SLOT_TIMEOUT_MS),
            sync: SyncScheduler::new(),
            next_beacon_at_ms,
            msg_counter: 0,
            outbox: Deque::new(),
            events: Deque::new(),
        }
    }

    /// One cooperative scheduler slice: sync timers, beacon, presence pruning.
    pub fn tick(&mut self, now_ms: u64) {
        // A timed-out keyed page transfer can only be recovered by asking
        // for the whole dataset again.
        if self.page_pool.reclaim_stale(now_ms) && self.sync.pages_synced() {
            self.sync.reset_pages();
            self.push_sync_status();
        }

        let users_status = Self::transfer_status(&self.users_rx);
        let pages_status = TransferStatus {
            in_progress: self.pages_rx.in_progress() || self.page_pool.in_progress(),
            last_part_at_ms: self
                .pages_rx
                .last_part_at_ms()
                .max(self.page_pool.latest_part_at_ms()),
        };
        // Owned copy so outgoing packets do not keep self borrowed.
        let node_name = self.node_name.clone();
        if let Some(request) = self.sync.poll(now_ms, users_status, pages_status) {
            let packet = match request {
                SyncRequest::Users => Packet::ReqUsers {
                    name: node_name.as_str(),
                },
                SyncRequest::Pages => Packet::ReqPages {
                    name: node_name.as_str(),
                },
            };
            self.push_packet(&packet);
        }

        if now_ms >= self.next_beacon_at_ms {
            self.presence.upsert(node_name.as_str(), 0.0, 0.0, now_ms);
            if self.sync.beacon_suppressed(now_ms) {
                log::debug!("beacon slot skipped, sync request outstanding");
            } else {
                let packet = Packet::Beacon {
                    name: node_name.as_str(),
                };
                self.push_packet(&packet);
            }
            self.next_beacon_at_ms = now_ms + self.config.beacon_interval_ms;
        }

        self.presence.prune(now_ms, self.config.presence_stale_timeout_ms);
    }

    /// Decodes one raw frame and dispatches it. Callable for any transport
    /// source, not only the primary radio.
    pub fn handle_frame(&mut self, raw: &str, rssi: f32, snr: f32, now_ms: u64) {
        // Owned copy so outgoing packets do not keep self borrowed.
        let node_name = self.node_name.clone();
        match frame::decode(raw) {
            Packet::Msg {
                msg_id,
                user,
                ttl,
                timestamp,
                object,
                function,
                parameters,
            } => {
                self.presence.upsert(user, rssi, snr, now_ms);
                if self.dedup.seen(msg_id) {
                    log::debug!("message {} already processed, dropping", msg_id);
                    return;
                }
                self.dedup.remember(msg_id);
                let Some(message) = routed_message(msg_id, user, ttl, timestamp, object, function, parameters)
                else {
                    log::warn!("message {} has oversized fields, dropping", msg_id);
                    return;
                };
                self.log.append(message.clone());
                self.push_event(MeshEvent::MessageAppended(message));

                if object == "USER" && (function == "ADD" || function == "UPDATE") {
                    if let Some(record) = user_record_from_params(parameters) {
                        let mut records = Vec::new();
                        let _ = records.push(record);
                        self.push_event(MeshEvent::UserRecordsReady(records));
                    } else {
                        log::warn!("USER {} message with incomplete parameters", function);
                    }
                }

                if frame::is_targeted_at(parameters, node_name.as_str()) {
                    // Delivery ack, fire-and-forget. A targeted message is
                    // consumed here and never relayed further.
                    let mut stamp: String<20> = String::new();
                    let _ = write!(stamp, "{}", now_ms);
                    let ack = Packet::Ack {
                        msg_id,
                        name: node_name.as_str(),
                        object,
                        function,
                        timestamp: stamp.as_str(),
                    };
                    self.push_packet(&ack);
                } else if ttl > 0 {
                    let forward = Packet::Msg {
                        msg_id,
                        user,
                        ttl: ttl - 1,
                        timestamp,
                        object,
                        function,
                        parameters,
                    };
                    self.push_packet(&forward);
                }
            }
            Packet::Bcast {
                msg_id,
                user,
                ttl,
                content,
            } => {
                self.presence.upsert(user, rssi, snr, now_ms);
                let id = match msg_id {
                    Some(id) => {
                        let mut owned: String<MAX_MSG_ID_LEN> = String::new();
                        for ch in id.chars() {
                            if owned.push(ch).is_err() {
                                break;
                            }
                        }
                        owned
                    }
                    // Legacy frames carry no id; derive a stable one so every
                    // node dedups the same broadcast identically.
                    None => synth_bcast_id(user, content),
                };
                if self.dedup.seen(id.as_str()) {
                    log::debug!("broadcast {} already processed, dropping", id.as_str());
                    return;
                }
                self.dedup.remember(id.as_str());
                let Some(message) =
                    routed_message(id.as_str(), user, ttl, (now_ms / 1000) as u32, "BCAST", "SAY", content)
                else {
                    log::warn!("broadcast from {} has oversized fields, dropping", user);
                    return;
                };
                self.log.append(message.clone());
                self.push_event(MeshEvent::MessageAppended(message));
                if ttl > 0 {
                    // Forwarded in the modern five-field form even when the
                    // inbound frame was legacy.
                    let forward = Packet::Bcast {
                        msg_id: Some(id.as_str()),
                        user,
                        ttl: ttl - 1,
                        content,
                    };
                    self.push_packet(&forward);
                }
            }
            Packet::Beacon { name } => {
                self.presence.upsert(name, rssi, snr, now_ms);
            }
            Packet::Ping { rest } => {
                log::debug!("ping received ({}), answering", rest);
                let mut stamp: String<20> = String::new();
                let _ = write!(stamp, "{}", now_ms);
                let pong = Packet::Pong {
                    name: node_name.as_str(),
                    timestamp: stamp.as_str(),
                };
                self.push_packet(&pong);
            }
            Packet::Pong { name, .. } => {
                log::debug!("pong from {}", name);
            }
            Packet::Ack { msg_id, name, .. } => {
                log::debug!("ack for {} from {}", msg_id, name);
            }
            Packet::ReqUsers { name } | Packet::ReqPages { name } => {
                // Serving datasets is the gateway's job, not this node's.
                log::debug!("sync request from {}, ignoring", name);
            }
            Packet::RespUsers { payload } => {
                self.complete_users(payload);
            }
            Packet::RespUsersPart { index, total, payload } => {
                if let Some(combined) = self.users_rx.on_part(index, total, payload, now_ms) {
                    self.complete_users(combined.as_str());
                }
            }
            Packet::RespPages { payload } => {
                self.complete_pages(payload);
            }
            Packet::RespPagesPart { index, total, payload } => {
                if let Some(combined) = self.pages_rx.on_part(index, total, payload, now_ms) {
                    self.complete_pages(combined.as_str());
                }
            }
            Packet::RespPage {
                team,
                index,
                total,
                updated_at,
                chunk,
            } => {
                let (Ok(team), Ok(updated_at)) = (
                    frame::url_decode::<MAX_TEAM_LEN>(team),
                    frame::url_decode::<MAX_STAMP_LEN>(updated_at),
                ) else {
                    log::warn!("page part with oversized team or timestamp, dropping");
                    return;
                };
                if let Some((team, combined, updated_at)) = self.page_pool.on_part(
                    team.as_str(),
                    updated_at.as_str(),
                    index,
                    total,
                    chunk,
                    now_ms,
                ) {
                    match frame::url_decode_html(combined.as_str()) {
                        Ok(html) => {
                            self.push_event(MeshEvent::TeamPageReady {
                                team,
                                html,
                                updated_at,
                            });
                            if !self.sync.pages_synced() {
                                self.sync.mark_pages_synced();
                                self.push_sync_status();
                            }
                        }
                        Err(_) => {
                            log::warn!("page for team {} exceeds html capacity, dropping", team.as_str())
                        }
                    }
                }
            }
            Packet::Unknown => {
                log::debug!("unrecognized frame, dropping");
            }
        }
    }

    /// Applies one host command (UI or portal initiated).
    pub fn handle_command(&mut self, command: NodeCommand, now_ms: u64) {
        match command {
            NodeCommand::SendMessage {
                user,
                object,
                function,
                parameters,
            } => {
                let id = self.next_msg_id(now_ms);
                self.dedup.remember(id.as_str());
                let packet = Packet::Msg {
                    msg_id: id.as_str(),
                    user: user.as_str(),
                    ttl: self.config.default_ttl,
                    timestamp: (now_ms / 1000) as u32,
                    object: object.as_str(),
                    function: function.as_str(),
                    parameters: parameters.as_str(),
                };
                self.push_packet(&packet);
                if let Some(message) = routed_message(
                    id.as_str(),
                    user.as_str(),
                    self.config.default_ttl,
                    (now_ms / 1000) as u32,
                    object.as_str(),
                    function.as_str(),
                    parameters.as_str(),
                ) {
                    self.log.append(message);
                }
            }
            NodeCommand::SendBroadcast { user, content, ttl } => {
                let id = self.next_msg_id(now_ms);
                self.dedup.remember(id.as_str());
                let packet = Packet::Bcast {
                    msg_id: Some(id.as_str()),
                    user: user.as_str(),
                    ttl,
                    content: content.as_str(),
                };
                self.push_packet(&packet);
                if let Some(message) = routed_message(
                    id.as_str(),
                    user.as_str(),
                    ttl,
                    (now_ms / 1000) as u32,
                    "BCAST",
                    "SAY",
                    content.as_str(),
                ) {
                    self.log.append(message);
                }
            }
            NodeCommand::RefreshUsers => {
                self.sync.reset_users();
                self.push_sync_status();
            }
            NodeCommand::RefreshPages => {
                self.sync.reset_pages();
                self.push_sync_status();
            }
        }
    }

    pub fn next_outgoing(&mut self) -> Option<RawFrame> {
        self.outbox.pop_front()
    }

    pub fn next_event(&mut self) -> Option<MeshEvent> {
        self.events.pop_front()
    }

    pub fn neighbors(&self) -> &[Neighbor] {
        self.presence.list()
    }

    pub fn messages(&self) -> impl Iterator<Item = &RoutedMessage> {
        self.log.iter()
    }

    pub fn sync_status(&self) -> (bool, bool) {
        (self.sync.users_synced(), self.sync.pages_synced())
    }

    fn complete_users(&mut self, payload: &str) {
        let mut records: Vec<UserRecord, MAX_USERS_PER_BATCH> = Vec::new();
        for entry in payload.split(';').filter(|entry| !entry.is_empty()) {
            let Some(record) = parse_user_entry(entry) else {
                log::warn!("malformed users entry, skipping");
                continue;
            };
            if records.push(record).is_err() {
                log::warn!("users payload exceeds {} records, truncating", MAX_USERS_PER_BATCH);
                break;
            }
        }
        if records.is_empty() {
            log::warn!("users payload had no valid records, staying unsynced");
            return;
        }
        log::info!("users dataset received, {} records", records.len());
        self.push_event(MeshEvent::UserRecordsReady(records));
        if !self.sync.users_synced() {
            self.sync.mark_users_synced();
            self.push_sync_status();
        }
    }

    fn complete_pages(&mut self, payload: &str) {
        let mut delivered = 0usize;
        for entry in payload.split(';').filter(|entry| !entry.is_empty()) {
            let mut fields = entry.split('|');
            let (Some(team), Some(encoded)) = (fields.next(), fields.next()) else {
                log::warn!("malformed pages entry, skipping");
                continue;
            };
            let updated_at = fields.next().unwrap_or("");
            let Ok(html) = frame::url_decode_html(encoded) else {
                log::warn!("page for team {} exceeds html capacity, skipping", team);
                continue;
            };
            let (Ok(team), Ok(updated_at)) = (
                String::<MAX_TEAM_LEN>::try_from(team),
                String::<MAX_STAMP_LEN>::try_from(updated_at),
            ) else {
                log::warn!("pages entry with oversized team or timestamp, skipping");
                continue;
            };
            self.push_event(MeshEvent::TeamPageReady {
                team,
                html,
                updated_at,
            });
            delivered += 1;
        }
        if delivered == 0 {
            log::warn!("pages payload had no valid entries, staying unsynced");
            return;
        }
        log::info!("pages dataset received, {} pages", delivered);
        if !self.sync.pages_synced() {
            self.sync.mark_pages_synced();
            self.push_sync_status();
        }
    }

    fn next_msg_id(&mut self, now_ms: u64) -> String<MAX_MSG_ID_LEN> {
        self.msg_counter = self.msg_counter.wrapping_add(1);
        let mut id = String::new();
        let _ = write!(id, "{:x}-{:x}", now_ms, self.msg_counter);
        id
    }

    fn transfer_status(stream: &StreamReassembler<MAX_SYNC_PARTS>) -> TransferStatus {
        TransferStatus {
            in_progress: stream.in_progress(),
            last_part_at_ms: stream.last_part_at_ms(),
        }
    }

    fn push_packet(&mut self, packet: &Packet<'_>) {
        match frame::encode(packet) {
            Ok(frame) => {
                if self.outbox.push_back(frame).is_err() {
                    log::warn!("outbox full, dropping outgoing frame");
                }
            }
            Err(error) => log::warn!("dropping outgoing frame: {:?}", error),
        }
    }

    fn push_event(&mut self, event: MeshEvent) {
        if self.events.push_back(event).is_err() {
            log::warn!("event queue full, dropping event");
        }
    }

    fn push_sync_status(&mut self) {
        self.push_event(MeshEvent::SyncStatusChanged {
            users: self.sync.users_synced(),
            pages: self.sync.pages_synced(),
        });
    }
}

fn routed_message(
    msg_id: &str,
    user: &str,
    ttl: u8,
    timestamp: u32,
    object: &str,
    function: &str,
    parameters: &str,
) -> Option<RoutedMessage> {
    Some(RoutedMessage {
        msg_id: String::try_from(msg_id).ok()?,
        user: String::try_from(user).ok()?,
        ttl,
        timestamp,
        object: String::try_from(object).ok()?,
        function: String::try_from(function).ok()?,
        parameters: String::try_from(parameters).ok()?,
    })
}

/// Builds a record from `USER ADD`/`UPDATE` message parameters
/// (`name:.., pwdHash:.., team:..`).
fn user_record_from_params(parameters: &str) -> Option<UserRecord> {
    let name = frame::find_param(parameters, "name")?;
    let hash = frame::find_param(parameters, "pwdHash")?;
    let team = frame::find_param(parameters, "team").unwrap_or("");
    if name.is_empty() || hash.is_empty() {
        return None;
    }
    Some(UserRecord {
        name: String::try_from(name).ok()?,
        password_hash: String::try_from(hash).ok()?,
        team: String::try_from(team).ok()?,
    })
}

/// Parses one `name|hash|team` entry of the users dataset payload.
fn parse_user_entry(entry: &str) -> Option<UserRecord> {
    let mut fields = entry.split('|');
    let name = fields.next()?.trim();
    let hash = fields.next()?.trim();
    let team = fields.next().unwrap_or("").trim();
    if name.is_empty() || hash.is_empty() {
        return None;
    }
    Some(UserRecord {
        name: String::try_from(name).ok()?,
        password_hash: String::try_from(hash).ok()?,
        team: String::try_from(team).ok()?,
    })
}

/// FNV-1a over sender and content, so every node derives the same id for
/// the same legacy broadcast.
fn synth_bcast_id(user: &str, content: &str) -> String<MAX_MSG_ID_LEN> {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in user.as_bytes().iter().chain(content.as_bytes()) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let mut id = String::new();
    let _ = write!(id, "b{:015x}", hash >> 4);
    id
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::{BEACON_INTERVAL_MS, PAGE_SLOT_TIMEOUT_MS, SYNC_GRACE_MS};

    fn engine() -> MeshEngine {
        MeshEngine::new("alpha", MeshConfiguration::default(), 7)
    }

    fn drain_frames(engine: &mut MeshEngine) -> std::vec::Vec<std::string::String> {
        let mut frames = std::vec::Vec::new();
        while let Some(frame) = engine.next_outgoing() {
            frames.push(frame.as_str().into());
        }
        frames
    }

    fn drain_events(engine: &mut MeshEngine) -> std::vec::Vec<MeshEvent> {
        let mut events = std::vec::Vec::new();
        while let Some(event) = engine.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn message_is_appended_and_forwarded_with_decremented_ttl() {
        let mut engine = engine();
        engine.handle_frame("MSG;m1;alice;2;1000;MSG;SEND;hello", -80.0, 5.0, 0);

        let events = drain_events(&mut engine);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MeshEvent::MessageAppended(message) => {
                assert_eq!(message.msg_id.as_str(), "m1");
                assert_eq!(message.user.as_str(), "alice");
                assert_eq!(message.ttl, 2);
                assert_eq!(message.object.as_str(), "MSG");
                assert_eq!(message.function.as_str(), "SEND");
                assert_eq!(message.parameters.as_str(), "hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(drain_frames(&mut engine), ["MSG;m1;alice;1;1000;MSG;SEND;hello"]);
    }

    #[test]
    fn duplicate_message_is_dropped() {
        let mut engine = engine();
        engine.handle_frame("MSG;m1;alice;2;1000;MSG;SEND;hello", -80.0, 5.0, 0);
        drain_frames(&mut engine);
        drain_events(&mut engine);

        engine.handle_frame("MSG;m1;alice;2;1000;MSG;SEND;hello", -75.0, 6.0, 100);
        assert!(drain_frames(&mut engine).is_empty());
        assert!(drain_events(&mut engine).is_empty());
    }

    #[test]
    fn message_with_zero_ttl_is_logged_but_not_forwarded() {
        let mut engine = engine();
        engine.handle_frame("BCAST;m2;carol;0;hi", -80.0, 5.0, 0);
        assert!(drain_frames(&mut engine).is_empty());
        assert_eq!(drain_events(&mut engine).len(), 1);
        assert_eq!(engine.messages().count(), 1);
    }

    #[test]
    fn targeted_message_is_acked_and_not_relayed() {
        let mut engine = engine();
        engine.handle_frame("MSG;m3;alice;3;1000;LED;ON;node:alpha", -80.0, 5.0, 42);
        let frames = drain_frames(&mut engine);
        assert_eq!(frames, ["ACK;m3;alpha;LED;ON;42"]);
    }

    #[test]
    fn legacy_broadcast_is_normalized_and_deduped() {
        let mut engine = engine();
        engine.handle_frame("BCAST;carol;2;hi", -80.0, 5.0, 0);
        let frames = drain_frames(&mut engine);
        assert_eq!(frames.len(), 1);
        // Forwarded in the five-field form with a synthesized id.
        let expected_id = synth_bcast_id("carol", "hi");
        assert_eq!(frames[0], format!("BCAST;{};carol;1;hi", expected_id.as_str()));

        // The same legacy frame from another relay is recognized.
        engine.handle_frame("BCAST;carol;2;hi", -90.0, 2.0, 50);
        assert!(drain_frames(&mut engine).is_empty());
        // So is the normalized form of it.
        engine.handle_frame(&frames[0], -90.0, 2.0, 60);
        assert!(drain_frames(&mut engine).is_empty());
    }

    #[test]
    fn echo_prefixed_frame_is_decoded() {
        let mut engine = engine();
        engine.handle_frame("LORA_TX;PING;check", -80.0, 5.0, 1234);
        assert_eq!(drain_frames(&mut engine), ["PONG;alpha;1234"]);
    }

    #[test]
    fn beacon_updates_presence() {
        let mut engine = engine();
        engine.handle_frame("BEACON;bob", -70.0, 8.0, 500);
        let names: std::vec::Vec<&str> = engine.neighbors().iter().map(|n| n.name.as_str()).collect();
        assert!(names.contains(&"bob"));
        assert!(names.contains(&"alpha"));
    }

    #[test]
    fn stale_neighbor_is_pruned_on_tick() {
        let mut engine = engine();
        engine.handle_frame("BEACON;bob", -70.0, 8.0, 0);
        engine.tick(engine.config.presence_stale_timeout_ms + 1_000);
        let names: std::vec::Vec<&str> = engine.neighbors().iter().map(|n| n.name.as_str()).collect();
        assert!(!names.contains(&"bob"));
        // The self-entry is refreshed by the beacon slot and survives.
        assert!(names.contains(&"alpha"));
    }

    #[test]
    fn cold_start_requests_users_and_suppresses_beacon() {
        let mut engine = engine();
        engine.tick(0);
        assert_eq!(drain_frames(&mut engine), ["REQ;USERS;alpha"]);
        // Within the grace window no beacon goes out, whatever the phase.
        engine.tick(SYNC_GRACE_MS / 2);
        assert!(drain_frames(&mut engine).is_empty());
    }

    #[test]
    fn two_part_users_sync_completes_and_marks_synced() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;PART;1;2;alice|h1|red;", -80.0, 5.0, 0);
        assert!(drain_events(&mut engine).is_empty());
        engine.handle_frame("RESP;USERS;PART;2;2;bob|h2|blue", -80.0, 5.0, 100);

        let events = drain_events(&mut engine);
        assert_eq!(events.len(), 2);
        match &events[0] {
            MeshEvent::UserRecordsReady(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].name.as_str(), "alice");
                assert_eq!(records[0].password_hash.as_str(), "h1");
                assert_eq!(records[0].team.as_str(), "red");
                assert_eq!(records[1].name.as_str(), "bob");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            events[1],
            MeshEvent::SyncStatusChanged {
                users: true,
                pages: false
            }
        );
        assert_eq!(engine.sync_status(), (true, false));
    }

    #[test]
    fn single_frame_users_response_syncs_directly() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;alice|h1|red", -80.0, 5.0, 0);
        assert_eq!(engine.sync_status(), (true, false));
    }

    #[test]
    fn empty_users_payload_does_not_mark_synced() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;;;", -80.0, 5.0, 0);
        assert_eq!(engine.sync_status(), (false, false));
        assert!(drain_events(&mut engine).is_empty());
    }

    #[test]
    fn keyed_page_transfer_emits_decoded_page() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;alice|h1|red", -80.0, 5.0, 0);
        drain_events(&mut engine);

        engine.handle_frame("RESP;PAGE;red;1;2;2024-05-01;%3Ch1%3Ehi", -80.0, 5.0, 100);
        assert!(drain_events(&mut engine).is_empty());
        engine.handle_frame("RESP;PAGE;red;2;2;2024-05-01;+there%3C%2Fh1%3E", -80.0, 5.0, 200);

        let events = drain_events(&mut engine);
        assert_eq!(events.len(), 2);
        match &events[0] {
            MeshEvent::TeamPageReady {
                team,
                html,
                updated_at,
            } => {
                assert_eq!(team.as_str(), "red");
                assert_eq!(html.as_str(), "<h1>hi there</h1>");
                assert_eq!(updated_at.as_str(), "2024-05-01");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(engine.sync_status(), (true, true));
    }

    #[test]
    fn active_keyed_transfer_is_not_treated_as_stalled() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;alice|h1|red", -80.0, 5.0, 0);
        drain_events(&mut engine);
        engine.tick(10);
        assert_eq!(drain_frames(&mut engine), ["REQ;PAGES;alpha"]);

        // Keyed parts keep arriving, so even well past the stall window
        // since the request the scheduler must not re-request.
        engine.handle_frame("RESP;PAGE;red;1;3;v1;aa", -80.0, 5.0, 16_000);
        engine.handle_frame("RESP;PAGE;red;2;3;v1;bb", -80.0, 5.0, 26_000);
        engine.tick(26_001);
        let frames = drain_frames(&mut engine);
        assert!(
            frames.iter().all(|frame| !frame.starts_with("REQ;PAGES")),
            "spurious pages resend: {:?}",
            frames
        );
    }

    #[test]
    fn stale_keyed_transfer_resets_pages_sync_and_re_requests() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;alice|h1|red", -80.0, 5.0, 0);
        engine.handle_frame("RESP;PAGE;red;1;1;v1;%3Cp%3E", -80.0, 5.0, 100);
        drain_events(&mut engine);
        assert_eq!(engine.sync_status(), (true, true));

        // A newer page version starts but stops after one of two parts.
        engine.handle_frame("RESP;PAGE;red;1;2;v2;partial", -80.0, 5.0, 1_000);
        engine.tick(1_000 + PAGE_SLOT_TIMEOUT_MS + 1);

        // The dead slot resets pages sync and a full re-request goes out;
        // the wire has no per-team request.
        assert_eq!(engine.sync_status(), (true, false));
        assert_eq!(
            drain_events(&mut engine),
            [MeshEvent::SyncStatusChanged {
                users: true,
                pages: false
            }]
        );
        let frames = drain_frames(&mut engine);
        assert!(
            frames.iter().any(|frame| frame == "REQ;PAGES;alpha"),
            "expected a fresh pages request: {:?}",
            frames
        );
    }

    #[test]
    fn legacy_pages_payload_emits_one_event_per_team() {
        let mut engine = engine();
        engine.handle_frame("RESP;PAGES;red|%3Cp%3Er%3C%2Fp%3E|10;blue|%3Cp%3Eb%3C%2Fp%3E", -80.0, 5.0, 0);
        let events = drain_events(&mut engine);
        // Two pages plus the status change.
        assert_eq!(events.len(), 3);
        match &events[1] {
            MeshEvent::TeamPageReady { team, html, updated_at } => {
                assert_eq!(team.as_str(), "blue");
                assert_eq!(html.as_str(), "<p>b</p>");
                assert_eq!(updated_at.as_str(), "");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(engine.sync_status(), (false, true));
    }

    #[test]
    fn beacon_emitted_once_synced_and_grace_elapsed() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;alice|h1|red", -80.0, 5.0, 0);
        engine.handle_frame("RESP;PAGES;red|%3Cp%3Er%3C%2Fp%3E", -80.0, 5.0, 0);
        drain_events(&mut engine);

        engine.tick(BEACON_INTERVAL_MS + SYNC_GRACE_MS);
        assert_eq!(drain_frames(&mut engine), ["BEACON;alpha"]);
    }

    #[test]
    fn refresh_users_resets_sync_and_re_requests() {
        let mut engine = engine();
        engine.handle_frame("RESP;USERS;alice|h1|red", -80.0, 5.0, 0);
        drain_events(&mut engine);

        engine.handle_command(NodeCommand::RefreshUsers, 1_000);
        assert_eq!(
            drain_events(&mut engine),
            [MeshEvent::SyncStatusChanged {
                users: false,
                pages: false
            }]
        );
        engine.tick(1_100);
        assert_eq!(drain_frames(&mut engine), ["REQ;USERS;alpha"]);
    }

    #[test]
    fn send_message_encodes_and_remembers_own_id() {
        let mut engine = engine();
        engine.handle_command(
            NodeCommand::SendMessage {
                user: String::try_from("alice").unwrap(),
                object: String::try_from("LED").unwrap(),
                function: String::try_from("ON").unwrap(),
                parameters: String::try_from("node:beta").unwrap(),
            },
            5_000,
        );
        let frames = drain_frames(&mut engine);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("MSG;"));
        assert!(frames[0].ends_with(";alice;3;5;LED;ON;node:beta"));
        assert_eq!(engine.messages().count(), 1);

        // An echo of the node's own frame must not be re-processed.
        let echoed = format!("LORA_TX;{}", frames[0]);
        engine.handle_frame(&echoed, 0.0, 0.0, 5_100);
        assert!(drain_frames(&mut engine).is_empty());
        assert!(drain_events(&mut engine).is_empty());
    }

    #[test]
    fn user_add_message_raises_record_event() {
        let mut engine = engine();
        engine.handle_frame(
            "MSG;m9;portal;1;2000;USER;ADD;name:dave, pwdHash:h9, team:green",
            -80.0,
            5.0,
            0,
        );
        let events = drain_events(&mut engine);
        assert_eq!(events.len(), 2);
        match &events[1] {
            MeshEvent::UserRecordsReady(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].name.as_str(), "dave");
                assert_eq!(records[0].team.as_str(), "green");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
