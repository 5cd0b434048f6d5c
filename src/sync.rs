//! # Sync Scheduler
//!
//! Decides when to (re-)request the two mesh-wide datasets. Users sync
//! gates pages sync: pages are never requested before the users dataset has
//! completed at least once. A transfer that started but stopped producing
//! parts is re-requested on a shorter stall window, with a cooldown so a
//! dead peer does not get hammered. Beacons are suppressed for a short
//! grace window after each request to give the bulk transfer radio time.

use crate::{
    PAGES_SYNC_INTERVAL_MS, SYNC_GRACE_MS, SYNC_RESEND_COOLDOWN_MS, SYNC_STALL_WINDOW_MS,
    USERS_SYNC_INTERVAL_MS,
};

/// Which dataset the engine should request this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncRequest {
    Users,
    Pages,
}

/// Snapshot of a reassembler, taken by the engine before polling.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferStatus {
    pub(crate) in_progress: bool,
    pub(crate) last_part_at_ms: u64,
}

struct DatasetSync {
    synced: bool,
    /// None until the first request goes out, so cold start fires
    /// immediately instead of waiting a full interval.
    last_request_at_ms: Option<u64>,
    last_resend_at_ms: u64,
}

impl DatasetSync {
    const fn new() -> Self {
        Self {
            synced: false,
            last_request_at_ms: None,
            last_resend_at_ms: 0,
        }
    }

    fn request_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        match self.last_request_at_ms {
            None => true,
            Some(at) => now_ms.saturating_sub(at) >= interval_ms,
        }
    }

    fn resend_due(&self, now_ms: u64, transfer: TransferStatus) -> bool {
        transfer.in_progress
            && now_ms.saturating_sub(transfer.last_part_at_ms) >= SYNC_STALL_WINDOW_MS
            && now_ms.saturating_sub(self.last_resend_at_ms) >= SYNC_RESEND_COOLDOWN_MS
    }

    fn record_request(&mut self, now_ms: u64) {
        self.last_request_at_ms = Some(now_ms);
        self.last_resend_at_ms = now_ms;
    }

    fn freshly_requested(&self, now_ms: u64) -> bool {
        !self.synced
            && self
                .last_request_at_ms
                .is_some_and(|at| now_ms.saturating_sub(at) <= SYNC_GRACE_MS)
    }
}

pub(crate) struct SyncScheduler {
    users: DatasetSync,
    pages: DatasetSync,
}

impl SyncScheduler {
    pub(crate) const fn new() -> Self {
        Self {
            users: DatasetSync::new(),
            pages: DatasetSync::new(),
        }
    }

    /// Returns the request to send this tick, if any. At most one request
    /// per poll; users always wins over pages.
    pub(crate) fn poll(
        &mut self,
        now_ms: u64,
        users_transfer: TransferStatus,
        pages_transfer: TransferStatus,
    ) -> Option<SyncRequest> {
        if !self.users.synced {
            if self.users.resend_due(now_ms, users_transfer) {
                log::debug!("users transfer stalled, re-requesting");
                self.users.record_request(now_ms);
                return Some(SyncRequest::Users);
            }
            if !users_transfer.in_progress && self.users.request_due(now_ms, USERS_SYNC_INTERVAL_MS) {
                self.users.record_request(now_ms);
                return Some(SyncRequest::Users);
            }
            return None;
        }
        if !self.pages.synced {
            if self.pages.resend_due(now_ms, pages_transfer) {
                log::debug!("pages transfer stalled, re-requesting");
                self.pages.record_request(now_ms);
                return Some(SyncRequest::Pages);
            }
            if !pages_transfer.in_progress && self.pages.request_due(now_ms, PAGES_SYNC_INTERVAL_MS) {
                self.pages.record_request(now_ms);
                return Some(SyncRequest::Pages);
            }
        }
        None
    }

    /// True while a request is freshly outstanding; the engine skips its
    /// beacon slot in that case to reduce channel contention.
    pub(crate) fn beacon_suppressed(&self, now_ms: u64) -> bool {
        self.users.freshly_requested(now_ms) || self.pages.freshly_requested(now_ms)
    }

    pub(crate) fn mark_users_synced(&mut self) {
        self.users.synced = true;
    }

    pub(crate) fn mark_pages_synced(&mut self) {
        self.pages.synced = true;
    }

    pub(crate) fn reset_users(&mut self) {
        self.users.synced = false;
        self.users.last_request_at_ms = None;
    }

    pub(crate) fn reset_pages(&mut self) {
        self.pages.synced = false;
        self.pages.last_request_at_ms = None;
    }

    pub(crate) fn users_synced(&self) -> bool {
        self.users.synced
    }

    pub(crate) fn pages_synced(&self) -> bool {
        self.pages.synced
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    const IDLE: TransferStatus = TransferStatus {
        in_progress: false,
        last_part_at_ms: 0,
    };

    fn live(last_part_at_ms: u64) -> TransferStatus {
        TransferStatus {
            in_progress: true,
            last_part_at_ms,
        }
    }

    #[test]
    fn cold_start_requests_users_immediately() {
        let mut sync = SyncScheduler::new();
        assert_eq!(sync.poll(0, IDLE, IDLE), Some(SyncRequest::Users));
        // No second request until the interval elapses.
        assert_eq!(sync.poll(1_000, IDLE, IDLE), None);
        assert_eq!(sync.poll(USERS_SYNC_INTERVAL_MS, IDLE, IDLE), Some(SyncRequest::Users));
    }

    #[test]
    fn pages_wait_for_users() {
        let mut sync = SyncScheduler::new();
        assert_eq!(sync.poll(0, IDLE, IDLE), Some(SyncRequest::Users));
        sync.mark_users_synced();
        assert_eq!(sync.poll(10, IDLE, IDLE), Some(SyncRequest::Pages));
        sync.mark_pages_synced();
        assert_eq!(sync.poll(20, IDLE, IDLE), None);
    }

    #[test]
    fn in_progress_transfer_defers_the_interval_timer() {
        let mut sync = SyncScheduler::new();
        assert_eq!(sync.poll(0, IDLE, IDLE), Some(SyncRequest::Users));
        // Still receiving parts: no re-request even past the interval.
        let now = USERS_SYNC_INTERVAL_MS + 1;
        assert_eq!(sync.poll(now, live(now - 1_000), IDLE), None);
    }

    #[test]
    fn stalled_transfer_is_resent_with_cooldown() {
        let mut sync = SyncScheduler::new();
        assert_eq!(sync.poll(0, IDLE, IDLE), Some(SyncRequest::Users));
        let stalled = live(0);
        // Not yet past the stall window.
        assert_eq!(sync.poll(SYNC_STALL_WINDOW_MS - 1, stalled, IDLE), None);
        let now = SYNC_STALL_WINDOW_MS;
        assert_eq!(sync.poll(now, stalled, IDLE), Some(SyncRequest::Users));
        // Cooldown holds the next resend back.
        assert_eq!(sync.poll(now + 1, stalled, IDLE), None);
        assert_eq!(
            sync.poll(now + SYNC_RESEND_COOLDOWN_MS, stalled, IDLE),
            Some(SyncRequest::Users)
        );
    }

    #[test]
    fn refresh_resets_and_requests_again() {
        let mut sync = SyncScheduler::new();
        assert_eq!(sync.poll(0, IDLE, IDLE), Some(SyncRequest::Users));
        sync.mark_users_synced();
        sync.mark_pages_synced();
        sync.reset_users();
        assert!(!sync.users_synced());
        // Reset clears the timer, so the request goes out right away.
        assert_eq!(sync.poll(5, IDLE, IDLE), Some(SyncRequest::Users));
    }

    #[test]
    fn beacon_suppressed_only_within_grace_window() {
        let mut sync = SyncScheduler::new();
        assert!(!sync.beacon_suppressed(0));
        assert_eq!(sync.poll(100, IDLE, IDLE), Some(SyncRequest::Users));
        assert!(sync.beacon_suppressed(100 + SYNC_GRACE_MS));
        assert!(!sync.beacon_suppressed(101 + SYNC_GRACE_MS));
        // Once synced there is nothing outstanding to protect.
        sync.mark_users_synced();
        assert!(!sync.beacon_suppressed(110));
    }
}
