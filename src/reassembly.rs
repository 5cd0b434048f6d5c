//! # Chunked Reassembly
//!
//! Bulk payloads do not fit one radio frame, so peers split them into
//! numbered parts (`1..=total`) and this module reconstructs them from
//! possibly out-of-order, possibly duplicated deliveries.
//!
//! Two shapes exist:
//! - [`StreamReassembler`]: a single in-flight transfer, used for the users
//!   and pages datasets. Completion joins parts with a `;` field separator
//!   where the chunk boundary does not already carry one.
//! - [`PagePool`]: a small fixed pool of parallel per-team transfers for
//!   `RESP;PAGE` frames, keyed by team name. Chunks carry pre-escaped
//!   content and are concatenated without separators.
//!
//! A transfer whose parts stop arriving is reclaimed after a timeout; the
//! next part then starts a fresh transfer.

use heapless::String;

use crate::{MAX_CHUNK_LEN, MAX_COMBINED_LEN, MAX_STAMP_LEN, MAX_TEAM_LEN};

pub(crate) type ChunkString = String<MAX_CHUNK_LEN>;
pub(crate) type CombinedPayload = String<MAX_COMBINED_LEN>;
pub(crate) type TeamName = String<MAX_TEAM_LEN>;
pub(crate) type UpdatedAt = String<MAX_STAMP_LEN>;

/// Accumulator for one multi-part transfer.
pub(crate) struct StreamReassembler<const MAX_PARTS: usize> {
    /// Declared part count of the in-flight transfer; 0 when idle.
    expected_parts: usize,
    received_parts: usize,
    parts: [Option<ChunkString>; MAX_PARTS],
    last_part_at_ms: u64,
    timeout_ms: u64,
    /// Insert a `;` between adjacent parts unless the boundary already has
    /// one. Dataset streams carry `;`-joined entries; page chunks do not.
    insert_separators: bool,
}

impl<const MAX_PARTS: usize> StreamReassembler<MAX_PARTS> {
    pub(crate) fn with(timeout_ms: u64, insert_separators: bool) -> Self {
        Self {
            expected_parts: 0,
            received_parts: 0,
            parts: [const { None }; MAX_PARTS],
            last_part_at_ms: 0,
            timeout_ms,
            insert_separators,
        }
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.expected_parts > 0
    }

    pub(crate) fn last_part_at_ms(&self) -> u64 {
        self.last_part_at_ms
    }

    pub(crate) fn is_stale(&self, now_ms: u64) -> bool {
        self.in_progress() && now_ms.saturating_sub(self.last_part_at_ms) > self.timeout_ms
    }

    pub(crate) fn reset(&mut self) {
        self.expected_parts = 0;
        self.received_parts = 0;
        for part in self.parts.iter_mut() {
            *part = None;
        }
    }

    /// Feeds one part. Returns the combined payload when the transfer
    /// completes. Out-of-range indices and oversized chunks are dropped;
    /// duplicate indices are ignored without touching the stored chunk.
    pub(crate) fn on_part(&mut self, index: u32, total: u32, payload: &str, now_ms: u64) -> Option<CombinedPayload> {
        if total == 0 || total as usize > MAX_PARTS {
            log::debug!("reassembly: part total {} out of range, dropping", total);
            return None;
        }
        if index == 0 || index > total {
            log::debug!("reassembly: part index {}/{} out of range, dropping", index, total);
            return None;
        }
        let Ok(chunk) = ChunkString::try_from(payload) else {
            log::warn!("reassembly: chunk longer than {} bytes, dropping", MAX_CHUNK_LEN);
            return None;
        };

        if self.is_stale(now_ms) {
            log::debug!(
                "reassembly: transfer stalled at {}/{} parts, restarting",
                self.received_parts,
                self.expected_parts
            );
            self.reset();
        }
        if self.in_progress() && self.expected_parts != total as usize {
            log::debug!(
                "reassembly: part count changed {} -> {}, restarting",
                self.expected_parts,
                total
            );
            self.reset();
        }
        if !self.in_progress() {
            self.expected_parts = total as usize;
        }

        let slot = (index - 1) as usize;
        if self.parts[slot].is_none() {
            self.parts[slot] = Some(chunk);
            self.received_parts += 1;
            self.last_part_at_ms = now_ms;
        }

        if self.received_parts == self.expected_parts {
            let combined = self.combine();
            self.reset();
            return Some(combined);
        }
        None
    }

    fn combine(&self) -> CombinedPayload {
        let mut combined = CombinedPayload::new();
        for part in self.parts.iter().take(self.expected_parts).flatten() {
            if self.insert_separators
                && !combined.is_empty()
                && !combined.ends_with(';')
                && !part.starts_with(';')
            {
                let _ = combined.push(';');
            }
            let _ = combined.push_str(part);
        }
        combined
    }
}

struct PageSlot<const MAX_PARTS: usize> {
    team: TeamName,
    updated_at: UpdatedAt,
    stream: StreamReassembler<MAX_PARTS>,
}

/// A fixed pool of parallel keyed transfers, one per team page.
pub(crate) struct PagePool<const SLOTS: usize, const MAX_PARTS: usize> {
    slots: [Option<PageSlot<MAX_PARTS>>; SLOTS],
    timeout_ms: u64,
}

impl<const SLOTS: usize, const MAX_PARTS: usize> PagePool<SLOTS, MAX_PARTS> {
    pub(crate) fn with(timeout_ms: u64) -> Self {
        Self {
            slots: [const { None }; SLOTS],
            timeout_ms,
        }
    }

    /// Feeds one `RESP;PAGE` chunk. Returns `(team, combined, updated_at)`
    /// when a page completes; the combined text is still url-encoded.
    pub(crate) fn on_part(
        &mut self,
        team: &str,
        updated_at: &str,
        index: u32,
        total: u32,
        chunk: &str,
        now_ms: u64,
    ) -> Option<(TeamName, CombinedPayload, UpdatedAt)> {
        let slot_index = match self.find_slot(team, now_ms) {
            Some(slot_index) => slot_index,
            None => {
                log::warn!("page pool: no free slot for team {}, dropping part", team);
                return None;
            }
        };

        if self.slots[slot_index].is_none() {
            let (Ok(team), Ok(updated_at)) = (TeamName::try_from(team), UpdatedAt::try_from(updated_at)) else {
                log::warn!("page pool: team or timestamp too long, dropping part");
                return None;
            };
            self.slots[slot_index] = Some(PageSlot {
                team,
                updated_at,
                stream: StreamReassembler::with(self.timeout_ms, false),
            });
        }

        let Some(slot) = self.slots[slot_index].as_mut() else {
            return None;
        };

        // A different updatedAt for the same team means a newer page version
        // started mid-transfer; never mix chunks of two versions.
        if slot.updated_at.as_str() != updated_at {
            log::debug!("page pool: page version changed for team {}, restarting", team);
            slot.stream.reset();
            slot.updated_at = match UpdatedAt::try_from(updated_at) {
                Ok(updated_at) => updated_at,
                Err(_) => {
                    self.slots[slot_index] = None;
                    return None;
                }
            };
        }

        if let Some(combined) = slot.stream.on_part(index, total, chunk, now_ms) {
            let team = slot.team.clone();
            let updated_at = slot.updated_at.clone();
            self.slots[slot_index] = None;
            return Some((team, combined, updated_at));
        }
        None
    }

    /// Drops every slot whose transfer has gone stale. Returns true when at
    /// least one slot was reclaimed, so the caller can re-request the whole
    /// pages dataset (the protocol has no per-team request primitive).
    pub(crate) fn reclaim_stale(&mut self, now_ms: u64) -> bool {
        let mut reclaimed = false;
        for slot_opt in self.slots.iter_mut() {
            if let Some(slot) = slot_opt {
                if slot.stream.is_stale(now_ms) {
                    log::debug!("page pool: transfer for team {} timed out", slot.team.as_str());
                    *slot_opt = None;
                    reclaimed = true;
                }
            }
        }
        reclaimed
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.slots.iter().any(|slot| slot.is_some())
    }

    /// Most recent part arrival over all live slots; 0 when the pool is
    /// idle. The scheduler uses this for its stall check.
    pub(crate) fn latest_part_at_ms(&self) -> u64 {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.stream.last_part_at_ms())
            .max()
            .unwrap_or(0)
    }

    /// Picks the slot for `team`: an existing one, else a free one, else a
    /// stale one to reclaim. `None` when the pool is saturated with live
    /// transfers for other teams.
    fn find_slot(&mut self, team: &str, now_ms: u64) -> Option<usize> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.team.as_str() == team))
        {
            return Some(index);
        }
        if let Some(index) = self.slots.iter().position(|slot| slot.is_none()) {
            return Some(index);
        }
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.stream.is_stale(now_ms)))
        {
            self.slots[index] = None;
            return Some(index);
        }
        None
    }
}
