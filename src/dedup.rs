use heapless::String;

use crate::MAX_MSG_ID_LEN;

pub(crate) type MsgId = String<MAX_MSG_ID_LEN>;

/// Bounded FIFO ring of recently seen message identifiers.
///
/// Membership is a linear scan; insertion always overwrites the oldest slot.
/// An id older than `K` distinct inserts is forgotten, so re-delivery after
/// wraparound is possible. That is the accepted tradeoff for bounded memory.
pub(crate) struct DedupCache<const K: usize> {
    ids: [MsgId; K],
    write_index: usize,
}

impl<const K: usize> DedupCache<K> {
    pub(crate) fn new() -> Self {
        Self {
            ids: [const { String::new() }; K],
            write_index: 0,
        }
    }

    pub(crate) fn seen(&self, msg_id: &str) -> bool {
        let probe = Self::truncate(msg_id);
        !probe.is_empty() && self.ids.iter().any(|id| *id == probe)
    }

    pub(crate) fn remember(&mut self, msg_id: &str) {
        self.ids[self.write_index] = Self::truncate(msg_id);
        self.write_index = (self.write_index + 1) % K;
    }

    // Ids longer than the slot are handled in truncated form on both the
    // lookup and the insert path, so an over-long id still dedups against
    // itself. On this protocol ids are short millisecond counters.
    fn truncate(msg_id: &str) -> MsgId {
        let mut id = MsgId::new();
        for ch in msg_id.chars() {
            if id.push(ch).is_err() {
                break;
            }
        }
        id
    }
}
