use heapless::String;

use crate::{MAX_MSG_ID_LEN, MAX_OBJECT_LEN, MAX_PARAMS_LEN, MAX_USER_LEN};

/// One flooded application message, as kept for later display.
#[derive(Clone, Debug, PartialEq)]
pub struct RoutedMessage {
    pub msg_id: String<MAX_MSG_ID_LEN>,
    pub user: String<MAX_USER_LEN>,
    pub ttl: u8,
    pub timestamp: u32,
    pub object: String<MAX_OBJECT_LEN>,
    pub function: String<MAX_OBJECT_LEN>,
    pub parameters: String<MAX_PARAMS_LEN>,
}

/// Fixed-capacity circular log of routed messages; the oldest entry is
/// overwritten once full. Capacity matches the dedup window.
pub(crate) struct MessageLog<const N: usize> {
    slots: [Option<RoutedMessage>; N],
    write_index: usize,
}

impl<const N: usize> MessageLog<N> {
    pub(crate) fn new() -> Self {
        Self {
            slots: [const { None }; N],
            write_index: 0,
        }
    }

    pub(crate) fn append(&mut self, message: RoutedMessage) {
        self.slots[self.write_index] = Some(message);
        self.write_index = (self.write_index + 1) % N;
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &RoutedMessage> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn message(id: &str) -> RoutedMessage {
        RoutedMessage {
            msg_id: String::try_from(id).unwrap(),
            user: String::try_from("u").unwrap(),
            ttl: 1,
            timestamp: 0,
            object: String::try_from("MSG").unwrap(),
            function: String::try_from("SEND").unwrap(),
            parameters: String::new(),
        }
    }

    #[test]
    fn append_overwrites_oldest_when_full() {
        let mut log: MessageLog<2> = MessageLog::new();
        log.append(message("a"));
        log.append(message("b"));
        log.append(message("c"));

        assert_eq!(log.len(), 2);
        let ids: std::vec::Vec<&str> = log.iter().map(|m| m.msg_id.as_str()).collect();
        assert!(ids.contains(&"b"));
        assert!(ids.contains(&"c"));
        assert!(!ids.contains(&"a"));
    }
}
