use heapless::Vec;

use crate::NodeName;

/// One neighbor observed on the beacon or message path.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbor {
    pub name: NodeName,
    pub rssi: f32,
    pub snr: f32,
    pub last_seen_ms: u64,
}

/// Map of neighbor name to last-seen time and signal quality.
///
/// Upsert is by case-sensitive exact name. Once the table is full new names
/// are silently dropped; existing entries keep updating. Pruning removes
/// entries older than the staleness window and compacts the table, keeping
/// the relative order of the remainder.
pub(crate) struct PresenceTable<const MAX_ONLINE: usize> {
    nodes: Vec<Neighbor, MAX_ONLINE>,
}

impl<const MAX_ONLINE: usize> PresenceTable<MAX_ONLINE> {
    pub(crate) fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub(crate) fn upsert(&mut self, name: &str, rssi: f32, snr: f32, now_ms: u64) {
        for node in self.nodes.iter_mut() {
            if node.name.as_str() == name {
                node.rssi = rssi;
                node.snr = snr;
                node.last_seen_ms = now_ms;
                return;
            }
        }

        let mut owned = NodeName::new();
        if owned.push_str(name).is_err() {
            log::warn!("presence: node name too long, ignoring: {}", name);
            return;
        }
        if self
            .nodes
            .push(Neighbor {
                name: owned,
                rssi,
                snr,
                last_seen_ms: now_ms,
            })
            .is_err()
        {
            log::warn!("presence: table full, ignoring new node: {}", name);
        }
    }

    pub(crate) fn prune(&mut self, now_ms: u64, stale_timeout_ms: u64) {
        let mut i = 0;
        while i < self.nodes.len() {
            if now_ms.saturating_sub(self.nodes[i].last_seen_ms) > stale_timeout_ms {
                log::debug!("presence: offline: {}", self.nodes[i].name.as_str());
                self.nodes.remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub(crate) fn list(&self) -> &[Neighbor] {
        &self.nodes
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn upsert_updates_existing_entry_in_place() {
        let mut table: PresenceTable<4> = PresenceTable::new();
        table.upsert("a", -80.0, 5.0, 100);
        table.upsert("b", -90.0, 2.0, 150);
        table.upsert("a", -70.0, 8.0, 200);

        assert_eq!(table.list().len(), 2);
        assert_eq!(table.list()[0].name.as_str(), "a");
        assert_eq!(table.list()[0].rssi, -70.0);
        assert_eq!(table.list()[0].last_seen_ms, 200);
    }

    #[test]
    fn name_match_is_case_sensitive() {
        let mut table: PresenceTable<4> = PresenceTable::new();
        table.upsert("node", 0.0, 0.0, 1);
        table.upsert("Node", 0.0, 0.0, 2);
        assert_eq!(table.list().len(), 2);
    }

    #[test]
    fn full_table_drops_new_names_but_keeps_updating() {
        let mut table: PresenceTable<2> = PresenceTable::new();
        table.upsert("a", 0.0, 0.0, 1);
        table.upsert("b", 0.0, 0.0, 1);
        table.upsert("c", 0.0, 0.0, 1);
        assert_eq!(table.list().len(), 2);
        assert!(table.list().iter().all(|n| n.name.as_str() != "c"));

        table.upsert("b", -1.0, 1.0, 99);
        assert_eq!(table.list()[1].last_seen_ms, 99);
    }

    #[test]
    fn prune_removes_stale_and_preserves_order() {
        let mut table: PresenceTable<8> = PresenceTable::new();
        table.upsert("old", 0.0, 0.0, 0);
        table.upsert("mid", 0.0, 0.0, 30_000);
        table.upsert("new", 0.0, 0.0, 65_000);

        table.prune(70_000, 60_000);

        let names: std::vec::Vec<&str> = table.list().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["mid", "new"]);
    }

    #[test]
    fn entry_exactly_at_timeout_survives() {
        let mut table: PresenceTable<4> = PresenceTable::new();
        table.upsert("edge", 0.0, 0.0, 1_000);
        table.prune(61_000, 60_000);
        assert_eq!(table.list().len(), 1);
    }
}
