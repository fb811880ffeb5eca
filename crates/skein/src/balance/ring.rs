//! Consistent-hash ring with virtual nodes.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

pub const DEFAULT_VIRTUAL_NODES: usize = 150;

fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 is 32 bytes"))
}

/// An ordered ring of virtual nodes; a request key maps to the next-greater
/// virtual node, wrapping around at the top.
pub struct HashRing {
    ring: BTreeMap<u64, String>,
    members: BTreeSet<String>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: BTreeMap::new(),
            members: BTreeSet::new(),
            virtual_nodes,
        }
    }

    /// Rebuild only when the member set actually changed, so lookups stay
    /// stable across calls with the same fleet.
    pub fn update(&mut self, instance_ids: &[String]) {
        let incoming: BTreeSet<String> = instance_ids.iter().cloned().collect();
        if incoming == self.members {
            return;
        }
        self.ring.clear();
        for id in &incoming {
            for virtual_index in 0..self.virtual_nodes {
                self.ring.insert(hash_key(&format!("{id}:{virtual_index}")), id.clone());
            }
        }
        self.members = incoming;
    }

    pub fn locate(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let point = hash_key(key);
        self.ring
            .range(point..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, id)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("inst-{i}")).collect()
    }

    #[test]
    fn test_lookup_is_stable() {
        let mut ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        ring.update(&ids(3));
        let first = ring.locate("session-42").unwrap().to_string();
        for _ in 0..100 {
            assert_eq!(ring.locate("session-42").unwrap(), first);
        }
    }

    #[test]
    fn test_update_with_same_members_is_a_noop() {
        let mut ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        ring.update(&ids(3));
        let before = ring.locate("session-1").unwrap().to_string();
        let mut shuffled = ids(3);
        shuffled.reverse();
        ring.update(&shuffled);
        assert_eq!(ring.locate("session-1").unwrap(), before);
    }

    #[test]
    fn test_distribution_is_roughly_uniform() {
        let mut ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        ring.update(&ids(3));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..1000 {
            let id = ring.locate(&format!("s{i}")).unwrap();
            *counts.entry(id.to_string()).or_default() += 1;
        }
        // Within +/- 15% of a uniform third.
        for (_, count) in counts {
            assert!(count as f64 > 1000.0 / 3.0 * 0.85, "count {count}");
            assert!((count as f64) < 1000.0 / 3.0 * 1.15, "count {count}");
        }
    }

    #[test]
    fn test_member_removal_only_moves_its_keys() {
        let mut ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        ring.update(&ids(3));
        let assignments: Vec<(String, String)> = (0..200)
            .map(|i| {
                let key = format!("s{i}");
                let id = ring.locate(&key).unwrap().to_string();
                (key, id)
            })
            .collect();

        ring.update(&ids(2)); // drops inst-2
        for (key, previous) in assignments {
            if previous != "inst-2" {
                assert_eq!(ring.locate(&key).unwrap(), previous);
            }
        }
    }

    #[test]
    fn test_empty_ring_locates_nothing() {
        let ring = HashRing::new(DEFAULT_VIRTUAL_NODES);
        assert!(ring.locate("anything").is_none());
    }
}
