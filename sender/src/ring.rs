//! Consistent hash ring used to pick the owning node of a routing key.
//!
//! Every member contributes `replicas` virtual points on a 64-bit FNV-1a ring. A key
//! belongs to the first point at or after its own hash, wrapping around at the end.
//! FNV is unseeded, so assignments survive restarts.

use arc_swap::ArcSwap;
use fnv::FnvHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;

use crate::errors::RoutingError;
use crate::stats::Family;

pub const DEFAULT_REPLICAS: usize = 500;

fn hash64(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Immutable ring snapshot.
#[derive(Debug, Default)]
pub struct HashRing {
    points: BTreeMap<u64, Arc<str>>,
    nodes: Vec<Arc<str>>,
}

impl HashRing {
    pub fn new<I, S>(nodes: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut nodes: Vec<Arc<str>> = nodes.into_iter().map(|n| Arc::from(n.as_ref())).collect();
        // Point collisions are resolved by insertion order, so insert in a fixed order.
        nodes.sort();
        nodes.dedup();

        let mut points = BTreeMap::new();
        for node in &nodes {
            for i in 0..replicas.max(1) {
                let point = hash64(format!("{i}{node}").as_bytes());
                points.insert(point, node.clone());
            }
        }

        Self { points, nodes }
    }

    /// Returns the owning node of `key`, or `None` for an empty ring.
    pub fn get(&self, key: &str) -> Option<&Arc<str>> {
        let hash = hash64(key.as_bytes());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node)
    }

    pub fn nodes(&self) -> &[Arc<str>] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A family's ring. Lookups read the current snapshot without locking; `rebuild`
/// replaces the snapshot as a whole.
#[derive(Debug)]
pub struct NodeRing {
    family: Family,
    replicas: usize,
    ring: ArcSwap<HashRing>,
}

impl NodeRing {
    pub fn new<I, S>(family: Family, nodes: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            family,
            replicas,
            ring: ArcSwap::from_pointee(HashRing::new(nodes, replicas)),
        }
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<str>, RoutingError> {
        self.ring
            .load()
            .get(key)
            .cloned()
            .ok_or(RoutingError::NoAvailableNode(self.family))
    }

    pub fn rebuild<I, S>(&self, nodes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ring = HashRing::new(nodes, self.replicas);
        tracing::info!(
            family = %self.family,
            nodes = ?ring.nodes(),
            "rebuilt hash ring"
        );
        self.ring.store(Arc::new(ring));
    }

    pub fn members(&self) -> Vec<String> {
        self.ring
            .load()
            .nodes()
            .iter()
            .map(|n| n.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn keys(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("host{}/cpu.idle/core={}", i % 37, i))
            .collect()
    }

    #[test]
    fn test_empty_ring() {
        let ring = NodeRing::new(Family::Threshold, Vec::<String>::new(), DEFAULT_REPLICAS);
        assert_eq!(
            ring.resolve("host1/cpu.idle"),
            Err(RoutingError::NoAvailableNode(Family::Threshold))
        );
    }

    #[test]
    fn test_single_node_owns_everything() {
        let ring = HashRing::new(["judge-00"], DEFAULT_REPLICAS);
        for key in keys(100) {
            assert_eq!(ring.get(&key).map(|n| n.as_ref()), Some("judge-00"));
        }
    }

    #[test]
    fn test_resolve_is_stable() {
        let nodes = ["graph-00", "graph-01", "graph-02"];
        let a = NodeRing::new(Family::Storage, nodes, DEFAULT_REPLICAS);
        // Same membership in a different order, built independently.
        let b = NodeRing::new(
            Family::Storage,
            ["graph-02", "graph-00", "graph-01"],
            DEFAULT_REPLICAS,
        );

        for key in keys(1000) {
            let first = a.resolve(&key).unwrap();
            assert_eq!(a.resolve(&key).unwrap(), first);
            assert_eq!(b.resolve(&key).unwrap(), first);
        }
    }

    #[test]
    fn test_all_nodes_receive_keys() {
        let ring = HashRing::new(["a", "b", "c"], DEFAULT_REPLICAS);
        let mut per_node: HashMap<String, usize> = HashMap::new();
        for key in keys(1000) {
            *per_node.entry(ring.get(&key).unwrap().to_string()).or_default() += 1;
        }
        assert_eq!(per_node.len(), 3);
    }

    #[test]
    fn test_removing_a_node_only_moves_its_keys() {
        let before = HashRing::new(["a", "b", "c"], DEFAULT_REPLICAS);
        let after = HashRing::new(["a", "b"], DEFAULT_REPLICAS);

        for key in keys(1000) {
            let old = before.get(&key).unwrap();
            let new = after.get(&key).unwrap();
            if old.as_ref() != "c" {
                assert_eq!(old, new, "key {key} moved although its node stayed");
            }
        }
    }

    #[test]
    fn test_concurrent_resolve_during_rebuild() {
        let ring = Arc::new(NodeRing::new(
            Family::Threshold,
            ["j0", "j1", "j2"],
            DEFAULT_REPLICAS,
        ));
        let expected: Vec<_> = keys(200)
            .iter()
            .map(|k| ring.resolve(k).unwrap())
            .collect();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let ring = ring.clone();
            let expected = expected.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..20 {
                    for (key, node) in keys(200).iter().zip(&expected) {
                        assert_eq!(&ring.resolve(key).unwrap(), node);
                    }
                }
            }));
        }
        // Rebuilding with the same membership must not change any assignment.
        for _ in 0..20 {
            ring.rebuild(["j2", "j1", "j0"]);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.members(), vec!["j0", "j1", "j2"]);
    }
}
