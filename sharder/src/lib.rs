//! Consistent-hash ring mapping shard keys to the nodes of one replica
//! group.
//!
//! Placement must be identical across processes and proxy versions, since
//! data movement between proxies relies on every participant computing the
//! same owner for a key. The hash function (CRC-32/IEEE), the virtual-node
//! count and the virtual-node naming scheme (`identity#i`) are therefore
//! part of the wire contract and must not change.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

/// Virtual nodes contributed by each ring member.
pub const VIRTUAL_NODES: usize = 256;

/// A consistent-hash ring over nodes of type `T`.
///
/// Each node is registered under a stable string identity (the backend URL).
/// Lookup is a binary search over the sorted virtual-node positions,
/// wrapping past the highest position back to the start.
#[derive(Debug)]
pub struct HashRing<T> {
    // (position, node index), sorted by position with the identity string as
    // tie-break so that construction order never influences placement.
    ring: Vec<(u32, usize)>,
    nodes: Vec<T>,
}

impl<T> HashRing<T> {
    pub fn new(members: impl IntoIterator<Item = (String, T)>) -> Self {
        let mut identities = Vec::new();
        let mut nodes = Vec::new();
        for (identity, node) in members {
            identities.push(identity);
            nodes.push(node);
        }

        let mut ring = Vec::with_capacity(nodes.len() * VIRTUAL_NODES);
        for (idx, identity) in identities.iter().enumerate() {
            for i in 0..VIRTUAL_NODES {
                let vnode = format!("{identity}#{i}");
                ring.push((hash(vnode.as_bytes()), idx));
            }
        }
        ring.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| identities[a.1].cmp(&identities[b.1])));

        Self { ring, nodes }
    }

    /// Resolve the owner of `key`, or `None` for an empty ring.
    pub fn get(&self, key: &str) -> Option<&T> {
        if self.ring.is_empty() {
            return None;
        }
        let h = hash(key.as_bytes());
        let mut i = self.ring.partition_point(|&(pos, _)| pos < h);
        if i == self.ring.len() {
            i = 0;
        }
        Some(&self.nodes[self.ring[i].1])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn hash(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
