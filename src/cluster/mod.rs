//! # Cluster Metadata
//!
//! Read-only collaborator types describing cluster membership and range
//! ownership. A monitor process assembles this state and gossips it to
//! every node; the storage core only consumes it, asking one question:
//! does this key belong to me?
//!
//! ## Model
//!
//! - [`NodeInfo`]: one server's address, PM capacity, and liveness,
//!   versioned so stale gossip never regresses fresher state.
//! - [`RangeGroup`]: contiguous key ranges, each owned by a primary node
//!   (entry 0 of its node list) with optional peers, flagged memory-only
//!   or PM-backed.
//! - [`ClusterMeta`]: the whole picture plus a top-level version.
//!
//! ## Wire Format
//!
//! The codec is a little-endian byte layout, fixed fields first:
//!
//! ```text
//! 8B   version
//! 8B   node_num
//! 48B * MAX_NODE   node table
//! 8B   num_infos
//! per range info:
//!   8B   version
//!   8B   start key length
//!   ..   start key bytes
//!   64B  is_mem flags
//!   64B  node ids
//! ```
//!
//! Node table entries are plain zerocopy structs, so the table section
//! is a straight byte copy both ways. `deserialize(serialize(m)) == m`
//! holds for every well-formed meta.
//!
//! ## Merging
//!
//! [`ClusterMeta::update`] folds a newer snapshot in version-wise: the
//! top-level version gates the whole merge, then node entries and range
//! entries advance individually. Range order never changes at runtime
//! (repartitioning is out of scope), so ranges merge by index.

use std::net::Ipv4Addr;

use eyre::{bail, ensure, Result};
use tracing::warn;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Hard cap on cluster size; node ids fit the 6-bit remote-pointer field.
pub const MAX_NODE: usize = 64;

const NODE_INFO_SIZE: usize = 48;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NodeInfo {
    pub version: u64,
    pub total_pm: u64,
    pub available_pm: u64,
    /// CPU load scaled to thousandths, kept integral for the wire.
    pub cpu_permille: u64,
    pub addr: [u8; 4],
    pub port: u16,
    pub erpc_port: u16,
    pub erpc_listen_port: u16,
    pub node_id: u8,
    pub is_active: u8,
    _pad: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<NodeInfo>() == NODE_INFO_SIZE);

impl NodeInfo {
    pub fn new(node_id: u8, addr: Ipv4Addr, port: u16, total_pm: u64) -> Self {
        Self {
            version: 1,
            total_pm,
            available_pm: total_pm,
            cpu_permille: 0,
            addr: addr.octets(),
            port,
            erpc_port: 0,
            erpc_listen_port: 0,
            node_id,
            is_active: 1,
            _pad: [0; 4],
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }

    pub fn is_active(&self) -> bool {
        self.is_active != 0
    }
}

/// One contiguous key range: `start` up to the next range's start.
/// `nodes[0]` is the primary; further entries are peers, `is_mem[i]`
/// marking memory-only replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeInfo {
    pub version: u64,
    pub start: Vec<u8>,
    pub is_mem: [u8; MAX_NODE],
    pub nodes: [u8; MAX_NODE],
}

impl RangeInfo {
    fn new(start: Vec<u8>, primary: u8) -> Self {
        let mut nodes = [0u8; MAX_NODE];
        nodes[0] = primary;
        Self {
            version: 1,
            start,
            is_mem: [0; MAX_NODE],
            nodes,
        }
    }

    pub fn primary(&self) -> u8 {
        self.nodes[0]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeGroup {
    pub infos: Vec<RangeInfo>,
}

impl RangeGroup {
    /// Registers the primary server for the range starting at `start`.
    /// Node 0 is the monitor and never owns a range.
    pub fn add_main(&mut self, start: &[u8], node_id: u8) -> Result<()> {
        ensure!(node_id != 0, "node 0 is the monitor and cannot own a range");

        if self.infos.iter().any(|info| info.start == start) {
            warn!(?start, "duplicate main server for range, keeping the first");
            return Ok(());
        }
        self.infos.push(RangeInfo::new(start.to_vec(), node_id));
        Ok(())
    }

    fn append_node(&mut self, start: &[u8], node_id: u8, is_mem: bool) -> Result<()> {
        ensure!(node_id != 0, "node 0 is the monitor and cannot join a range");
        ensure!(
            !self.infos.is_empty(),
            "a main server must be added before peers"
        );

        for info in &mut self.infos {
            if info.start == start {
                let idx = node_id as usize;
                if info.nodes[idx] != 0 {
                    return Ok(());
                }
                info.nodes[idx] = node_id;
                info.is_mem[idx] = is_mem as u8;
                return Ok(());
            }
        }
        bail!("no main server found for the range");
    }

    /// Adds a PM-backed peer to an existing range.
    pub fn append_cpu(&mut self, start: &[u8], node_id: u8) -> Result<()> {
        self.append_node(start, node_id, false)
    }

    /// Adds a memory-only peer to an existing range.
    pub fn append_mem(&mut self, start: &[u8], node_id: u8) -> Result<()> {
        self.append_node(start, node_id, true)
    }

    /// Primary node for `key`: the range with the greatest start not
    /// above the key. Keys below every range start have no owner.
    pub fn owner_of(&self, key: &[u8]) -> Option<u8> {
        self.infos
            .iter()
            .filter(|info| info.start.as_slice() <= key)
            .max_by(|a, b| a.start.cmp(&b.start))
            .map(RangeInfo::primary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMeta {
    pub version: u64,
    pub node_num: u64,
    pub nodes: [NodeInfo; MAX_NODE],
    pub group: RangeGroup,
}

impl Default for ClusterMeta {
    fn default() -> Self {
        Self {
            version: 0,
            node_num: 0,
            nodes: [NodeInfo::new_zeroed(); MAX_NODE],
            group: RangeGroup::default(),
        }
    }
}

impl ClusterMeta {
    pub fn node(&self, n: usize) -> &NodeInfo {
        &self.nodes[n]
    }

    pub fn node_mut(&mut self, n: usize) -> &mut NodeInfo {
        &mut self.nodes[n]
    }

    /// Bytes the serialized form occupies.
    pub fn wire_size(&self) -> usize {
        let fixed = 8 + 8 + MAX_NODE * NODE_INFO_SIZE + 8;
        let dynamic: usize = self
            .group
            .infos
            .iter()
            .map(|info| 8 + 8 + info.start.len() + MAX_NODE + MAX_NODE)
            .sum();
        fixed + dynamic
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.node_num.to_le_bytes());
        for node in &self.nodes {
            buf.extend_from_slice(node.as_bytes());
        }
        buf.extend_from_slice(&(self.group.infos.len() as u64).to_le_bytes());
        for info in &self.group.infos {
            buf.extend_from_slice(&info.version.to_le_bytes());
            buf.extend_from_slice(&(info.start.len() as u64).to_le_bytes());
            buf.extend_from_slice(&info.start);
            buf.extend_from_slice(&info.is_mem);
            buf.extend_from_slice(&info.nodes);
        }
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { buf, pos: 0 };

        let version = cursor.u64()?;
        let node_num = cursor.u64()?;
        ensure!(
            node_num as usize <= MAX_NODE,
            "cluster meta claims {} nodes (max {})",
            node_num,
            MAX_NODE
        );

        let mut nodes = [NodeInfo::new_zeroed(); MAX_NODE];
        for node in nodes.iter_mut() {
            let bytes = cursor.take(NODE_INFO_SIZE)?;
            *node = NodeInfo::read_from_bytes(bytes)
                .map_err(|e| eyre::eyre!("malformed node entry: {e:?}"))?;
        }

        let num_infos = cursor.u64()?;
        let mut infos = Vec::with_capacity(num_infos.min(1024) as usize);
        for _ in 0..num_infos {
            let info_version = cursor.u64()?;
            let start_len = cursor.u64()? as usize;
            let start = cursor.take(start_len)?.to_vec();
            let is_mem: [u8; MAX_NODE] = cursor.take(MAX_NODE)?.try_into().expect("fixed span");
            let node_ids: [u8; MAX_NODE] = cursor.take(MAX_NODE)?.try_into().expect("fixed span");
            infos.push(RangeInfo {
                version: info_version,
                start,
                is_mem,
                nodes: node_ids,
            });
        }

        Ok(Self {
            version,
            node_num,
            nodes,
            group: RangeGroup { infos },
        })
    }

    /// Folds a newer snapshot in, entry by entry, never regressing a
    /// version. Range order is fixed for the cluster's lifetime, so
    /// ranges merge by index.
    pub fn update(&mut self, newer: &ClusterMeta) {
        if self.version >= newer.version {
            return;
        }
        self.version = newer.version;
        self.node_num = self.node_num.max(newer.node_num);

        for (mine, theirs) in self.nodes.iter_mut().zip(newer.nodes.iter()) {
            if mine.version < theirs.version {
                *mine = *theirs;
            }
        }

        for (mine, theirs) in self.group.infos.iter_mut().zip(newer.group.infos.iter()) {
            if mine.version < theirs.version {
                mine.version = theirs.version;
                mine.nodes = theirs.nodes;
                mine.is_mem = theirs.is_mem;
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + len <= self.buf.len(),
            "cluster meta truncated at byte {} (need {} more)",
            self.pos,
            len
        );
        let span = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(span)
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte span")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClusterMeta {
        let mut meta = ClusterMeta::default();
        meta.version = 7;
        meta.node_num = 2;
        meta.nodes[1] = NodeInfo::new(1, Ipv4Addr::new(10, 0, 0, 1), 7000, 1 << 30);
        meta.nodes[2] = NodeInfo::new(2, Ipv4Addr::new(10, 0, 0, 2), 7000, 1 << 30);
        meta.group.add_main(b"a", 1).unwrap();
        meta.group.add_main(b"m", 2).unwrap();
        meta.group.append_mem(b"a", 2).unwrap();
        meta
    }

    #[test]
    fn serialize_roundtrip() {
        let meta = sample();
        let wire = meta.serialize();
        assert_eq!(wire.len(), meta.wire_size());

        let back = ClusterMeta::deserialize(&wire).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn deserialize_rejects_truncation() {
        let wire = sample().serialize();
        assert!(ClusterMeta::deserialize(&wire[..wire.len() - 1]).is_err());
        assert!(ClusterMeta::deserialize(&[]).is_err());
    }

    #[test]
    fn owner_is_greatest_start_not_above_key() {
        let meta = sample();
        assert_eq!(meta.group.owner_of(b"apple"), Some(1));
        assert_eq!(meta.group.owner_of(b"melon"), Some(2));
        assert_eq!(meta.group.owner_of(b"zebra"), Some(2));
        assert_eq!(meta.group.owner_of(b"0"), None);
    }

    #[test]
    fn monitor_cannot_own_ranges() {
        let mut group = RangeGroup::default();
        assert!(group.add_main(b"a", 0).is_err());
        assert!(group.append_cpu(b"a", 1).is_err());

        group.add_main(b"a", 1).unwrap();
        assert!(group.append_cpu(b"b", 2).is_err());
        group.append_cpu(b"a", 2).unwrap();
        assert_eq!(group.infos[0].nodes[2], 2);
    }

    #[test]
    fn update_merges_by_version() {
        let mut old = sample();
        let mut newer = old.clone();
        newer.version = 9;
        newer.nodes[1].version = 5;
        newer.nodes[1].available_pm = 123;
        newer.group.infos[0].version = 4;
        newer.group.infos[0].nodes[3] = 3;

        // A stale snapshot changes nothing.
        let stale = old.clone();
        newer_update_noop(&mut old, &stale);

        old.update(&newer);
        assert_eq!(old.version, 9);
        assert_eq!(old.nodes[1].available_pm, 123);
        assert_eq!(old.group.infos[0].nodes[3], 3);
    }

    fn newer_update_noop(meta: &mut ClusterMeta, stale: &ClusterMeta) {
        let before = meta.clone();
        meta.update(stale);
        assert_eq!(*meta, before);
    }
}
