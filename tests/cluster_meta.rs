//! # Cluster Metadata and Ownership Routing
//!
//! The wire codec round-trip property and the ownership behavior the
//! storage core relies on: a node only accepts writes for keys whose
//! range it is the primary of.

use std::net::Ipv4Addr;

use hill::cluster::{ClusterMeta, NodeInfo, RangeGroup};
use hill::store::{Store, StoreConfig, StoreInsert};
use proptest::prelude::*;
use tempfile::tempdir;

fn two_node_meta() -> ClusterMeta {
    let mut meta = ClusterMeta::default();
    meta.version = 1;
    meta.node_num = 2;
    meta.nodes[1] = NodeInfo::new(1, Ipv4Addr::new(192, 168, 0, 1), 7000, 16 << 30);
    meta.nodes[2] = NodeInfo::new(2, Ipv4Addr::new(192, 168, 0, 2), 7000, 16 << 30);
    meta.group.add_main(b"a", 1).unwrap();
    meta.group.add_main(b"m", 2).unwrap();
    meta
}

#[test]
fn writes_route_by_range_ownership() {
    let dir = tempdir().unwrap();
    let mut config = StoreConfig::new(dir.path(), 1);
    config.arena_size = 16 * 1024 * 1024;
    let store = Store::create(config).unwrap();
    let slot = store.register_thread().unwrap();

    store.set_meta(two_node_meta());

    // "apple" falls in ["a", "m"), owned by node 1 (this store).
    assert_eq!(store.insert(slot, b"apple", b"1").unwrap(), StoreInsert::Ok);
    // "melon" falls in ["m", ..), owned by node 2.
    assert_eq!(
        store.insert(slot, b"melon", b"2").unwrap(),
        StoreInsert::NotOwner
    );
}

#[test]
fn gossip_absorb_keeps_newest_entries() {
    let dir = tempdir().unwrap();
    let mut config = StoreConfig::new(dir.path(), 1);
    config.arena_size = 16 * 1024 * 1024;
    let store = Store::create(config).unwrap();

    store.set_meta(two_node_meta());
    let mut newer = two_node_meta();
    newer.version = 5;
    newer.nodes[2].version = 9;
    newer.nodes[2].available_pm = 42;
    store.absorb_meta(&newer);

    assert_eq!(store.meta().nodes[2].available_pm, 42);

    // Stale gossip never regresses the snapshot.
    let mut stale = two_node_meta();
    stale.version = 2;
    stale.nodes[2].available_pm = 7;
    store.absorb_meta(&stale);
    assert_eq!(store.meta().nodes[2].available_pm, 42);
}

fn arb_node_info() -> impl Strategy<Value = NodeInfo> {
    (
        any::<u64>(),
        any::<u64>(),
        any::<[u8; 4]>(),
        any::<u16>(),
        0u8..64,
    )
        .prop_map(|(version, total_pm, addr, port, node_id)| {
            let mut info = NodeInfo::new(node_id, Ipv4Addr::from(addr), port, total_pm);
            info.version = version;
            info.available_pm = total_pm / 2;
            info.cpu_permille = version % 1000;
            info
        })
}

fn arb_meta() -> impl Strategy<Value = ClusterMeta> {
    (
        any::<u64>(),
        proptest::collection::vec(arb_node_info(), 1..8),
        proptest::collection::vec(("[a-z]{1,12}", 1u8..64), 0..6),
    )
        .prop_map(|(version, nodes, ranges)| {
            let mut meta = ClusterMeta::default();
            meta.version = version;
            meta.node_num = nodes.len() as u64;
            for (i, info) in nodes.into_iter().enumerate() {
                meta.nodes[i + 1] = info;
            }
            let mut group = RangeGroup::default();
            for (start, node) in ranges {
                group.add_main(start.as_bytes(), node).unwrap();
            }
            meta.group = group;
            meta
        })
}

proptest! {
    #[test]
    fn serialization_roundtrip(meta in arb_meta()) {
        let wire = meta.serialize();
        prop_assert_eq!(wire.len(), meta.wire_size());
        let back = ClusterMeta::deserialize(&wire).unwrap();
        prop_assert_eq!(back, meta);
    }
}
