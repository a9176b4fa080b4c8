//! # Crash Recovery Scenarios
//!
//! Simulated crashes around the redo-log protocol. A "crash" here is
//! dropping every in-memory handle at a chosen point in the protocol
//! and reopening the PM regions from the files, exactly what a restart
//! after power loss observes (module to the persist barriers, which the
//! tests cannot cut any finer than the protocol's store order).

use std::sync::Arc;

use hill::index::Olfit;
use hill::memory::{record_bytes, Allocator, PageRef, PmRegion, PAGE_SIZE};
use hill::wal::{LogOp, Logger, LOG_REGION_FILE_SIZE};
use tempfile::tempdir;

type Tree = Olfit<7>;

struct Node {
    region: Arc<PmRegion>,
    log: Arc<PmRegion>,
    allocator: Arc<Allocator>,
    logger: Arc<Logger>,
    tree: Tree,
    slot: usize,
}

fn create_node(dir: &std::path::Path) -> Node {
    let region = Arc::new(PmRegion::create(dir.join("arena"), 256 * PAGE_SIZE).unwrap());
    let log = Arc::new(PmRegion::create(dir.join("log"), LOG_REGION_FILE_SIZE).unwrap());
    let allocator = Arc::new(Allocator::create(region.clone()).unwrap());
    let logger = Arc::new(Logger::create(log.clone()).unwrap());
    let slot = allocator.register_thread().unwrap();
    assert_eq!(Some(slot), logger.register_thread());
    let tree = Tree::create(region.clone(), allocator.clone(), logger.clone(), slot).unwrap();
    Node {
        region,
        log,
        allocator,
        logger,
        tree,
        slot,
    }
}

fn reopen_node(dir: &std::path::Path) -> Node {
    let region = Arc::new(PmRegion::open(dir.join("arena")).unwrap());
    let log = Arc::new(PmRegion::open(dir.join("log")).unwrap());
    let allocator = Arc::new(Allocator::open(region.clone()).unwrap());
    let (logger, _) = Logger::open(log.clone(), &allocator, |_, _| true).unwrap();
    let logger = Arc::new(logger);
    let slot = allocator.register_thread().unwrap();
    assert_eq!(Some(slot), logger.register_thread());
    let tree = Tree::open(region.clone(), allocator.clone(), logger.clone())
        .unwrap()
        .expect("bootstrapped arena");
    Node {
        region,
        log,
        allocator,
        logger,
        tree,
        slot,
    }
}

#[test]
fn crash_before_the_cursor_advances() {
    let dir = tempdir().unwrap();
    let path = dir.path();

    let (victim_page, records_before) = {
        let node = create_node(path);
        node.tree.insert(node.slot, b"alpha", b"1").unwrap();
        node.tree.insert(node.slot, b"beta", b"2").unwrap();

        let busy = node.allocator.busy_page(node.slot);
        let records = node.allocator.page_records(busy);

        // The crash point: a redo record exists and carries the object
        // offset, but the page header never advanced.
        let entry = node.logger.make_log(node.slot, LogOp::Insert).unwrap();
        let page = PageRef::at(&node.region, busy);
        entry.address_cell().set(busy + page.cursor());

        node.region.sync().unwrap();
        node.log.sync().unwrap();
        // Drop without commit: the simulated power cut.
        (busy, records)
    };

    let node = reopen_node(path);
    // Replay saw the uncommitted record, found the bump never happened,
    // and rolled nothing back.
    assert_eq!(node.allocator.page_records(victim_page), records_before);
    assert!(node.tree.search(b"alpha").is_some());
    assert!(node.tree.search(b"gamma").is_none());
}

#[test]
fn crash_after_the_cursor_advances() {
    let dir = tempdir().unwrap();
    let path = dir.path();

    let (victim_page, records_before) = {
        let node = create_node(path);
        node.tree.insert(node.slot, b"alpha", b"1").unwrap();

        let busy = node.allocator.busy_page(node.slot);
        let records = node.allocator.page_records(busy);

        // Full allocation under the record, bytes written, no commit.
        let entry = node.logger.make_log(node.slot, LogOp::Insert).unwrap();
        let cell = entry.address_cell();
        let addr = node
            .allocator
            .allocate(node.slot, 64, Some(&cell))
            .unwrap()
            .unwrap();
        node.region.write_bytes(addr, b"torn insert bytes").unwrap();
        assert_eq!(node.allocator.page_records(addr), records + 1);

        node.region.sync().unwrap();
        node.log.sync().unwrap();
        (busy, records)
    };

    let node = reopen_node(path);
    // The abandoned allocation was rolled back to the pre-insert count.
    assert_eq!(node.allocator.page_records(victim_page), records_before);
    assert!(node.tree.search(b"gamma").is_none());
    assert!(node.tree.search(b"alpha").is_some());
}

#[test]
fn committed_inserts_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path();

    let keys: Vec<String> = (0..300).map(|i| format!("key{:04}", i)).collect();
    {
        let node = create_node(path);
        for key in &keys {
            node.tree
                .insert(node.slot, key.as_bytes(), key.as_bytes())
                .unwrap();
        }
        node.region.sync().unwrap();
        node.log.sync().unwrap();
    }

    let node = reopen_node(path);
    for key in &keys {
        let (ptr, _) = node.tree.search(key.as_bytes()).expect("committed key");
        let bytes = record_bytes(&node.region, ptr.as_local().unwrap()).unwrap();
        assert_eq!(bytes, key.as_bytes());
    }
    assert_eq!(node.tree.stats().keys, keys.len());
}

#[test]
fn recovery_twice_is_a_no_op() {
    let dir = tempdir().unwrap();
    let path = dir.path();

    {
        let node = create_node(path);
        node.tree.insert(node.slot, b"alpha", b"1").unwrap();

        // Leave an uncommitted record behind.
        let entry = node.logger.make_log(node.slot, LogOp::Insert).unwrap();
        let cell = entry.address_cell();
        node.allocator
            .allocate(node.slot, 64, Some(&cell))
            .unwrap()
            .unwrap();
        node.region.sync().unwrap();
        node.log.sync().unwrap();
    }

    let (watermark, records, stats) = {
        let node = reopen_node(path);
        node.region.sync().unwrap();
        node.log.sync().unwrap();
        (
            node.allocator.watermark(),
            node.allocator
                .page_records(node.allocator.busy_page(node.slot)),
            node.tree.stats(),
        )
    };

    let node = reopen_node(path);
    assert_eq!(node.allocator.watermark(), watermark);
    assert_eq!(
        node.allocator
            .page_records(node.allocator.busy_page(node.slot)),
        records
    );
    assert_eq!(node.tree.stats(), stats);
}
