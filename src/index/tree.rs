//! # B-link Tree Operations
//!
//! The tree proper: lock-free descent, move-right loops, WAL-guarded
//! leaf mutation, splits with right-link publication, and the rebuild
//! pass that reconstitutes the volatile inner levels from the persisted
//! leaf chain.
//!
//! ## Traversal
//!
//! Descent reads each inner node optimistically: snapshot the version
//! word, pick the next child, validate, and redo the node on mismatch.
//! `find_next` compares the search key against the node's highkey:
//!
//! - equal: take the rightmost non-null child
//! - below: take the first child whose separator covers the key
//! - above: the node was split under us; follow the right link
//!
//! A null highkey means the node is rightmost at its level and bounds
//! nothing.
//!
//! ## Insert Path
//!
//! The writer descends without locks, locks the candidate leaf, and
//! moves right (hand-over-hand) while the key belongs to a sibling. A
//! non-full leaf takes the new entry in place: the key/value bytes are
//! allocated under an `Insert` redo record, persisted, and only then
//! linked into the slot array. A full leaf splits at its median; the
//! new sibling is fully built and persisted before the left leaf's
//! right link publishes it, then the split key is pushed into the
//! parent level, splitting inners as needed and promoting a new root
//! when the old one overflows. The insert then retries its descent.
//!
//! ## Crash Behavior
//!
//! Every PM allocation the tree makes is bracketed by a redo record.
//! An uncommitted record at recovery names an object that never became
//! reachable; the replay abandons it and rolls the owning page back.
//! Inner nodes need no such care: the rebuild pass derives them from
//! the leaf chain alone, re-stamping leaf parent hints and recomputing
//! leaf highkeys from their last keys.

use std::cmp::Ordering;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::node::{InnerInsert, InnerNode, LeafNode, NodePtr, NUM_KEYS};
use crate::memory::{
    record_bytes, record_size, write_record, Allocator, PmPtr, PmRegion, StoreMeta, PM_NULL,
};
use crate::remote::PolymorphicPointer;
use crate::wal::{LogOp, Logger};

/// Outcome of an insert; all three are normal returns, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key is already present; the leaf was left unchanged.
    RepeatInsert,
    /// The arena is exhausted; no state was mutated.
    NoMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
    NoMemory,
}

/// Counters from a full leaf-chain walk plus the current descent depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub leaves: usize,
    pub keys: usize,
    pub depth: usize,
}

/// Concurrent B-link tree; `N` is the per-node key-slot count.
pub struct Olfit<const N: usize = { NUM_KEYS }> {
    region: Arc<PmRegion>,
    allocator: Arc<Allocator>,
    logger: Arc<Logger>,
    /// Packed [`NodePtr`]; swapped with a CAS on root promotion.
    root: AtomicU64,
    /// First leaf of the chain; never moves once bootstrapped.
    leftmost: PmPtr,
}

impl<const N: usize> Olfit<N> {
    /// Bootstraps a tree in a fresh arena: one empty root leaf,
    /// allocated under a `NodeSplit` redo record, and the bootstrap
    /// block pointing at it.
    pub fn create(
        region: Arc<PmRegion>,
        allocator: Arc<Allocator>,
        logger: Arc<Logger>,
        slot: usize,
    ) -> Result<Self> {
        let entry = logger.make_log(slot, LogOp::NodeSplit)?;
        let cell = entry.address_cell();
        let root = allocator
            .allocate(slot, LeafNode::<N>::SIZE, Some(&cell))?
            .ok_or_else(|| eyre::eyre!("arena exhausted while bootstrapping the index"))?;
        LeafNode::<N>::init(&region, root);
        logger.commit(slot)?;

        StoreMeta::new(root).store(&region)?;
        debug!(root, "index bootstrapped");

        Ok(Self {
            root: AtomicU64::new(NodePtr::<N>::Leaf(root).pack()),
            leftmost: root,
            region,
            allocator,
            logger,
        })
    }

    /// Reopens the tree of a recovered arena, rebuilding the volatile
    /// inner levels from the leaf chain. Returns `None` when the arena
    /// was never bootstrapped.
    pub fn open(
        region: Arc<PmRegion>,
        allocator: Arc<Allocator>,
        logger: Arc<Logger>,
    ) -> Result<Option<Self>> {
        let Some(meta) = StoreMeta::load(&region)? else {
            return Ok(None);
        };
        let leftmost = meta.root();

        let tree = Self {
            root: AtomicU64::new(NodePtr::<N>::Leaf(leftmost).pack()),
            leftmost,
            region,
            allocator,
            logger,
        };
        tree.rebuild()?;
        Ok(Some(tree))
    }

    #[inline]
    fn load_root(&self) -> NodePtr<N> {
        NodePtr::unpack(self.root.load(AtomicOrdering::Acquire))
    }

    #[inline]
    pub fn region(&self) -> &Arc<PmRegion> {
        &self.region
    }

    // ------------------------------------------------------------------
    // Key comparison
    // ------------------------------------------------------------------

    /// Payload of the key record at `off`.
    ///
    /// # Panics
    /// On an out-of-bounds record, which can only mean a corrupted key
    /// pointer; misreading it would be worse than stopping.
    fn key_bytes(&self, off: PmPtr) -> &[u8] {
        record_bytes(&self.region, off).expect("key record within the arena")
    }

    #[inline]
    fn cmp_stored(&self, stored: PmPtr, key: &[u8]) -> Ordering {
        self.key_bytes(stored).cmp(key)
    }

    #[inline]
    fn cmp_records(&self, a: PmPtr, b: PmPtr) -> Ordering {
        self.key_bytes(a).cmp(self.key_bytes(b))
    }

    // ------------------------------------------------------------------
    // Traversal
    // ------------------------------------------------------------------

    /// Next child for `key` within `current`, following the original
    /// OLFIT routing rules.
    fn find_next(&self, current: &InnerNode<N>, key: &[u8]) -> NodePtr<N> {
        let highkey = current.highkey();
        let ord = if highkey == PM_NULL {
            // Rightmost node at its level: unbounded above.
            Ordering::Greater
        } else {
            self.cmp_stored(highkey, key)
        };

        match ord {
            Ordering::Equal => current.rightmost_child().1,
            Ordering::Greater => {
                for i in 0..N {
                    let sep = current.key(i);
                    if sep == PM_NULL || self.cmp_stored(sep, key) != Ordering::Less {
                        return current.child(i);
                    }
                }
                current.child(N)
            }
            Ordering::Less => match NonNull::new(current.right_link()) {
                Some(link) => NodePtr::Inner(link),
                None => current.rightmost_child().1,
            },
        }
    }

    /// Lock-free walk to the leaf that should hold `key`.
    fn descend(&self, key: &[u8]) -> PmPtr {
        loop {
            let mut current = self.load_root();
            loop {
                match current {
                    NodePtr::Leaf(off) => return off,
                    NodePtr::Inner(ptr) => {
                        // SAFETY: inner nodes live until the tree drops.
                        let inner = unsafe { ptr.as_ref() };
                        let snapshot = inner.version_lock().stable();
                        let next = self.find_next(inner, key);
                        if !inner.version_lock().validate(snapshot) {
                            // Redo this node rather than descending on a
                            // torn read.
                            continue;
                        }
                        if next.is_null() {
                            // Empty subtree observation; restart.
                            break;
                        }
                        current = next;
                    }
                    NodePtr::Null => break,
                }
            }
        }
    }

    /// Locks the leaf at `off` and moves right, hand over hand, while
    /// the key belongs to a sibling. Returns the locked target.
    fn lock_target(&self, mut off: PmPtr, key: &[u8]) -> PmPtr {
        LeafNode::<N>::at(&self.region, off).version_lock().lock();
        loop {
            let leaf = LeafNode::<N>::at(&self.region, off);
            let right = leaf.right_link();
            if right == PM_NULL {
                return off;
            }
            let sibling = LeafNode::<N>::at(&self.region, right);
            let first = sibling.key(0);
            if first == PM_NULL || self.cmp_stored(first, key) == Ordering::Greater {
                return off;
            }
            sibling.version_lock().lock();
            leaf.version_lock().unlock();
            off = right;
        }
    }

    /// Slot scan: `Ok(i)` for a present key, `Err(i)` for its insertion
    /// position.
    fn locate(&self, leaf: &LeafNode<N>, key: &[u8]) -> std::result::Result<usize, usize> {
        for i in 0..N {
            let stored = leaf.key(i);
            if stored == PM_NULL {
                return Err(i);
            }
            match self.cmp_stored(stored, key) {
                Ordering::Equal => return Ok(i),
                Ordering::Greater => return Err(i),
                Ordering::Less => {}
            }
        }
        Err(N)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Lock-free point lookup. A remote value comes back unresolved; the
    /// caller decides whether to fetch it over the wire.
    pub fn search(&self, key: &[u8]) -> Option<(PolymorphicPointer, u64)> {
        let mut current = self.load_root();
        loop {
            match current {
                NodePtr::Null => return None,
                NodePtr::Inner(ptr) => {
                    // SAFETY: inner nodes live until the tree drops.
                    let inner = unsafe { ptr.as_ref() };
                    let snapshot = inner.version_lock().stable();
                    let next = self.find_next(inner, key);
                    if !inner.version_lock().validate(snapshot) {
                        continue;
                    }
                    if next.is_null() {
                        return None;
                    }
                    current = next;
                }
                NodePtr::Leaf(off) => {
                    let leaf = LeafNode::<N>::at(&self.region, off);
                    let snapshot = leaf.version_lock().stable();

                    // Move-right probe: the leaf may have split after
                    // the descent chose it.
                    let right = leaf.right_link();
                    if right != PM_NULL {
                        let sibling = LeafNode::<N>::at(&self.region, right);
                        let first = sibling.key(0);
                        if first != PM_NULL && self.cmp_stored(first, key) != Ordering::Greater {
                            if leaf.version_lock().validate(snapshot) {
                                current = NodePtr::Leaf(right);
                            }
                            continue;
                        }
                    }

                    let mut hit = None;
                    for i in 0..N {
                        let stored = leaf.key(i);
                        if stored == PM_NULL {
                            break;
                        }
                        match self.cmp_stored(stored, key) {
                            Ordering::Equal => {
                                hit = Some((
                                    PolymorphicPointer::from_raw(leaf.value(i)),
                                    leaf.value_size(i),
                                ));
                                break;
                            }
                            Ordering::Greater => break,
                            Ordering::Less => {}
                        }
                    }
                    if leaf.version_lock().validate(snapshot) {
                        return hit;
                    }
                    // A writer interleaved; reread this leaf.
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Insert
    // ------------------------------------------------------------------

    pub fn insert(&self, slot: usize, key: &[u8], value: &[u8]) -> Result<InsertOutcome> {
        ensure!(!key.is_empty(), "empty keys are not valid");

        loop {
            let off = self.descend(key);
            let off = self.lock_target(off, key);
            let leaf = LeafNode::<N>::at(&self.region, off);

            match self.locate(leaf, key) {
                Ok(_) => {
                    leaf.version_lock().unlock();
                    return Ok(InsertOutcome::RepeatInsert);
                }
                Err(pos) if !leaf.is_full() => {
                    let done = self.leaf_insert_nonfull(slot, off, pos, key, value)?;
                    leaf.version_lock().unlock();
                    return Ok(if done {
                        InsertOutcome::Inserted
                    } else {
                        InsertOutcome::NoMemory
                    });
                }
                Err(_) => match self.split_leaf(slot, off)? {
                    None => {
                        leaf.version_lock().unlock();
                        return Ok(InsertOutcome::NoMemory);
                    }
                    Some(new_off) => {
                        let split_key = leaf.highkey();
                        leaf.version_lock().unlock();
                        self.push_up(NodePtr::Leaf(off), split_key, NodePtr::Leaf(new_off))?;
                        self.update_highkeys(NodePtr::Leaf(new_off));
                        // Space exists now; take the descent again.
                    }
                },
            }
        }
    }

    /// In-place insert into a locked, non-full leaf.
    ///
    /// The key and value records share one WAL-guarded allocation; the
    /// bytes are durable before the key slot publishes them, and the
    /// redo record commits last.
    fn leaf_insert_nonfull(
        &self,
        slot: usize,
        off: PmPtr,
        pos: usize,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        let leaf = LeafNode::<N>::at(&self.region, off);

        let entry = self.logger.make_log(slot, LogOp::Insert)?;
        let cell = entry.address_cell();
        let key_rec = record_size(key.len());
        let total = key_rec + record_size(value.len());
        let Some(base) = self.allocator.allocate(slot, total, Some(&cell))? else {
            self.logger.abort(slot)?;
            return Ok(false);
        };

        write_record(&self.region, base, key)?;
        write_record(&self.region, base + key_rec as u64, value)?;
        self.region.persist(base, total);

        let count = leaf.key_count();
        for j in (pos..count).rev() {
            leaf.set_key(j + 1, leaf.key(j));
            leaf.set_value(j + 1, leaf.value(j));
            leaf.set_value_size(j + 1, leaf.value_size(j));
        }
        leaf.set_value(pos, PolymorphicPointer::local(base + key_rec as u64).raw());
        leaf.set_value_size(pos, value.len() as u64);
        // The key store publishes the slot.
        leaf.set_key(pos, base);
        self.region.persist(off, LeafNode::<N>::SIZE);

        self.logger.commit(slot)?;
        Ok(true)
    }

    /// Splits a locked, full leaf at its median.
    ///
    /// The new sibling is fully built and persisted before the left
    /// leaf's right link makes it reachable; the `NodeSplit` record
    /// covers the sibling's allocation. Returns the new leaf, or `None`
    /// on arena exhaustion (the tree is untouched).
    fn split_leaf(&self, slot: usize, off: PmPtr) -> Result<Option<PmPtr>> {
        let leaf = LeafNode::<N>::at(&self.region, off);

        let entry = self.logger.make_log(slot, LogOp::NodeSplit)?;
        let cell = entry.address_cell();
        let Some(new_off) = self
            .allocator
            .allocate(slot, LeafNode::<N>::SIZE, Some(&cell))?
        else {
            self.logger.abort(slot)?;
            return Ok(None);
        };

        LeafNode::<N>::init(&self.region, new_off);
        let sibling = LeafNode::<N>::at(&self.region, new_off);

        let mid = N / 2;
        for (j, i) in ((mid + 1)..N).enumerate() {
            sibling.set_key(j, leaf.key(i));
            sibling.set_value(j, leaf.value(i));
            sibling.set_value_size(j, leaf.value_size(i));
        }
        sibling.set_highkey(leaf.highkey());
        sibling.set_right_link(leaf.right_link());
        sibling.set_parent(leaf.parent());
        self.region.persist(new_off, LeafNode::<N>::SIZE);

        self.logger.commit(slot)?;

        // Publication: link first, then bound, then trim from the tail
        // so the slot array stays dense at every step.
        leaf.set_right_link(new_off);
        self.region.persist(off, LeafNode::<N>::SIZE);
        leaf.set_highkey(leaf.key(mid));
        for i in ((mid + 1)..N).rev() {
            leaf.set_key(i, PM_NULL);
            leaf.set_value(i, 0);
            leaf.set_value_size(i, 0);
        }
        self.region.persist(off, LeafNode::<N>::SIZE);

        trace!(left = off, right = new_off, "leaf split");
        Ok(Some(new_off))
    }

    /// Inserts `(split_key, right)` into the parent level of `left`,
    /// splitting inners upward and promoting a new root as needed.
    fn push_up(
        &self,
        mut left: NodePtr<N>,
        mut split_key: PmPtr,
        mut right: NodePtr<N>,
    ) -> Result<()> {
        loop {
            let parent = left.parent(&self.region);

            if parent.is_null() {
                let root_word = self.root.load(AtomicOrdering::Acquire);
                if NodePtr::<N>::unpack(root_word) == left {
                    let new_root_ptr = InnerNode::<N>::alloc();
                    // SAFETY: freshly allocated, unpublished.
                    let new_root = unsafe { new_root_ptr.as_ref() };
                    new_root.set_child(0, left);
                    new_root.set_key(0, split_key);
                    new_root.set_child(1, right);
                    new_root.set_highkey(right.highkey(&self.region));

                    if self
                        .root
                        .compare_exchange(
                            root_word,
                            NodePtr::Inner(new_root_ptr).pack(),
                            AtomicOrdering::AcqRel,
                            AtomicOrdering::Acquire,
                        )
                        .is_ok()
                    {
                        // Parents are hints, stamped after publication.
                        left.set_parent(&self.region, new_root_ptr.as_ptr());
                        right.set_parent(&self.region, new_root_ptr.as_ptr());
                        debug!("root promoted to a new inner node");
                        return Ok(());
                    }
                    // Lost the promotion race; discard and retry.
                    // SAFETY: the node never became reachable.
                    unsafe { drop(Box::from_raw(new_root_ptr.as_ptr())) };
                    continue;
                }
                // A racing splitter is installing the parent; wait for
                // the hint to appear.
                std::hint::spin_loop();
                continue;
            }

            // SAFETY: inner nodes live until the tree drops.
            let mut current = parent;
            unsafe { &*current }.version_lock().lock();

            // The parent may itself have split; walk right until the
            // split key is in range.
            loop {
                let node = unsafe { &*current };
                let highkey = node.highkey();
                if highkey == PM_NULL || self.cmp_records(split_key, highkey) != Ordering::Greater
                {
                    break;
                }
                let Some(link) = NonNull::new(node.right_link()) else {
                    break;
                };
                unsafe { link.as_ref() }.version_lock().lock();
                node.version_lock().unlock();
                current = link.as_ptr();
            }

            let node = unsafe { &*current };
            match node.insert(&self.region, split_key, right, |a, b| self.cmp_records(a, b)) {
                InnerInsert::Done => {
                    node.version_lock().unlock();
                    return Ok(());
                }
                InnerInsert::NeedSplit => {
                    let (new_inner, pushed) = self.split_inner(node, split_key, right);
                    node.version_lock().unlock();
                    left = NodePtr::Inner(NonNull::new(current).expect("locked inner"));
                    right = NodePtr::Inner(new_inner);
                    split_key = pushed;
                }
            }
        }
    }

    /// Splits a locked, full inner node while merging in one more
    /// `(split_key, child)` pair; returns the new right sibling and the
    /// separator pushed to the next level.
    fn split_inner(
        &self,
        inner: &InnerNode<N>,
        split_key: PmPtr,
        child: NodePtr<N>,
    ) -> (NonNull<InnerNode<N>>, PmPtr) {
        // Merge the incoming pair into scratch copies of the arrays.
        let mut keys: SmallVec<[PmPtr; 64]> = (0..N).map(|i| inner.key(i)).collect();
        let mut children: SmallVec<[u64; 72]> = (0..=N).map(|i| inner.child(i).pack()).collect();

        let mut pos = keys.len();
        for (i, &k) in keys.iter().enumerate() {
            if self.cmp_records(k, split_key) == Ordering::Greater {
                pos = i;
                break;
            }
        }
        keys.insert(pos, split_key);
        children.insert(pos + 1, child.pack());

        let total = keys.len();
        let mid = total / 2;
        let pushed = keys[mid];

        let right_ptr = InnerNode::<N>::alloc();
        // SAFETY: freshly allocated, unpublished until the right link is
        // stored below.
        let right = unsafe { right_ptr.as_ref() };
        for (j, i) in ((mid + 1)..total).enumerate() {
            right.set_key(j, keys[i]);
        }
        for (j, i) in ((mid + 1)..=total).enumerate() {
            let grandchild = NodePtr::<N>::unpack(children[i]);
            right.set_child(j, grandchild);
            grandchild.set_parent(&self.region, right_ptr.as_ptr());
        }
        right.set_highkey(inner.highkey());
        right.set_right_link(inner.right_link());
        right.set_parent(inner.parent());

        // Rewrite the left node in place.
        for i in 0..mid {
            inner.set_key(i, keys[i]);
        }
        for i in mid..N {
            inner.set_key(i, PM_NULL);
        }
        for i in 0..=mid {
            inner.set_child(i, NodePtr::unpack(children[i]));
        }
        for i in (mid + 1)..=N {
            inner.set_child(i, NodePtr::Null);
        }
        inner.set_highkey(pushed);
        inner.set_right_link(right_ptr.as_ptr());

        trace!("inner split");
        (right_ptr, pushed)
    }

    /// Walks upward from `current`, refreshing each ancestor's highkey
    /// while `current` is its rightmost child. Corrects the bound
    /// propagation a racing split may have left behind.
    fn update_highkeys(&self, mut current: NodePtr<N>) {
        loop {
            let parent = current.parent(&self.region);
            if parent.is_null() {
                return;
            }
            // SAFETY: inner nodes live until the tree drops.
            let node = unsafe { &*parent };
            if node.rightmost_child().1 != current {
                return;
            }
            node.version_lock().lock();
            if current.parent(&self.region) == parent {
                node.set_highkey(current.highkey(&self.region));
            }
            node.version_lock().unlock();
            current = NodePtr::Inner(NonNull::new(parent).expect("non-null parent"));
        }
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Replaces the value of an existing key. The new value bytes get
    /// their own allocation under an `Update` record; the old bytes die
    /// with their page once every record in it is gone.
    pub fn update(&self, slot: usize, key: &[u8], value: &[u8]) -> Result<UpdateOutcome> {
        let off = self.descend(key);
        let off = self.lock_target(off, key);
        let leaf = LeafNode::<N>::at(&self.region, off);

        let outcome = match self.locate(leaf, key) {
            Err(_) => UpdateOutcome::NotFound,
            Ok(i) => {
                let entry = self.logger.make_log(slot, LogOp::Update)?;
                let cell = entry.address_cell();
                match self
                    .allocator
                    .allocate(slot, record_size(value.len()), Some(&cell))?
                {
                    None => {
                        self.logger.abort(slot)?;
                        UpdateOutcome::NoMemory
                    }
                    Some(base) => {
                        write_record(&self.region, base, value)?;
                        self.region.persist(base, record_size(value.len()));

                        leaf.set_value_size(i, value.len() as u64);
                        leaf.set_value(i, PolymorphicPointer::local(base).raw());
                        self.region.persist(off, LeafNode::<N>::SIZE);
                        self.logger.commit(slot)?;
                        UpdateOutcome::Updated
                    }
                }
            }
        };
        leaf.version_lock().unlock();
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Scan / stats
    // ------------------------------------------------------------------

    /// Collects `start ≤ key ≤ end` by walking the leaf chain. Each
    /// leaf is read optimistically like a point lookup.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, PolymorphicPointer, u64)> {
        let mut out = Vec::new();
        let mut off = self.descend(start);

        while off != PM_NULL {
            let leaf = LeafNode::<N>::at(&self.region, off);
            let snapshot = leaf.version_lock().stable();

            let mut batch = Vec::new();
            let mut past_end = false;
            for i in 0..N {
                let stored = leaf.key(i);
                if stored == PM_NULL {
                    break;
                }
                let bytes = self.key_bytes(stored);
                if bytes < start {
                    continue;
                }
                if bytes > end {
                    past_end = true;
                    break;
                }
                batch.push((
                    bytes.to_vec(),
                    PolymorphicPointer::from_raw(leaf.value(i)),
                    leaf.value_size(i),
                ));
            }
            let next = leaf.right_link();

            if !leaf.version_lock().validate(snapshot) {
                continue;
            }
            out.extend(batch);
            if past_end {
                break;
            }
            off = next;
        }
        out
    }

    /// Full walk of the leaf chain plus the descent depth.
    pub fn stats(&self) -> TreeStats {
        let mut leaves = 0;
        let mut keys = 0;
        let mut off = self.leftmost;
        while off != PM_NULL {
            let leaf = LeafNode::<N>::at(&self.region, off);
            leaves += 1;
            keys += leaf.key_count();
            off = leaf.right_link();
        }

        let mut depth = 1;
        let mut current = self.load_root();
        while let NodePtr::Inner(ptr) = current {
            depth += 1;
            // SAFETY: inner nodes live until the tree drops.
            current = unsafe { ptr.as_ref() }.child(0);
        }

        TreeStats {
            leaves,
            keys,
            depth,
        }
    }

    // ------------------------------------------------------------------
    // Rebuild
    // ------------------------------------------------------------------

    /// Reconstructs the inner levels from the leaf chain.
    ///
    /// Leaf highkeys are recomputed from their last keys (null for the
    /// rightmost leaf) so that bounds are consistent even when a crash
    /// caught a split mid-publication; separators and inner highkeys
    /// derive from those.
    fn rebuild(&self) -> Result<()> {
        let mut level: Vec<NodePtr<N>> = Vec::new();
        let mut off = self.leftmost;
        while off != PM_NULL {
            level.push(NodePtr::Leaf(off));
            off = LeafNode::<N>::at(&self.region, off).right_link();
        }

        for (idx, node) in level.iter().enumerate() {
            let NodePtr::Leaf(off) = *node else {
                unreachable!()
            };
            let leaf = LeafNode::<N>::at(&self.region, off);
            leaf.set_parent(std::ptr::null_mut());
            let count = leaf.key_count();
            if idx + 1 == level.len() {
                leaf.set_highkey(PM_NULL);
            } else if count > 0 {
                leaf.set_highkey(leaf.key(count - 1));
            }
            self.region.persist(off, LeafNode::<N>::SIZE);
        }
        debug!(leaves = level.len(), "rebuilding inner levels");

        while level.len() > 1 {
            let mut next: Vec<NonNull<InnerNode<N>>> = Vec::new();
            for chunk in level.chunks(N + 1) {
                let inner_ptr = InnerNode::<N>::alloc();
                // SAFETY: freshly allocated, exclusively owned here.
                let inner = unsafe { inner_ptr.as_ref() };
                for (j, &child) in chunk.iter().enumerate() {
                    inner.set_child(j, child);
                    child.set_parent(&self.region, inner_ptr.as_ptr());
                    if j + 1 < chunk.len() {
                        inner.set_key(j, child.highkey(&self.region));
                    }
                }
                inner.set_highkey(chunk[chunk.len() - 1].highkey(&self.region));
                next.push(inner_ptr);
            }
            for pair in next.windows(2) {
                // SAFETY: as above.
                unsafe { pair[0].as_ref() }.set_right_link(pair[1].as_ptr());
            }
            level = next.into_iter().map(NodePtr::Inner).collect();
        }

        if let Some(&root) = level.first() {
            self.root.store(root.pack(), AtomicOrdering::Release);
        }
        Ok(())
    }
}

impl<const N: usize> Drop for Olfit<N> {
    fn drop(&mut self) {
        // Inner nodes are heap allocations owned by the tree; leaves
        // belong to the arena. Reclaim the inners with a child-first
        // walk.
        let mut stack: Vec<NonNull<InnerNode<N>>> = Vec::new();
        if let NodePtr::Inner(ptr) = self.load_root() {
            stack.push(ptr);
        }
        while let Some(ptr) = stack.pop() {
            // SAFETY: each inner is reachable exactly once through its
            // parent's child slots; right links stay within one level
            // and are not followed.
            let node = unsafe { ptr.as_ref() };
            for i in 0..=N {
                if let NodePtr::Inner(child) = node.child(i) {
                    stack.push(child);
                }
            }
            // SAFETY: allocated by `InnerNode::alloc`, never freed
            // elsewhere.
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }
}
