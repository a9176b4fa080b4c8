//! # Index Nodes
//!
//! Two node kinds back the tree, split by where they live:
//!
//! - [`LeafNode`]: resides in PM, addressed by offset, owns the durable
//!   state (key pointers, polymorphic value pointers, sibling links).
//! - [`InnerNode`]: resides in volatile heap memory and is rebuilt from
//!   the leaf chain after a restart; it only routes traversals.
//!
//! Both carry a [`VersionLock`] and expose every field a lock-free reader
//! may observe as an atomic word. Writers mutate under the lock; readers
//! snapshot the lock word around their reads and retry on mismatch, so
//! torn multi-field reads are detected rather than prevented.
//!
//! ## Capacity
//!
//! Nodes are parameterized by `N`, the key-slot count (`DEGREE - 1`).
//! An inner node routes `N + 1` children; the child past the last key
//! slot lives in a dedicated `last_child` word.
//!
//! ## Tagged Node Pointers
//!
//! [`NodePtr`] is the explicit sum of the two node kinds. For storage in
//! a single atomic word (the root slot, inner child slots) it packs into
//! a `u64` using the two low bits as discriminant; both leaf offsets and
//! heap pointers are at least 8-aligned, so the bits are free. A word
//! with an impossible tag panics on unpack instead of misreading memory.
//!
//! ## Parent Back-References
//!
//! `parent` fields are non-owning and possibly stale; the tree treats
//! them as hints, re-validating after locking. A leaf's parent word
//! holds a heap pointer and is meaningless after a restart; the rebuild
//! pass re-stamps it.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use super::version_lock::VersionLock;
use crate::memory::{PmPtr, PmRegion, PM_NULL};

/// Fan-out of the tree with the default key-slot count.
pub const DEGREE: usize = 64;

/// Key slots per node at the default degree.
pub const NUM_KEYS: usize = DEGREE - 1;

const TAG_MASK: u64 = 0b11;
const TAG_LEAF: u64 = 0b01;
const TAG_INNER: u64 = 0b10;

/// Explicit sum of the node kinds, never losing its tag on assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePtr<const N: usize> {
    Null,
    Leaf(PmPtr),
    Inner(NonNull<InnerNode<N>>),
}

impl<const N: usize> NodePtr<N> {
    /// Packs into one word for atomic slots.
    pub fn pack(self) -> u64 {
        match self {
            NodePtr::Null => 0,
            NodePtr::Leaf(off) => {
                debug_assert_eq!(off & TAG_MASK, 0);
                off | TAG_LEAF
            }
            NodePtr::Inner(ptr) => {
                let raw = ptr.as_ptr() as u64;
                debug_assert_eq!(raw & TAG_MASK, 0);
                raw | TAG_INNER
            }
        }
    }

    /// Unpacks a word produced by [`pack`](Self::pack).
    ///
    /// # Panics
    /// On a word whose tag matches neither kind; that is a corrupted
    /// slot, and misreading it as a pointer would be far worse.
    pub fn unpack(raw: u64) -> Self {
        match raw & TAG_MASK {
            _ if raw == 0 => NodePtr::Null,
            TAG_LEAF => NodePtr::Leaf(raw & !TAG_MASK),
            TAG_INNER => NodePtr::Inner(
                NonNull::new((raw & !TAG_MASK) as *mut InnerNode<N>)
                    .expect("non-zero inner word"),
            ),
            _ => panic!("node pointer word {raw:#x} carries an invalid tag"),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, NodePtr::Null)
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodePtr::Leaf(_))
    }

    #[inline]
    pub fn is_inner(&self) -> bool {
        matches!(self, NodePtr::Inner(_))
    }

    /// Upper-bound key of the node, null meaning unbounded.
    pub fn highkey(&self, region: &PmRegion) -> PmPtr {
        match *self {
            NodePtr::Null => PM_NULL,
            NodePtr::Leaf(off) => LeafNode::<N>::at(region, off).highkey(),
            // SAFETY: inner pointers stay valid for the tree's lifetime.
            NodePtr::Inner(ptr) => unsafe { ptr.as_ref() }.highkey(),
        }
    }

    pub fn parent(&self, region: &PmRegion) -> *mut InnerNode<N> {
        match *self {
            NodePtr::Null => std::ptr::null_mut(),
            NodePtr::Leaf(off) => LeafNode::<N>::at(region, off).parent(),
            // SAFETY: as above.
            NodePtr::Inner(ptr) => unsafe { ptr.as_ref() }.parent(),
        }
    }

    pub fn set_parent(&self, region: &PmRegion, parent: *mut InnerNode<N>) {
        match *self {
            NodePtr::Null => {}
            NodePtr::Leaf(off) => LeafNode::<N>::at(region, off).set_parent(parent),
            // SAFETY: as above.
            NodePtr::Inner(ptr) => unsafe { ptr.as_ref() }.set_parent(parent),
        }
    }

}

// ----------------------------------------------------------------------
// Leaf
// ----------------------------------------------------------------------

/// PM-resident leaf. `keys[i]` points at a key record, `values[i]` holds
/// polymorphic pointer bits, `value_sizes[i]` the value length. Slots
/// are sorted and dense; `keys[N - 1] != 0` means full.
#[repr(C)]
pub struct LeafNode<const N: usize> {
    pub(super) version_lock: VersionLock,
    parent: AtomicU64,
    highkey: AtomicU64,
    right_link: AtomicU64,
    keys: [AtomicU64; N],
    values: [AtomicU64; N],
    value_sizes: [AtomicU64; N],
}

impl<const N: usize> LeafNode<N> {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Views the leaf at `off`.
    pub fn at(region: &PmRegion, off: PmPtr) -> &Self {
        debug_assert_ne!(off, PM_NULL);
        debug_assert_eq!(off % 8, 0);
        debug_assert!(off as usize + Self::SIZE <= region.len());
        // SAFETY: in bounds, 8-aligned, and every field is an atomic
        // word, so shared access from any thread is sound. The region
        // never remaps while borrowed.
        unsafe { &*(region.base().add(off as usize) as *const Self) }
    }

    /// Zeroes a freshly allocated leaf; all-zero is the valid empty
    /// state (unlocked version, null links, no keys).
    pub fn init(region: &PmRegion, off: PmPtr) {
        region
            .zero_bytes(off, Self::SIZE)
            .expect("leaf allocation in bounds");
        region.persist(off, Self::SIZE);
    }

    #[inline]
    pub fn version_lock(&self) -> &VersionLock {
        &self.version_lock
    }

    #[inline]
    pub fn parent(&self) -> *mut InnerNode<N> {
        self.parent.load(Ordering::Acquire) as *mut InnerNode<N>
    }

    #[inline]
    pub fn set_parent(&self, parent: *mut InnerNode<N>) {
        self.parent.store(parent as u64, Ordering::Release);
    }

    #[inline]
    pub fn highkey(&self) -> PmPtr {
        self.highkey.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_highkey(&self, key: PmPtr) {
        self.highkey.store(key, Ordering::Release);
    }

    #[inline]
    pub fn right_link(&self) -> PmPtr {
        self.right_link.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_right_link(&self, link: PmPtr) {
        self.right_link.store(link, Ordering::Release);
    }

    #[inline]
    pub fn key(&self, i: usize) -> PmPtr {
        self.keys[i].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_key(&self, i: usize, key: PmPtr) {
        self.keys[i].store(key, Ordering::Release);
    }

    #[inline]
    pub fn value(&self, i: usize) -> u64 {
        self.values[i].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_value(&self, i: usize, value: u64) {
        self.values[i].store(value, Ordering::Release);
    }

    #[inline]
    pub fn value_size(&self, i: usize) -> u64 {
        self.value_sizes[i].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_value_size(&self, i: usize, size: u64) {
        self.value_sizes[i].store(size, Ordering::Release);
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.key(N - 1) != PM_NULL
    }

    /// Number of occupied slots; slots are dense from index 0.
    pub fn key_count(&self) -> usize {
        for i in 0..N {
            if self.key(i) == PM_NULL {
                return i;
            }
        }
        N
    }
}

// ----------------------------------------------------------------------
// Inner
// ----------------------------------------------------------------------

/// Volatile routing node. Child `i` holds keys up to and including
/// `keys[i]`; the child past the last key holds keys up to `highkey`.
#[repr(C)]
pub struct InnerNode<const N: usize> {
    pub(super) version_lock: VersionLock,
    parent: AtomicPtr<InnerNode<N>>,
    highkey: AtomicU64,
    right_link: AtomicPtr<InnerNode<N>>,
    keys: [AtomicU64; N],
    children: [AtomicU64; N],
    last_child: AtomicU64,
}

/// Outcome of a routing-node insert; a full node signals the caller to
/// split rather than failing.
#[derive(Debug, PartialEq, Eq)]
pub enum InnerInsert {
    Done,
    NeedSplit,
}

impl<const N: usize> InnerNode<N> {
    /// Heap-allocates an empty inner node; ownership passes to the tree,
    /// which reclaims all inners on drop.
    pub fn alloc() -> NonNull<InnerNode<N>> {
        let boxed = Box::new(Self {
            version_lock: VersionLock::new(),
            parent: AtomicPtr::new(std::ptr::null_mut()),
            highkey: AtomicU64::new(PM_NULL),
            right_link: AtomicPtr::new(std::ptr::null_mut()),
            keys: std::array::from_fn(|_| AtomicU64::new(PM_NULL)),
            children: std::array::from_fn(|_| AtomicU64::new(0)),
            last_child: AtomicU64::new(0),
        });
        // SAFETY: Box never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    #[inline]
    pub fn version_lock(&self) -> &VersionLock {
        &self.version_lock
    }

    #[inline]
    pub fn parent(&self) -> *mut InnerNode<N> {
        self.parent.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_parent(&self, parent: *mut InnerNode<N>) {
        self.parent.store(parent, Ordering::Release);
    }

    #[inline]
    pub fn highkey(&self) -> PmPtr {
        self.highkey.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_highkey(&self, key: PmPtr) {
        self.highkey.store(key, Ordering::Release);
    }

    #[inline]
    pub fn right_link(&self) -> *mut InnerNode<N> {
        self.right_link.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_right_link(&self, link: *mut InnerNode<N>) {
        self.right_link.store(link, Ordering::Release);
    }

    #[inline]
    pub fn key(&self, i: usize) -> PmPtr {
        self.keys[i].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_key(&self, i: usize, key: PmPtr) {
        self.keys[i].store(key, Ordering::Release);
    }

    /// Child slot `i` for `i` in `0..=N`.
    pub fn child(&self, i: usize) -> NodePtr<N> {
        let raw = if i < N {
            self.children[i].load(Ordering::Acquire)
        } else {
            self.last_child.load(Ordering::Acquire)
        };
        NodePtr::unpack(raw)
    }

    pub fn set_child(&self, i: usize, child: NodePtr<N>) {
        let raw = child.pack();
        if i < N {
            self.children[i].store(raw, Ordering::Release);
        } else {
            self.last_child.store(raw, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.key(N - 1) != PM_NULL
    }

    pub fn key_count(&self) -> usize {
        for i in 0..N {
            if self.key(i) == PM_NULL {
                return i;
            }
        }
        N
    }

    /// Rightmost non-null child and its slot index; `(0, Null)` for a
    /// node with no children at all (an empty subtree).
    pub fn rightmost_child(&self) -> (usize, NodePtr<N>) {
        for i in (0..=N).rev() {
            let child = self.child(i);
            if !child.is_null() {
                return (i, child);
            }
        }
        (0, NodePtr::Null)
    }

    /// Inserts `(split_key, child)` with `child` going to the right of
    /// the key. Caller holds the lock and has found this node
    /// responsible for the key range.
    pub fn insert(
        &self,
        region: &PmRegion,
        split_key: PmPtr,
        child: NodePtr<N>,
        compare: impl Fn(PmPtr, PmPtr) -> std::cmp::Ordering,
    ) -> InnerInsert {
        if self.is_full() {
            return InnerInsert::NeedSplit;
        }

        let count = self.key_count();
        let mut pos = count;
        for i in 0..count {
            if compare(self.key(i), split_key) == std::cmp::Ordering::Greater {
                pos = i;
                break;
            }
        }

        for j in (pos..count).rev() {
            self.set_key(j + 1, self.key(j));
        }
        for j in ((pos + 1)..=count).rev() {
            self.set_child(j + 1, self.child(j));
        }
        self.set_key(pos, split_key);
        self.set_child(pos + 1, child);
        child.set_parent(region, self as *const _ as *mut _);
        InnerInsert::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;
    use tempfile::tempdir;

    type SmallLeaf = LeafNode<3>;
    type SmallInner = InnerNode<3>;

    fn region() -> (tempfile::TempDir, PmRegion) {
        let dir = tempdir().unwrap();
        let region = PmRegion::create(dir.path().join("pm"), 4 * PAGE_SIZE).unwrap();
        (dir, region)
    }

    /// Frees an inner allocated in a test.
    fn release(ptr: NonNull<SmallInner>) {
        // SAFETY: test-local node with no other owners.
        unsafe { drop(Box::from_raw(ptr.as_ptr())) };
    }

    #[test]
    fn node_ptr_pack_roundtrip() {
        let leaf: NodePtr<3> = NodePtr::Leaf(0x4000);
        assert_eq!(NodePtr::unpack(leaf.pack()), leaf);

        let inner_ptr = SmallInner::alloc();
        let inner: NodePtr<3> = NodePtr::Inner(inner_ptr);
        assert_eq!(NodePtr::unpack(inner.pack()), inner);
        assert!(inner.is_inner());

        assert_eq!(NodePtr::<3>::unpack(0), NodePtr::Null);
        release(inner_ptr);
    }

    #[test]
    #[should_panic(expected = "invalid tag")]
    fn node_ptr_rejects_corrupt_tag() {
        let _ = NodePtr::<3>::unpack(0x4003);
    }

    #[test]
    fn leaf_init_is_empty_and_unlocked() {
        let (_dir, region) = region();
        let off = PAGE_SIZE as u64;
        SmallLeaf::init(&region, off);

        let leaf = SmallLeaf::at(&region, off);
        assert_eq!(leaf.key_count(), 0);
        assert!(!leaf.is_full());
        assert!(!leaf.version_lock().is_locked());
        assert_eq!(leaf.right_link(), PM_NULL);
        assert_eq!(leaf.highkey(), PM_NULL);
    }

    #[test]
    fn leaf_fills_to_capacity() {
        let (_dir, region) = region();
        let off = PAGE_SIZE as u64;
        SmallLeaf::init(&region, off);

        let leaf = SmallLeaf::at(&region, off);
        for i in 0..3 {
            leaf.set_key(i, 0x100 + i as u64 * 8);
        }
        assert!(leaf.is_full());
        assert_eq!(leaf.key_count(), 3);
    }

    #[test]
    fn inner_insert_keeps_keys_sorted() {
        let (_dir, region) = region();
        let inner_ptr = SmallInner::alloc();
        // SAFETY: freshly allocated, exclusively owned by the test.
        let inner = unsafe { inner_ptr.as_ref() };

        // Separator ordering fabricated through the comparator: compare
        // the offsets themselves.
        let cmp = |a: u64, b: u64| a.cmp(&b);

        inner.set_child(0, NodePtr::Leaf(0x1000));
        assert_eq!(
            inner.insert(&region, 0x20, NodePtr::Leaf(0x2000), cmp),
            InnerInsert::Done
        );
        assert_eq!(
            inner.insert(&region, 0x10, NodePtr::Leaf(0x3000), cmp),
            InnerInsert::Done
        );

        assert_eq!(inner.key(0), 0x10);
        assert_eq!(inner.key(1), 0x20);
        assert_eq!(inner.child(0), NodePtr::Leaf(0x1000));
        assert_eq!(inner.child(1), NodePtr::Leaf(0x3000));
        assert_eq!(inner.child(2), NodePtr::Leaf(0x2000));

        assert_eq!(
            inner.insert(&region, 0x30, NodePtr::Leaf(0x4000), cmp),
            InnerInsert::Done
        );
        assert!(inner.is_full());
        assert_eq!(
            inner.insert(&region, 0x40, NodePtr::Leaf(0x5000), cmp),
            InnerInsert::NeedSplit
        );
        release(inner_ptr);
    }

    #[test]
    fn rightmost_child_scans_from_the_end() {
        let (_dir, _region) = region();
        let inner_ptr = SmallInner::alloc();
        // SAFETY: freshly allocated, exclusively owned by the test.
        let inner = unsafe { inner_ptr.as_ref() };

        assert_eq!(inner.rightmost_child(), (0, NodePtr::Null));

        inner.set_child(0, NodePtr::Leaf(0x1000));
        inner.set_child(1, NodePtr::Leaf(0x2000));
        assert_eq!(inner.rightmost_child(), (1, NodePtr::Leaf(0x2000)));
        release(inner_ptr);
    }
}
