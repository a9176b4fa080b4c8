//! # OLFIT Index
//!
//! A concurrent B-link tree over PM leaves and volatile inner nodes.
//! The design follows the Lehman-Yao family: every node carries a link
//! to its right sibling at the same level, and a split installs the new
//! sibling through that link before the parent learns about it. A
//! traversal that races a split simply walks one link to the right.
//!
//! ## Concurrency Model
//!
//! - **Readers never block.** A reader snapshots a node's version-lock
//!   word, reads the node, and re-checks the word; any writer activity
//!   in between (even a lock that has not yet bumped the version) makes
//!   the snapshot stale and the reader retries that node.
//! - **Writers lock one node at a time**, with a brief two-node overlap
//!   while handing the lock to a right sibling. Version increments on
//!   unlock are the release edges readers synchronize with.
//!
//! ## Durability Split
//!
//! Leaves live in PM and are allocated through the WAL-guarded page
//! allocator; key and value bytes are persisted before the leaf slot
//! that publishes them. Inner nodes are ordinary heap memory: they are
//! rebuilt from the persisted leaf chain when a node restarts, so no
//! barrier or log record ever covers them.
//!
//! ## Module Organization
//!
//! - `version_lock`: the 64-bit lock word readers validate against
//! - `node`: PM leaves, volatile inners, tagged node pointers
//! - `tree`: traversal, insert/update/scan, splits, rebuild

mod node;
mod tree;
mod version_lock;

pub use node::{InnerInsert, InnerNode, LeafNode, NodePtr, DEGREE, NUM_KEYS};
pub use tree::{InsertOutcome, Olfit, TreeStats, UpdateOutcome};
pub use version_lock::VersionLock;
