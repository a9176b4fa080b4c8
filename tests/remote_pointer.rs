//! # Remote Pointer Encoding
//!
//! The bit-exact contract the RDMA layer depends on: node id and
//! address survive the round trip, the remote tag is always observable,
//! and local words are never mistaken for remote ones.

use hill::remote::{PolymorphicPointer, RemotePointer};
use proptest::prelude::*;

#[test]
fn literal_encoding_scenario() {
    let ptr = RemotePointer::new(7, 0x0000_7fff_dead_beef);

    assert_eq!(ptr.node_id(), 7);
    assert_eq!(ptr.address(), 0x0000_7fff_dead_beef);

    let poly = PolymorphicPointer::remote(ptr);
    assert!(poly.is_remote());
    assert!(!poly.is_local());
    assert!(!poly.is_null());
}

#[test]
fn tag_bits_are_the_discriminator() {
    assert!(RemotePointer::is_remote_word(0b10 << 62));
    assert!(!RemotePointer::is_remote_word(0b01 << 62));
    assert!(!RemotePointer::is_remote_word(0b11 << 62));
    assert!(!RemotePointer::is_remote_word(0));
}

proptest! {
    /// Canonical user-space addresses (47 bits of room) round-trip.
    #[test]
    fn roundtrip_node_and_address(node in 0u8..64, addr in 0u64..(1 << 47)) {
        let ptr = RemotePointer::new(node, addr);
        prop_assert_eq!(ptr.node_id(), node);
        prop_assert_eq!(ptr.address(), addr);
        prop_assert!(RemotePointer::is_remote_word(ptr.raw()));
    }

    /// PM offsets are far below the tag bits, so a local polymorphic
    /// word can never masquerade as remote.
    #[test]
    fn local_offsets_stay_local(off in 1u64..(1 << 47)) {
        let poly = PolymorphicPointer::local(off);
        prop_assert!(poly.is_local());
        prop_assert_eq!(poly.as_local(), Some(off));
    }
}
