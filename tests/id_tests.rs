use eventfold_registry::id;
use proptest::prelude::*;
use std::collections::HashSet;
use uuid::Uuid;

/// Build a v1 UUID for a 60-bit gregorian timestamp.
fn v1_at(ticks: u64, clock_seq: u16, node: [u8; 6]) -> Uuid {
    let time_low = (ticks & 0xffff_ffff) as u32;
    let time_mid = ((ticks >> 32) & 0xffff) as u16;
    let time_hi = (((ticks >> 48) & 0x0fff) as u16) | 0x1000;
    let mut tail = [0u8; 8];
    tail[0] = 0x80 | ((clock_seq >> 8) as u8 & 0x3f);
    tail[1] = clock_seq as u8;
    tail[2..].copy_from_slice(&node);
    Uuid::from_fields(time_low, time_mid, time_hi, &tail)
}

#[test]
fn test_generated_id_is_32_hex_chars() {
    let id = id::generate();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_generated_id_starts_with_version() {
    assert!(id::generate().starts_with('1'));
}

#[test]
fn test_generated_ids_are_unique() {
    let ids: HashSet<String> = (0..1000).map(|_| id::generate()).collect();
    assert_eq!(ids.len(), 1000);
    assert!(!ids.contains("11e7b68fb373d1a0a33e8fb9afebf642"));
}

#[test]
fn test_from_uuid_reorders_time_fields() {
    let uuid = Uuid::parse_str("b373d1a0-b68f-11e7-a33e-8fb9afebf642").unwrap();
    assert_eq!(id::from_uuid(&uuid), "11e7b68fb373d1a0a33e8fb9afebf642");
}

#[test]
fn test_from_uuid_is_deterministic() {
    let uuid = v1_at(0x1e7_b68f_b373_d1a0, 0x233e, [1, 2, 3, 4, 5, 6]);
    assert_eq!(id::from_uuid(&uuid), id::from_uuid(&uuid));
}

// Lexicographic order of identifiers follows timestamp order, whatever the
// clock sequence and node.
proptest! {
    #[test]
    fn prop_ids_sort_chronologically(
        a in 0u64..(1 << 60),
        b in 0u64..(1 << 60),
        seq_a in any::<u16>(),
        seq_b in any::<u16>(),
        node_a in any::<[u8; 6]>(),
        node_b in any::<[u8; 6]>(),
    ) {
        prop_assume!(a != b);
        let id_a = id::from_uuid(&v1_at(a, seq_a, node_a));
        let id_b = id::from_uuid(&v1_at(b, seq_b, node_b));
        prop_assert_eq!(a < b, id_a < id_b);
    }
}
