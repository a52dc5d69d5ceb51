//! Scenario D: snapshot checksum/tamper detection and round-trip fidelity.

use adhash::adaptive::AdaptiveMap;
use adhash::config::{Policy, StartBackend};
use adhash::error::EngineError;
use adhash::snapshot::{adaptive_map_from_payload, adaptive_map_to_payload, SnapshotCodec};

fn seeded_map(n: usize) -> AdaptiveMap {
    let mut map = AdaptiveMap::new(Policy::default(), StartBackend::Chaining).unwrap();
    for i in 0..n {
        map.put(format!("key-{i}").into_bytes(), format!("value-{i}").into_bytes());
    }
    map
}

#[test]
fn unmodified_round_trip_preserves_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.bin");
    let mut map = seeded_map(1000);

    let payload = adaptive_map_to_payload(&mut map);
    let codec = SnapshotCodec::default();
    codec.save(&path, &payload, false).unwrap();

    let loaded_payload = codec.load(&path).unwrap();
    let mut loaded = adaptive_map_from_payload(loaded_payload).unwrap();

    assert_eq!(loaded.len(), map.len());
    for i in 0..1000 {
        let key = format!("key-{i}").into_bytes();
        assert_eq!(loaded.get(&key), map.get(&key));
    }
}

#[test]
fn compressed_round_trip_preserves_every_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.gz.bin");
    let mut map = seeded_map(500);

    let payload = adaptive_map_to_payload(&mut map);
    let codec = SnapshotCodec::default();
    codec.save(&path, &payload, true).unwrap();

    let loaded_payload = codec.load(&path).unwrap();
    let mut loaded = adaptive_map_from_payload(loaded_payload).unwrap();
    assert_eq!(loaded.len(), 500);
    for i in 0..500 {
        let key = format!("key-{i}").into_bytes();
        assert_eq!(loaded.get(&key), map.get(&key));
    }
}

#[test]
fn flipping_checksum_byte_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.bin");
    let mut map = seeded_map(1000);
    let payload = adaptive_map_to_payload(&mut map);
    let codec = SnapshotCodec::default();
    codec.save(&path, &payload, false).unwrap();

    let mut raw = std::fs::read(&path).unwrap();
    // offset 22 is the first byte of the checksum, per the documented layout.
    raw[22] ^= 0xFF;
    let err = codec.decode(&raw).unwrap_err();
    assert!(matches!(err, EngineError::BadSnapshot(_)));
}

#[test]
fn flipping_payload_byte_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.bin");
    let mut map = seeded_map(1000);
    let payload = adaptive_map_to_payload(&mut map);
    let codec = SnapshotCodec::default();
    codec.save(&path, &payload, false).unwrap();

    let mut raw = std::fs::read(&path).unwrap();
    let payload_start = 22 + 32; // header + checksum
    assert!(raw.len() > payload_start + 10);
    raw[payload_start + 5] ^= 0xFF;
    let err = codec.decode(&raw).unwrap_err();
    assert!(matches!(err, EngineError::BadSnapshot(_)));
}

#[test]
fn unknown_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.bin");
    let mut map = seeded_map(10);
    let payload = adaptive_map_to_payload(&mut map);
    let codec = SnapshotCodec::default();
    codec.save(&path, &payload, false).unwrap();

    let mut raw = std::fs::read(&path).unwrap();
    raw[8] = 0xFF; // version high byte
    let err = codec.decode(&raw).unwrap_err();
    assert!(matches!(err, EngineError::BadSnapshot(_)));
}

#[test]
fn payload_over_configured_max_is_rejected_at_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snap.bin");
    let mut map = seeded_map(2000);
    let payload = adaptive_map_to_payload(&mut map);
    let codec = SnapshotCodec { max_payload_bytes: 16 };
    let err = codec.save(&path, &payload, false).unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(_)));
}

#[test]
fn drain_before_save_leaves_no_migration_in_flight() {
    // Force a migration-prone policy, then save mid-adaptation.
    let policy = Policy {
        max_lf_chaining: 0.1,
        max_group_len: 2,
        initial_buckets: 4,
        groups_per_bucket: 2,
        incremental_batch: 1,
        ..Policy::default()
    };
    let mut map = AdaptiveMap::new(policy, StartBackend::Chaining).unwrap();
    for i in 0..200 {
        map.put(format!("k{i}").into_bytes(), b"v".to_vec());
    }
    // adaptive_map_to_payload drains fully before persisting.
    let payload = adaptive_map_to_payload(&mut map);
    assert!(!map.is_migrating());
    let loaded = adaptive_map_from_payload(payload).unwrap();
    assert_eq!(loaded.len(), map.len());
}
