//! Versioned, checksummed, optionally compressed binary snapshot format.
//!
//! Layout (all integers big-endian):
//! ```text
//! offset 0   : 8 bytes  magic "ADHSNAP1"
//! offset 8   : 2 bytes  version
//! offset 10  : 1 byte   flags (bit0 = gzip)
//! offset 11  : 1 byte   reserved (0)
//! offset 12  : 2 bytes  checksum_length
//! offset 14  : 8 bytes  payload_length
//! offset 22  : checksum_length bytes  BLAKE2b-256 of payload as stored
//! offset 22+c: payload_length bytes   serialized payload
//! ```

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use blake2::{digest::consts::U32, Blake2b, Digest};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::adaptive::{AdaptiveMap, Backend, BackendKind};
use crate::config::{Policy, StartBackend};
use crate::error::{EngineError, Result};
use crate::table::{chained::ChainedTable, robinhood::RobinHoodTable, Table};

type Blake2b256 = Blake2b<U32>;

const MAGIC: &[u8; 8] = b"ADHSNAP1";
const VERSION: u16 = 1;
const CHECKSUM_LEN: u16 = 32;
const FLAG_GZIP: u8 = 0b0000_0001;
const HEADER_LEN: usize = 22;
const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 256 * 1024 * 1024;

/// The closed set of types a snapshot payload may deserialize into. This is
/// the allowlist boundary: any tag outside this enum simply does not exist
/// in the wire format's type space, so there is nothing for an attacker to
/// smuggle in beyond what these variants' own `Deserialize` impls accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotPayload {
    Chained(ChainedTable),
    RobinHood(RobinHoodTable),
    Adaptive {
        backend_label: BackendKind,
        backend_table: Box<SnapshotPayload>,
        policy: PolicyRecord,
    },
}

/// `Policy` without its (non-serializable) callbacks — matches the spec's
/// "policy_without_callbacks" persisted form. `AdaptiveMap`'s hooks are
/// reattached by the caller after load, never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub max_lf_chaining: f64,
    pub max_group_len: usize,
    pub max_avg_probe_robinhood: f64,
    pub max_tombstone_ratio: f64,
    pub initial_buckets: usize,
    pub groups_per_bucket: usize,
    pub initial_capacity_rh: usize,
    pub incremental_batch: usize,
    pub large_map_warn_threshold: usize,
}

impl From<&Policy> for PolicyRecord {
    fn from(p: &Policy) -> Self {
        PolicyRecord {
            max_lf_chaining: p.max_lf_chaining,
            max_group_len: p.max_group_len,
            max_avg_probe_robinhood: p.max_avg_probe_robinhood,
            max_tombstone_ratio: p.max_tombstone_ratio,
            initial_buckets: p.initial_buckets,
            groups_per_bucket: p.groups_per_bucket,
            initial_capacity_rh: p.initial_capacity_rh,
            incremental_batch: p.incremental_batch,
            large_map_warn_threshold: p.large_map_warn_threshold,
        }
    }
}

impl From<PolicyRecord> for Policy {
    fn from(r: PolicyRecord) -> Self {
        Policy {
            max_lf_chaining: r.max_lf_chaining,
            max_group_len: r.max_group_len,
            max_avg_probe_robinhood: r.max_avg_probe_robinhood,
            max_tombstone_ratio: r.max_tombstone_ratio,
            initial_buckets: r.initial_buckets,
            groups_per_bucket: r.groups_per_bucket,
            initial_capacity_rh: r.initial_capacity_rh,
            incremental_batch: r.incremental_batch,
            large_map_warn_threshold: r.large_map_warn_threshold,
        }
    }
}

pub struct SnapshotCodec {
    pub max_payload_bytes: u64,
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        SnapshotCodec {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

impl SnapshotCodec {
    /// Serialize `payload`, optionally gzip it, checksum it, and write it
    /// atomically via temp-file-then-rename in the same directory as `path`.
    pub fn save(&self, path: &Path, payload: &SnapshotPayload, compress: bool) -> Result<()> {
        let serialized = rmp_serde::to_vec(payload)?;
        let body = if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&serialized)?;
            encoder.finish()?
        } else {
            serialized
        };
        if body.len() as u64 > self.max_payload_bytes {
            return Err(EngineError::PolicyViolation(format!(
                "snapshot payload ({} bytes) exceeds configured maximum ({} bytes)",
                body.len(),
                self.max_payload_bytes
            )));
        }

        let mut hasher = Blake2b256::new();
        hasher.update(&body);
        let checksum = hasher.finalize();

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&VERSION.to_be_bytes());
        header.push(if compress { FLAG_GZIP } else { 0 });
        header.push(0); // reserved
        header.extend_from_slice(&CHECKSUM_LEN.to_be_bytes());
        header.extend_from_slice(&(body.len() as u64).to_be_bytes());

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::Builder::new()
            .prefix(".snapshot-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        temp.write_all(&header)?;
        temp.write_all(&checksum)?;
        temp.write_all(&body)?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| EngineError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Validate header, checksum, and decompress/deserialize into the closed
    /// payload enum. Any structural anomaly surfaces as `BadSnapshot`.
    pub fn load(&self, path: &Path) -> Result<SnapshotPayload> {
        let mut file = File::open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        self.decode(&raw)
    }

    pub fn decode(&self, raw: &[u8]) -> Result<SnapshotPayload> {
        if raw.len() < HEADER_LEN {
            return Err(EngineError::BadSnapshot("truncated header".into()));
        }
        let magic = &raw[0..8];
        if magic != MAGIC {
            return Err(EngineError::BadSnapshot("bad magic".into()));
        }
        let version = u16::from_be_bytes(raw[8..10].try_into().unwrap());
        if version != VERSION {
            return Err(EngineError::BadSnapshot(format!("unsupported version {version}")));
        }
        let flags = raw[10];
        if flags & !FLAG_GZIP != 0 {
            return Err(EngineError::BadSnapshot("unknown flag bits set".into()));
        }
        let reserved = raw[11];
        if reserved != 0 {
            return Err(EngineError::BadSnapshot("reserved byte must be zero".into()));
        }
        let checksum_len = u16::from_be_bytes(raw[12..14].try_into().unwrap()) as usize;
        let payload_len = u64::from_be_bytes(raw[14..22].try_into().unwrap());
        if payload_len > self.max_payload_bytes {
            return Err(EngineError::BadSnapshot(format!(
                "payload length {payload_len} exceeds configured maximum {}",
                self.max_payload_bytes
            )));
        }
        let checksum_start = HEADER_LEN;
        let checksum_end = checksum_start + checksum_len;
        let payload_end = checksum_end + payload_len as usize;
        if raw.len() < payload_end {
            return Err(EngineError::BadSnapshot("truncated payload".into()));
        }
        let stored_checksum = &raw[checksum_start..checksum_end];
        let body = &raw[checksum_end..payload_end];

        let mut hasher = Blake2b256::new();
        hasher.update(body);
        let computed = hasher.finalize();
        if computed.as_slice() != stored_checksum {
            return Err(EngineError::BadSnapshot("checksum mismatch".into()));
        }

        let decompressed;
        let plain: &[u8] = if flags & FLAG_GZIP != 0 {
            let mut decoder = GzDecoder::new(body);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| EngineError::BadSnapshot(format!("gzip decode failed: {e}")))?;
            decompressed = out;
            &decompressed
        } else {
            body
        };

        let payload: SnapshotPayload = rmp_serde::from_slice(plain)?;
        Ok(payload)
    }
}

/// Drains any in-flight migration, then converts an `AdaptiveMap` into its
/// persisted form. Callbacks are never part of the payload.
pub fn adaptive_map_to_payload(map: &mut AdaptiveMap) -> SnapshotPayload {
    map.drain_fully();
    let policy = PolicyRecord::from(map.policy());
    let (kind, table_payload) = match map.backend() {
        Backend::Chained(t) => (BackendKind::Chained, SnapshotPayload::Chained(t.clone())),
        Backend::RobinHood(t) => (BackendKind::RobinHood, SnapshotPayload::RobinHood(t.clone())),
    };
    SnapshotPayload::Adaptive {
        backend_label: kind,
        backend_table: Box::new(table_payload),
        policy,
    }
}

/// Rebuild an `AdaptiveMap` from its persisted form. The caller must
/// reattach hooks afterward (see [`AdaptiveMap::set_hooks`]).
pub fn adaptive_map_from_payload(payload: SnapshotPayload) -> Result<AdaptiveMap> {
    match payload {
        SnapshotPayload::Adaptive {
            backend_label,
            backend_table,
            policy,
        } => {
            let policy: Policy = policy.into();
            let start = match backend_label {
                BackendKind::Chained => StartBackend::Chaining,
                BackendKind::RobinHood => StartBackend::RobinHood,
            };
            let mut map = AdaptiveMap::new(policy, start)?;
            match (*backend_table, backend_label) {
                (SnapshotPayload::Chained(t), BackendKind::Chained) => map.replace_backend_chained(t),
                (SnapshotPayload::RobinHood(t), BackendKind::RobinHood) => {
                    map.replace_backend_robinhood(t)
                }
                _ => {
                    return Err(EngineError::InvariantViolation(
                        "snapshot backend label does not match backend table variant".into(),
                    ))
                }
            }
            Ok(map)
        }
        _ => Err(EngineError::PolicyViolation(
            "expected an Adaptive snapshot payload".into(),
        )),
    }
}

/// Verdict from [`verify`].
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyReport {
    Ok,
    ChainedSizeMismatch { reported: usize, recounted: usize },
    RobinHoodCapacityInvariantBroken { size: usize, tombstones: usize, capacity: usize },
    RobinHoodSizeMismatch { reported: usize, recounted: usize },
}

/// Re-derive each backend's structural invariants from its own contents and
/// compare against its reported counters.
pub fn verify_payload(payload: &SnapshotPayload) -> VerifyReport {
    match payload {
        SnapshotPayload::Chained(t) => {
            let recounted = t.iter().count();
            if recounted == t.len() {
                VerifyReport::Ok
            } else {
                VerifyReport::ChainedSizeMismatch {
                    reported: t.len(),
                    recounted,
                }
            }
        }
        SnapshotPayload::RobinHood(t) => {
            if t.len() + t.tombstones() > t.capacity() {
                return VerifyReport::RobinHoodCapacityInvariantBroken {
                    size: t.len(),
                    tombstones: t.tombstones(),
                    capacity: t.capacity(),
                };
            }
            let recounted = t.iter().count();
            if recounted == t.len() {
                VerifyReport::Ok
            } else {
                VerifyReport::RobinHoodSizeMismatch {
                    reported: t.len(),
                    recounted,
                }
            }
        }
        SnapshotPayload::Adaptive { backend_table, .. } => verify_payload(backend_table),
    }
}

/// If `payload` wraps a Robin Hood table (directly or inside an adaptive
/// map), compact it in place and return `true`. Chained tables are reported
/// by [`verify_payload`] but never mutated here.
pub fn repair_payload(payload: &mut SnapshotPayload) -> bool {
    match payload {
        SnapshotPayload::RobinHood(t) => {
            t.compact();
            true
        }
        SnapshotPayload::Adaptive { backend_table, .. } => repair_payload(backend_table),
        SnapshotPayload::Chained(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::AdaptiveMap;
    use crate::config::StartBackend;

    fn seeded_map(n: usize) -> AdaptiveMap {
        let mut map = AdaptiveMap::new(Policy::default(), StartBackend::Chaining).unwrap();
        for i in 0..n {
            map.put(format!("k{i}").into_bytes(), format!("v{i}").into_bytes());
        }
        map
    }

    #[test]
    fn round_trip_through_bytes_preserves_payload() {
        let mut map = seeded_map(64);
        let payload = adaptive_map_to_payload(&mut map);
        let codec = SnapshotCodec::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        codec.save(&path, &payload, false).unwrap();
        let loaded = codec.load(&path).unwrap();
        let mut rebuilt = adaptive_map_from_payload(loaded).unwrap();
        for i in 0..64 {
            let key = format!("k{i}").into_bytes();
            assert_eq!(rebuilt.get(&key), map.get(&key));
        }
    }

    #[test]
    fn gzip_round_trip_matches_uncompressed() {
        let mut map = seeded_map(64);
        let payload = adaptive_map_to_payload(&mut map);
        let codec = SnapshotCodec::default();
        let dir = tempfile::tempdir().unwrap();
        let plain_path = dir.path().join("plain.bin");
        let gz_path = dir.path().join("gz.bin");
        codec.save(&plain_path, &payload, false).unwrap();
        codec.save(&gz_path, &payload, true).unwrap();
        let from_plain = adaptive_map_from_payload(codec.load(&plain_path).unwrap()).unwrap();
        let mut from_gz = adaptive_map_from_payload(codec.load(&gz_path).unwrap()).unwrap();
        for i in 0..64 {
            let key = format!("k{i}").into_bytes();
            assert_eq!(from_gz.get(&key), from_plain.get(&key));
        }
    }

    #[test]
    fn truncated_header_is_rejected() {
        let codec = SnapshotCodec::default();
        let err = codec.decode(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, EngineError::BadSnapshot(_)));
    }

    #[test]
    fn unknown_flag_bits_are_rejected() {
        let mut map = seeded_map(4);
        let payload = adaptive_map_to_payload(&mut map);
        let codec = SnapshotCodec::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        codec.save(&path, &payload, false).unwrap();
        let mut raw = std::fs::read(&path).unwrap();
        raw[10] = 0b1111_1110;
        let err = codec.decode(&raw).unwrap_err();
        assert!(matches!(err, EngineError::BadSnapshot(_)));
    }

    #[test]
    fn verify_payload_reports_ok_for_freshly_built_tables() {
        let mut map = seeded_map(32);
        let payload = adaptive_map_to_payload(&mut map);
        assert_eq!(verify_payload(&payload), VerifyReport::Ok);
    }

    #[test]
    fn repair_payload_compacts_robinhood_but_not_chained() {
        let mut rh_map = AdaptiveMap::new(
            Policy {
                initial_capacity_rh: 16,
                ..Policy::default()
            },
            StartBackend::RobinHood,
        )
        .unwrap();
        for i in 0..8 {
            rh_map.put(format!("k{i}").into_bytes(), b"v".to_vec());
        }
        for i in 0..4 {
            rh_map.delete(format!("k{i}").into_bytes().as_slice());
        }
        let mut rh_payload = adaptive_map_to_payload(&mut rh_map);
        assert!(repair_payload(&mut rh_payload));

        let mut chained_payload = adaptive_map_to_payload(&mut seeded_map(4));
        assert!(!repair_payload(&mut chained_payload));
    }

    #[test]
    fn policy_round_trips_through_record() {
        let policy = Policy {
            max_lf_chaining: 0.5,
            ..Policy::default()
        };
        let record = PolicyRecord::from(&policy);
        let back: Policy = record.into();
        assert_eq!(back.max_lf_chaining, 0.5);
    }
}
