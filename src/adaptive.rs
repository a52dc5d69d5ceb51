//! The adaptation core: owns exactly one active backend, an optional
//! migration target, and the policy that decides when to switch.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{Policy, StartBackend};
use crate::error::Result;
use crate::hash::next_power_of_two;
use crate::table::{chained::ChainedTable, robinhood::RobinHoodTable, HealthSignals, Key, Table, Value};

/// Which concrete backend is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    Chained,
    RobinHood,
}

impl BackendKind {
    pub fn label(self) -> &'static str {
        match self {
            BackendKind::Chained => "chaining",
            BackendKind::RobinHood => "robinhood",
        }
    }
}

/// The two concrete backends, tagged rather than behind a trait object so
/// migration is a value move, not a vtable swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Backend {
    Chained(ChainedTable),
    RobinHood(RobinHoodTable),
}

impl Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Chained(_) => BackendKind::Chained,
            Backend::RobinHood(_) => BackendKind::RobinHood,
        }
    }

    fn put(&mut self, key: Key, value: Value) {
        match self {
            Backend::Chained(t) => t.put(key, value),
            Backend::RobinHood(t) => t.put(key, value),
        }
    }

    fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Backend::Chained(t) => t.get(key),
            Backend::RobinHood(t) => t.get(key),
        }
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        match self {
            Backend::Chained(t) => t.delete(key),
            Backend::RobinHood(t) => t.delete(key),
        }
    }

    fn len(&self) -> usize {
        match self {
            Backend::Chained(t) => t.len(),
            Backend::RobinHood(t) => t.len(),
        }
    }

    fn health(&self) -> HealthSignals {
        match self {
            Backend::Chained(t) => t.health(),
            Backend::RobinHood(t) => t.health(),
        }
    }

    fn iter_entries(&self) -> Box<dyn Iterator<Item = (Key, Value)> + '_> {
        match self {
            Backend::Chained(t) => t.iter_entries(),
            Backend::RobinHood(t) => t.iter_entries(),
        }
    }
}

/// In-flight migration state: a target backend being populated from a
/// resumable cursor over the active backend's entries.
struct Migration {
    target_kind: BackendKind,
    target_table: Backend,
    cursor: std::vec::IntoIter<(Key, Value)>,
    /// Keys deleted since migration start whose cursor entry (a snapshot
    /// taken at `begin_migration`) has not yet been drained. Without this,
    /// draining the stale entry later would resurrect a key the caller
    /// already deleted.
    deleted_since_start: std::collections::HashSet<Key>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("target_kind", &self.target_kind)
            .finish()
    }
}

/// Side-effect-only callbacks fired on migration completion and compaction.
/// Never invoked with a mutable view of the map; must not mutate map state.
#[derive(Default)]
pub struct Hooks {
    pub on_migration: Option<Box<dyn FnMut(&str, &str)>>,
    pub on_compaction: Option<Box<dyn FnMut()>>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_migration", &self.on_migration.is_some())
            .field("on_compaction", &self.on_compaction.is_some())
            .finish()
    }
}

/// A map that transparently migrates between a chained and a Robin Hood
/// backend based on live health signals.
#[derive(Debug)]
pub struct AdaptiveMap {
    backend: Backend,
    name: BackendKind,
    migration: Option<Migration>,
    policy: Policy,
    hooks: Hooks,
}

impl AdaptiveMap {
    pub fn new(policy: Policy, start: StartBackend) -> Result<Self> {
        let backend = match start {
            StartBackend::Chaining => {
                Backend::Chained(ChainedTable::new(policy.initial_buckets, policy.groups_per_bucket)?)
            }
            StartBackend::RobinHood => Backend::RobinHood(RobinHoodTable::new(policy.initial_capacity_rh)?),
        };
        let name = backend.kind();
        info!("adaptive map started on {}", name.label());
        Ok(AdaptiveMap {
            backend,
            name,
            migration: None,
            policy,
            hooks: Hooks::default(),
        })
    }

    pub fn set_hooks(&mut self, hooks: Hooks) {
        self.hooks = hooks;
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// `"<src> -> <dst> (migrating)"` while a migration is in flight, else
    /// the bare backend name.
    pub fn backend_label(&self) -> String {
        match &self.migration {
            Some(m) => format!("{} -> {} (migrating)", self.name.label(), m.target_kind.label()),
            None => self.name.label().to_string(),
        }
    }

    pub fn is_migrating(&self) -> bool {
        self.migration.is_some()
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current health signals of the active backend (ignoring an in-flight target).
    pub fn health(&self) -> HealthSignals {
        self.backend.health()
    }

    /// Borrow the active backend, only after fully draining any migration.
    /// Use this when the caller needs the promoted, settled backend (e.g.
    /// before a snapshot). For a passive read during an in-flight migration
    /// (telemetry sampling), use [`Self::active_backend`] instead, which
    /// never forces the migration to completion.
    pub fn backend(&mut self) -> &Backend {
        self.drain_fully();
        &self.backend
    }

    /// Borrow the currently active backend without draining an in-flight
    /// migration. Telemetry sampling (probe histogram, key heatmap) reads
    /// this so that periodic tick emission never forces a migration that
    /// was deliberately spread across `incremental_batch`-sized steps to
    /// complete synchronously.
    pub fn active_backend(&self) -> &Backend {
        &self.backend
    }

    /// Replace the active backend with a freshly loaded chained table,
    /// e.g. when rebuilding an `AdaptiveMap` from a snapshot payload.
    pub fn replace_backend_chained(&mut self, table: ChainedTable) {
        self.backend = Backend::Chained(table);
        self.name = BackendKind::Chained;
        self.migration = None;
    }

    /// Replace the active backend with a freshly loaded Robin Hood table.
    pub fn replace_backend_robinhood(&mut self, table: RobinHoodTable) {
        self.backend = Backend::RobinHood(table);
        self.name = BackendKind::RobinHood;
        self.migration = None;
    }

    fn begin_migration(&mut self, target: BackendKind) -> Result<()> {
        let size_est = self.backend.len();
        if size_est >= self.policy.large_map_warn_threshold {
            warn!(
                "large map migration starting (size={}, target={})",
                size_est,
                target.label()
            );
        }
        let target_table = match target {
            BackendKind::RobinHood => {
                let hint = self.policy.initial_capacity_rh.max(size_est.max(1));
                let rounded = next_power_of_two(hint);
                if rounded != hint {
                    warn!(
                        "rounded robinhood migration capacity from {} to {} (power-of-two requirement)",
                        hint, rounded
                    );
                }
                Backend::RobinHood(RobinHoodTable::new(rounded)?)
            }
            BackendKind::Chained => Backend::Chained(ChainedTable::new(
                self.policy.initial_buckets,
                self.policy.groups_per_bucket,
            )?),
        };
        let entries: Vec<(Key, Value)> = self.backend.iter_entries().collect();
        info!("migration started: {} -> {}", self.name.label(), target.label());
        self.migration = Some(Migration {
            target_kind: target,
            target_table,
            cursor: entries.into_iter(),
            deleted_since_start: std::collections::HashSet::new(),
        });
        Ok(())
    }

    /// Advance the migration cursor by up to `incremental_batch` entries.
    /// A no-op when no migration is in flight (idempotent at a stable state).
    pub fn drain_batch(&mut self) {
        let batch = self.policy.incremental_batch;
        let Some(migration) = self.migration.as_mut() else {
            return;
        };
        let mut migrated = 0usize;
        for _ in 0..batch {
            match migration.cursor.next() {
                Some((k, v)) => {
                    // The cursor entry is a snapshot taken at migration start; a
                    // direct write or delete against this key may have landed in
                    // `target_table` (or removed it from consideration) since
                    // then and must win over this stale copy.
                    if migration.deleted_since_start.remove(&k) {
                        // deleted before the cursor reached it, never re-inserted
                    } else if migration.target_table.get(&k).is_none() {
                        migration.target_table.put(k, v);
                    }
                    migrated += 1;
                }
                None => {
                    let finished = self.migration.take().unwrap();
                    let old = self.name;
                    self.backend = finished.target_table;
                    self.name = finished.target_kind;
                    info!("migration complete, now on backend={}", self.name.label());
                    if let Some(cb) = self.hooks.on_migration.as_mut() {
                        cb(old.label(), self.name.label());
                    }
                    return;
                }
            }
        }
        debug!("migrated {} entries (target={:?})", migrated, migration.target_kind);
    }

    /// Drain until no migration remains in flight.
    pub fn drain_fully(&mut self) {
        while self.migration.is_some() {
            self.drain_batch();
        }
    }

    fn maintenance(&mut self) {
        self.drain_batch();
        if self.migration.is_some() {
            return;
        }
        match &mut self.backend {
            Backend::Chained(t) => {
                let lf = t.load_factor();
                let mg = t.max_group_len();
                if lf > self.policy.max_lf_chaining || mg > self.policy.max_group_len {
                    if let Err(e) = self.begin_migration(BackendKind::RobinHood) {
                        warn!("migration aborted: {e}");
                    }
                }
            }
            Backend::RobinHood(t) => {
                let ap = t.avg_probe_estimate();
                if ap > self.policy.max_avg_probe_robinhood {
                    if let Err(e) = self.begin_migration(BackendKind::Chained) {
                        warn!("migration aborted: {e}");
                    }
                } else if t.tombstone_ratio() > self.policy.max_tombstone_ratio {
                    info!("auto-compacting robinhood table (tombstone_ratio={:.3})", t.tombstone_ratio());
                    t.compact();
                    if let Some(cb) = self.hooks.on_compaction.as_mut() {
                        cb();
                    }
                }
            }
        }
    }

    pub fn put(&mut self, key: Key, value: Value) {
        self.drain_batch();
        match self.migration.as_mut() {
            Some(m) => {
                m.deleted_since_start.remove(&key);
                m.target_table.put(key, value);
            }
            None => self.backend.put(key, value),
        }
        self.maintenance();
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Value> {
        self.drain_batch();
        if let Some(m) = &self.migration {
            if let Some(v) = m.target_table.get(key) {
                return Some(v.clone());
            }
        }
        self.backend.get(key).cloned()
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.drain_batch();
        let deleted_in_target = self
            .migration
            .as_mut()
            .map(|m| m.target_table.delete(key))
            .unwrap_or(false);
        let removed = if deleted_in_target {
            true
        } else {
            self.backend.delete(key)
        };
        if removed {
            if let Some(m) = self.migration.as_mut() {
                m.deleted_since_start.insert(key.to_vec());
            }
        }
        self.maintenance();
        removed
    }

    /// Fully drains any migration, then iterates the promoted backend.
    pub fn iter_entries(&mut self) -> Vec<(Key, Value)> {
        self.drain_fully();
        self.backend.iter_entries().collect()
    }

    /// Force a compaction of the active Robin Hood backend; a no-op (returns
    /// `false`) while migrating or when the active backend is chained.
    pub fn trigger_compaction(&mut self) -> bool {
        if self.migration.is_some() {
            return false;
        }
        if let Backend::RobinHood(t) = &mut self.backend {
            t.compact();
            if let Some(cb) = self.hooks.on_compaction.as_mut() {
                cb();
            }
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;

    fn small_policy() -> Policy {
        Policy {
            max_lf_chaining: 0.5,
            max_group_len: 4,
            initial_buckets: 4,
            groups_per_bucket: 2,
            initial_capacity_rh: 8,
            incremental_batch: 4,
            ..Policy::default()
        }
    }

    #[test]
    fn basic_round_trip_scenario_a() {
        let mut m = AdaptiveMap::new(Policy::default(), StartBackend::Chaining).unwrap();
        m.put(b"K1".to_vec(), b"V1".to_vec());
        m.put(b"K2".to_vec(), b"V2".to_vec());
        assert_eq!(m.get(b"K1"), Some(b"V1".to_vec()));
        assert!(m.delete(b"K2"));
        assert_eq!(m.get(b"K2"), None);
        assert_eq!(m.len(), 1);
        assert!(!m.is_migrating());
    }

    #[test]
    fn chaining_to_robinhood_trigger_scenario_b() {
        let mut m = AdaptiveMap::new(small_policy(), StartBackend::Chaining).unwrap();
        let switched = std::rc::Rc::new(std::cell::RefCell::new(false));
        let switched_cb = switched.clone();
        m.set_hooks(Hooks {
            on_migration: Some(Box::new(move |_from, to| {
                if to == "robinhood" {
                    *switched_cb.borrow_mut() = true;
                }
            })),
            on_compaction: None,
        });
        for i in 0..200 {
            m.put(format!("key-{i}").into_bytes(), format!("v{i}").into_bytes());
        }
        m.drain_fully();
        assert!(*switched.borrow());
        assert_eq!(m.backend_label(), "robinhood");
        for i in 0..200 {
            assert_eq!(m.get(format!("key-{i}").as_bytes()), Some(format!("v{i}").into_bytes()));
        }
    }

    #[test]
    fn writes_during_migration_are_never_lost() {
        let mut m = AdaptiveMap::new(small_policy(), StartBackend::Chaining).unwrap();
        for i in 0..20 {
            m.put(format!("seed-{i}").into_bytes(), b"v".to_vec());
        }
        // Migration should now be underway (policy triggers at small sizes).
        m.put(b"fresh".to_vec(), b"value".to_vec());
        assert_eq!(m.get(b"fresh"), Some(b"value".to_vec()));
        m.drain_fully();
        assert_eq!(m.get(b"fresh"), Some(b"value".to_vec()));
    }

    #[test]
    fn overwrite_of_not_yet_migrated_key_is_not_clobbered_by_stale_cursor_entry() {
        let mut m = AdaptiveMap::new(small_policy(), StartBackend::Chaining).unwrap();
        for i in 0..20 {
            m.put(format!("seed-{i}").into_bytes(), b"v0".to_vec());
        }
        assert!(m.is_migrating());
        // Overwrite a key from the pre-migration snapshot before the cursor
        // has necessarily reached it.
        m.put(b"seed-0".to_vec(), b"v1".to_vec());
        m.drain_fully();
        assert_eq!(m.get(b"seed-0"), Some(b"v1".to_vec()));
    }

    #[test]
    fn delete_of_not_yet_migrated_key_is_not_resurrected_by_stale_cursor_entry() {
        let mut m = AdaptiveMap::new(small_policy(), StartBackend::Chaining).unwrap();
        for i in 0..20 {
            m.put(format!("seed-{i}").into_bytes(), b"v".to_vec());
        }
        assert!(m.is_migrating());
        assert!(m.delete(b"seed-0"));
        m.drain_fully();
        assert_eq!(m.get(b"seed-0"), None);
        assert!(!m.is_migrating());
    }

    #[test]
    fn iter_entries_clears_migration() {
        let mut m = AdaptiveMap::new(small_policy(), StartBackend::Chaining).unwrap();
        for i in 0..50 {
            m.put(format!("k{i}").into_bytes(), b"v".to_vec());
        }
        let entries = m.iter_entries();
        assert!(!m.is_migrating());
        assert_eq!(entries.len(), m.len());
    }
}
