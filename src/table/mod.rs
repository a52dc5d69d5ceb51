//! The two interchangeable table backends behind [`crate::adaptive::AdaptiveMap`].

pub mod chained;
pub mod robinhood;

pub use chained::ChainedTable;
pub use robinhood::RobinHoodTable;

/// Keys and values are treated as opaque owned byte blobs; the engine never
/// interprets their contents, only hashes and compares them.
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// Health signals a table reports to the adaptation controller. Fields not
/// meaningful for a given backend are left at their zero value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSignals {
    pub size: usize,
    pub capacity: usize,
    pub load_factor: f64,
    pub max_group_len: usize,
    pub avg_probe_estimate: f64,
    pub tombstone_ratio: f64,
}

/// Shared operation contract for both backends, named in the data-model
/// section as `{put, get, delete, iterate, size, health_signals}`. Kept as a
/// trait (rather than requiring both backends behind one `enum`) so call
/// sites that only need one backend can stay generic.
pub trait Table {
    fn put(&mut self, key: Key, value: Value);
    fn get(&self, key: &[u8]) -> Option<&Value>;
    fn delete(&mut self, key: &[u8]) -> bool;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn health(&self) -> HealthSignals;
    /// An iterator over all live entries in an unspecified but stable order
    /// for the current state; safe to drive a migration cursor from.
    fn iter_entries(&self) -> Box<dyn Iterator<Item = (Key, Value)> + '_>;
}
