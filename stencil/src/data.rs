//! Package input data
//!
//! The schema-to-UI layer (interactive forms, flag synthesis) lives outside
//! this crate; the core only consumes raw key/value data through
//! [`PackageDataSource`].

use serde_json::{Map, Value};

/// Supplies the user-provided field values for one package generation.
pub trait PackageDataSource {
    /// The raw key/value data rendered into templates.
    fn raw_data(&self) -> &Map<String, Value>;

    /// The same data in the shape sent over the plugin wire.
    fn plugin_data(&self) -> Map<String, Value> {
        self.raw_data().clone()
    }
}

/// A data source backed by an in-memory map. Used by the CLI's
/// `--set key=value` flags and by tests.
#[derive(Debug, Clone, Default)]
pub struct MapDataSource {
    data: Map<String, Value>,
}

impl MapDataSource {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }
}

impl PackageDataSource for MapDataSource {
    fn raw_data(&self) -> &Map<String, Value> {
        &self.data
    }
}
