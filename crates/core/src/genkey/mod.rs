//! Generation keys: versioned, dependency-aware cache identities.
//!
//! A [`GenKey`] names a cache lineage. Its `version` moves forward whenever
//! the key is refreshed or one of its dependencies has moved on since the key
//! was last computed; its `unique_id` only changes when the set of dependency
//! names changes.

mod authority;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use authority::GenKeyAuthority;

/// Versioned identity of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GenKey {
    pub name: String,
    pub unique_id: String,
    pub version: u64,
    /// Dependency name -> dependency version at the time this key was computed.
    pub dep_gen: BTreeMap<String, u64>,
}

impl GenKey {
    /// Start a new lineage at version 0.
    pub fn new(name: impl Into<String>, dep_gen: BTreeMap<String, u64>) -> Self {
        Self { name: name.into(), unique_id: Uuid::now_v7().to_string(), version: 0, dep_gen }
    }

    pub fn dependency_names(&self) -> BTreeSet<&str> {
        self.dep_gen.keys().map(String::as_str).collect()
    }

    /// Same lineage at the same version.
    pub fn same_generation(&self, other: &GenKey) -> bool {
        self.unique_id == other.unique_id && self.version == other.version
    }
}
