//! Partition name → key resolution.
//!
//! Names are matched case-insensitively after trimming. Unknown names
//! resolve to [`PartitionKey::UNRESOLVED`]; callers drop those rows.

use std::collections::BTreeMap;

use crate::error::{ClassifiedError, ErrorCode};
use crate::types::PartitionKey;

/// Static mapping from facility name to partition key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionMap {
    by_name: BTreeMap<String, PartitionKey>,
}

impl PartitionMap {
    /// Build a map, rejecting key `0` and names that collide after
    /// normalization.
    pub fn new<I, S>(entries: I) -> Result<Self, ClassifiedError>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        let mut by_name = BTreeMap::new();
        for (name, key) in entries {
            let normalized = normalize(name.as_ref());
            if normalized.is_empty() {
                return Err(ClassifiedError::configuration(
                    ErrorCode::InvalidValue,
                    "partition name must not be blank",
                ));
            }
            let key = PartitionKey(key);
            if !key.is_resolved() {
                return Err(ClassifiedError::configuration(
                    ErrorCode::InvalidValue,
                    format!("partition '{normalized}' uses reserved key 0"),
                ));
            }
            if by_name.insert(normalized.clone(), key).is_some() {
                return Err(ClassifiedError::configuration(
                    ErrorCode::InvalidValue,
                    format!("partition '{normalized}' is defined twice"),
                ));
            }
        }
        Ok(Self { by_name })
    }

    /// Resolve `name`; [`PartitionKey::UNRESOLVED`] when unknown.
    pub fn resolve(&self, name: &str) -> PartitionKey {
        self.by_name
            .get(&normalize(name))
            .copied()
            .unwrap_or(PartitionKey::UNRESOLVED)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
