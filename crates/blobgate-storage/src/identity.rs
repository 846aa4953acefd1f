//! Blob identifiers and storage-class to namespace resolution.

use core::fmt;
use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Identifies a blob by its storage class and backend-local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId {
    /// Storage class the blob lives in (resolved to a namespace at request time)
    pub storage_class: i32,
    /// Key of the blob within its namespace
    pub local_key: i32,
}

impl BlobId {
    /// Creates a new BlobId.
    pub fn new(storage_class: i32, local_key: i32) -> Self {
        Self {
            storage_class,
            local_key,
        }
    }

    /// Negative classes or keys are never assigned by the backend.
    pub fn is_valid(&self) -> bool {
        self.storage_class >= 0 && self.local_key >= 0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.storage_class, self.local_key)
    }
}

impl FromStr for BlobId {
    type Err = StorageError;

    fn from_str(s: &str) -> StorageResult<Self> {
        let malformed = || StorageError::ProtocolViolation(format!("malformed blob id: {s:?}"));
        let (class, key) = s.split_once('.').ok_or_else(malformed)?;
        let storage_class = class.trim().parse::<i32>().map_err(|_| malformed())?;
        let local_key = key.trim().parse::<i32>().map_err(|_| malformed())?;
        Ok(Self::new(storage_class, local_key))
    }
}

/// Storage class to namespace table, populated once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceMap {
    entries: HashMap<i32, String>,
}

impl NamespaceMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the namespace for a storage class.
    pub fn insert(&mut self, storage_class: i32, namespace: impl Into<String>) {
        self.entries.insert(storage_class, namespace.into());
    }

    /// Looks up the namespace for a storage class.
    pub fn resolve(&self, storage_class: i32) -> Option<&str> {
        self.entries.get(&storage_class).map(String::as_str)
    }

    /// Number of mapped storage classes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(i32, S)> for NamespaceMap {
    fn from_iter<I: IntoIterator<Item = (i32, S)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k, v.into())).collect(),
        }
    }
}

/// A blob together with its lazily resolved backend location.
///
/// The namespace is resolved at most once per instance; later calls return
/// the cached value without consulting the map again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobIdentity {
    blob_id: BlobId,
    namespace: Option<String>,
    last_modified: Option<i64>,
}

impl BlobIdentity {
    /// Creates an unresolved identity.
    pub fn new(blob_id: BlobId, last_modified: Option<i64>) -> Self {
        Self {
            blob_id,
            namespace: None,
            last_modified,
        }
    }

    /// The blob this identity refers to.
    pub fn blob_id(&self) -> BlobId {
        self.blob_id
    }

    /// Optional last-modified constraint supplied by the caller.
    pub fn last_modified(&self) -> Option<i64> {
        self.last_modified
    }

    /// The resolved namespace, if resolution already happened.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Resolves the storage class into a namespace.
    pub fn resolve_namespace(&mut self, map: &NamespaceMap) -> StorageResult<&str> {
        if self.namespace.is_none() {
            let ns = map
                .resolve(self.blob_id.storage_class)
                .ok_or(StorageError::UnknownStorageClass {
                    storage_class: self.blob_id.storage_class,
                })?;
            self.namespace = Some(ns.to_string());
        }
        Ok(self.namespace.as_deref().unwrap_or_default())
    }
}

impl fmt::Display for BlobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}@{}", self.blob_id, ns),
            None => write!(f, "{}", self.blob_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> NamespaceMap {
        [(4, "blob_ns4"), (11, "blob_ns11")].into_iter().collect()
    }

    #[test]
    fn test_blob_id_parse_and_display() {
        let id: BlobId = "4.12345".parse().unwrap();
        assert_eq!(id, BlobId::new(4, 12345));
        assert_eq!(id.to_string(), "4.12345");
    }

    #[test]
    fn test_blob_id_parse_rejects_garbage() {
        assert!("4".parse::<BlobId>().is_err());
        assert!("a.b".parse::<BlobId>().is_err());
        assert!("".parse::<BlobId>().is_err());
    }

    #[test]
    fn test_blob_id_validity() {
        assert!(BlobId::new(0, 0).is_valid());
        assert!(!BlobId::new(-1, 5).is_valid());
        assert!(!BlobId::new(5, -1).is_valid());
    }

    #[test]
    fn test_resolve_namespace() {
        let mut identity = BlobIdentity::new(BlobId::new(4, 1), None);
        assert_eq!(identity.namespace(), None);
        assert_eq!(identity.resolve_namespace(&sample_map()).unwrap(), "blob_ns4");
        assert_eq!(identity.namespace(), Some("blob_ns4"));
        assert_eq!(identity.to_string(), "4.1@blob_ns4");
    }

    #[test]
    fn test_resolve_namespace_is_not_repeated() {
        let mut identity = BlobIdentity::new(BlobId::new(4, 1), None);
        identity.resolve_namespace(&sample_map()).unwrap();

        // A different map must not change an already resolved identity.
        let other: NamespaceMap = [(4, "elsewhere")].into_iter().collect();
        assert_eq!(identity.resolve_namespace(&other).unwrap(), "blob_ns4");
    }

    #[test]
    fn test_resolve_namespace_unknown_class() {
        let mut identity = BlobIdentity::new(BlobId::new(5, 100), None);
        let err = identity.resolve_namespace(&sample_map()).unwrap_err();
        assert_eq!(err, StorageError::UnknownStorageClass { storage_class: 5 });
        assert!(err.to_string().contains("cannot map"));
        assert_eq!(identity.namespace(), None);
    }

    #[test]
    fn test_namespace_map_from_json() {
        let map: NamespaceMap = serde_json::from_str(r#"{"4": "blob_ns4", "11": "blob_ns11"}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve(11), Some("blob_ns11"));
        assert_eq!(map.resolve(12), None);
    }
}
