//! Declaration hashing for change detection.
//!
//! This module provides deterministic hashing of resources and documents so
//! that plans and state records can show at a glance whether anything changed.

use sha2::{Digest, Sha256};

use crate::model::{canonical, normalize_properties, Properties, Resource, ResourceKind};

use super::spec::StackDocument;

/// Hasher for computing declaration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire document.
    ///
    /// This hash changes when any resource, flag or wiring patch changes.
    #[must_use]
    pub fn hash_document(&self, doc: &StackDocument) -> String {
        let mut hasher = Sha256::new();

        hasher.update(doc.stack.name.as_bytes());
        hasher.update(doc.stack.environment.as_bytes());
        if let Some(region) = &doc.stack.region {
            hasher.update(region.as_bytes());
        }

        // BTreeMaps iterate in key order
        for (key, value) in &doc.stack.tags {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }
        for (flag, enabled) in &doc.flags {
            hasher.update(flag.as_bytes());
            hasher.update(if *enabled { [1u8] } else { [0u8] });
        }

        for resource in &doc.resources {
            hasher.update(resource.id.as_bytes());
            hasher.update(self.hash_properties(resource.kind, &resource.properties).as_bytes());
            for dep in &resource.depends_on {
                hasher.update(dep.as_bytes());
            }
            if let Some(flag) = &resource.enabled_if {
                hasher.update(flag.as_bytes());
            }
        }

        for patch in &doc.wiring {
            hasher.update(patch.resource.as_bytes());
            for dep in &patch.depends_on {
                hasher.update(dep.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a property map after normalization.
    ///
    /// Reordering an unordered list property does not change the hash.
    #[must_use]
    pub fn hash_properties(&self, kind: ResourceKind, properties: &Properties) -> String {
        let mut hasher = Sha256::new();

        hasher.update(kind.as_str().as_bytes());
        for (name, value) in normalize_properties(kind, properties) {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(canonical(&value).as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a resource's desired properties.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        self.hash_properties(resource.kind, &resource.properties)
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Constant-time comparison
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
