//! In-memory identity gallery and the identity store seam.

use crate::types::{Embedding, Identity};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed identity record {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("invalid identity id {0:?}")]
    InvalidId(String),
}

/// Durable home of enrolled identities.
pub trait IdentityStore: Send + Sync {
    /// Every stored identity, in a stable order.
    fn load_all(&self) -> Result<Vec<Identity>, StoreError>;

    /// Insert or replace an identity.
    fn persist(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Remove an identity. Returns `false` if it did not exist.
    fn delete(&self, identity_id: &str) -> Result<bool, StoreError>;
}

/// Snapshot of all enrolled identities, scanned in load order.
#[derive(Debug, Default, Clone)]
pub struct Gallery {
    identities: Vec<Identity>,
}

impl Gallery {
    /// Build a gallery, keeping the first occurrence of any duplicated id.
    pub fn new(identities: Vec<Identity>) -> Self {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(identities.len());
        for identity in identities {
            if seen.insert(identity.id.clone()) {
                kept.push(identity);
            } else {
                tracing::warn!(id = %identity.id, "duplicate identity id in store; keeping first");
            }
        }
        Self { identities: kept }
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }

    /// First identity, in gallery order, whose match ratio reaches `threshold`.
    ///
    /// This is not a nearest-neighbour search: an earlier identity that
    /// qualifies wins over a later one that matches more closely.
    pub fn first_match(&self, probe: &Embedding, tolerance: f32, threshold: f32) -> Option<&Identity> {
        self.identities
            .iter()
            .find(|identity| {
                !identity.embeddings.is_empty() && identity.match_ratio(probe, tolerance) >= threshold
            })
    }
}
