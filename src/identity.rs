// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache scoping and query identity.
//!
//! A [`CacheIdentity`] decides which physical cache an operation touches.
//! It is derived from the storage kind, backend project, authenticated user
//! (or `anon`) and backend host, hashed with SHA-256 so it can double as a
//! file name. Two users never share an identity, so they never share a
//! provider.
//!
//! A [`QueryId`] names one cached result: the hash of the operation name
//! plus its variables in canonical (key-sorted) JSON form.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::value::CacheValue;

/// Where a provider keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// In-process maps, gone at process exit
    Memory,
    /// One SQLite file per identity
    Persistent,
}

impl StorageKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Persistent => "persistent",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ANONYMOUS_USER: &str = "anon";

/// Scoping key for one physical cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheIdentity {
    pub kind: StorageKind,
    pub project_id: String,
    pub user_id: String,
    pub host: String,
    hash: String,
}

impl CacheIdentity {
    pub fn new(
        kind: StorageKind,
        project_id: impl Into<String>,
        user_id: Option<&str>,
        host: impl Into<String>,
    ) -> Self {
        let project_id = project_id.into();
        let host = host.into();
        let user_id = user_id.unwrap_or(ANONYMOUS_USER).to_string();

        let mut hasher = Sha256::new();
        for part in [kind.as_str(), project_id.as_str(), user_id.as_str(), host.as_str()] {
            hasher.update(part.as_bytes());
            // separator so ("ab","c") != ("a","bc")
            hasher.update([0x1f]);
        }
        let hash = hex::encode(hasher.finalize());

        Self { kind, project_id, user_id, host, hash }
    }

    /// Stable hex digest of the identity.
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user_id == ANONYMOUS_USER
    }
}

impl fmt::Display for CacheIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // user id deliberately left out of logs
        write!(f, "{}:{}@{} ({})", self.kind, self.project_id, self.host, &self.hash[..12])
    }
}

/// Stable identifier of a cached query result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    /// Hash of `operation_name` and the canonical form of `variables`.
    #[must_use]
    pub fn new(operation_name: &str, variables: &Value) -> Self {
        let canonical = CacheValue::from(variables.clone()).to_canonical_string();
        let mut hasher = Sha256::new();
        hasher.update(operation_name.as_bytes());
        hasher.update([0x1f]);
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed id (e.g. read back from storage).
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
