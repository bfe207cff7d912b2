//! Result paths and entity-id metadata.
//!
//! The transport hands back, next to every result, a list of records naming
//! which JSON paths carry a server-assigned global id:
//!
//! ```json
//! [
//!   {"path": ["item"], "entityId": "G1"},
//!   {"path": ["items"], "entityIds": ["G2", "G3"]}
//! ]
//! ```
//!
//! [`EntityPaths`] indexes those records by [`DataPath`] so the normalizer
//! can ask "is the object at this path an entity?" in O(log n).

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::warn;

/// One step into a result tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Location of a value inside a result tree. Empty path = root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataPath(Vec<PathSegment>);

impl DataPath {
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Field(name.to_string()));
        Self(segments)
    }

    #[must_use]
    pub fn index(&self, i: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(i));
        Self(segments)
    }

    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a transport path array (`["items", 0, "owner"]`).
    pub fn from_json(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let mut segments = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(s) => segments.push(PathSegment::Field(s.clone())),
                Value::Number(n) => segments.push(PathSegment::Index(usize::try_from(n.as_u64()?).ok()?)),
                _ => return None,
            }
        }
        Some(Self(segments))
    }
}

impl From<Vec<PathSegment>> for DataPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for seg in &self.0 {
            match seg {
                PathSegment::Field(name) => write!(f, ".{}", name)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

/// Entity-id hint attached to a path by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPathHint {
    /// The object at this path is the entity with this id.
    Single(String),
    /// The list at this path holds one entity per element, in order.
    PerElement(Vec<String>),
}

/// Index of entity-id metadata for one result.
#[derive(Debug, Clone, Default)]
pub struct EntityPaths {
    ids: BTreeMap<DataPath, String>,
}

impl EntityPaths {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hint. A different id for an already-registered path is
    /// logged and replaces the previous one.
    pub fn insert(&mut self, path: DataPath, hint: EntityPathHint) {
        match hint {
            EntityPathHint::Single(id) => self.insert_id(path, id),
            EntityPathHint::PerElement(ids) => {
                for (i, id) in ids.into_iter().enumerate() {
                    self.insert_id(path.index(i), id);
                }
            }
        }
    }

    fn insert_id(&mut self, path: DataPath, id: String) {
        if let Some(previous) = self.ids.get(&path) {
            if *previous != id {
                warn!(path = %path, previous = %previous, id = %id, "Duplicate entity id for path, keeping latest");
                crate::metrics::record_anomaly("duplicate_path_id");
            }
        }
        self.ids.insert(path, id);
    }

    /// Builder-style [`insert`](Self::insert).
    #[must_use]
    pub fn with(mut self, path: DataPath, hint: EntityPathHint) -> Self {
        self.insert(path, hint);
        self
    }

    /// Parse the transport's metadata list. Malformed records are skipped.
    #[must_use]
    pub fn from_extensions(records: &Value) -> Self {
        let mut paths = Self::new();
        let Some(records) = records.as_array() else {
            if !records.is_null() {
                warn!("Entity path metadata is not a list, ignoring");
            }
            return paths;
        };

        for record in records {
            let Some(path) = record.get("path").and_then(DataPath::from_json) else {
                warn!(record = %record, "Skipping entity path record without a valid path");
                continue;
            };
            if let Some(id) = record.get("entityId").and_then(Value::as_str) {
                paths.insert(path, EntityPathHint::Single(id.to_string()));
            } else if let Some(ids) = record.get("entityIds").and_then(Value::as_array) {
                let ids = ids
                    .iter()
                    .map(|v| v.as_str().map(String::from))
                    .collect::<Option<Vec<_>>>();
                match ids {
                    Some(ids) => paths.insert(path, EntityPathHint::PerElement(ids)),
                    None => warn!(path = %path, "Skipping entityIds with non-string elements"),
                }
            }
        }
        paths
    }

    /// Entity id for the object at `path`, if any.
    #[must_use]
    pub fn entity_id(&self, path: &DataPath) -> Option<&str> {
        self.ids.get(path).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
