//! Dehydration and hydration of result trees.
//!
//! **Dehydrate** walks a server result depth-first and splits it into a
//! skeleton of [`NormalizedNode`]s plus updates to shared
//! [`EntityRecord`]s. An object is entity-backed when the transport's path
//! metadata names an id for its path, or when one of its fields is a
//! [`CacheValue::EntityId`]. Field policy per node:
//!
//! | value                         | entity-backed node     | plain node          |
//! |-------------------------------|------------------------|---------------------|
//! | object                        | `references[key]`      | `references[key]`   |
//! | list of objects only          | `object_lists[key]`    | `object_lists[key]` |
//! | list of scalars only          | record field           | inline scalar       |
//! | mixed objects and scalars     | record field (opaque)  | inline (opaque)     |
//! | empty list                    | record field           | dropped             |
//! | scalar                        | record field           | inline scalar       |
//!
//! Every query already depending on a touched record is collected as
//! *impacted*, then the requesting query is registered on the record. The
//! requestor itself is never reported as impacted.
//!
//! **Hydrate** rebuilds the full tree from a skeleton, substituting the
//! *current* fields of each referenced record, so a cached tree reflects
//! writes made by other queries since it was stored.
//!
//! Both passes resolve all records up front with one batched provider call
//! and then run synchronously over an [`EntitySet`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::entity::EntityRecord;
use crate::identity::QueryId;
use crate::node::NormalizedNode;
use crate::path::{DataPath, EntityPaths};
use crate::storage::traits::{CacheProvider, StorageError};
use crate::value::CacheValue;

/// Records resolved for one pass, keyed by guid.
#[derive(Debug, Default)]
pub struct EntitySet {
    records: HashMap<String, Arc<EntityRecord>>,
}

impl EntitySet {
    #[must_use]
    pub fn new(records: HashMap<String, Arc<EntityRecord>>) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn get(&self, guid: &str) -> Option<&Arc<EntityRecord>> {
        self.records.get(guid)
    }

    /// Fetch-or-create; a guid missing from the prefetch gets a fresh record.
    pub fn get_or_create(&mut self, guid: &str) -> Arc<EntityRecord> {
        self.records
            .entry(guid.to_string())
            .or_insert_with(|| Arc::new(EntityRecord::new(guid)))
            .clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Output of one dehydration pass.
#[derive(Debug)]
pub struct Dehydrated {
    /// Serialized root, ready for a `ResultTreeEntry`
    pub data: String,
    pub root: NormalizedNode,
    /// Other queries whose cached projection includes a touched record
    pub impacted: BTreeSet<QueryId>,
    /// Every record written by this pass
    pub touched: Vec<Arc<EntityRecord>>,
}

struct Dehydrator<'a> {
    paths: &'a EntityPaths,
    records: &'a mut EntitySet,
    requestor: Option<&'a QueryId>,
    impacted: BTreeSet<QueryId>,
    touched: BTreeMap<String, Arc<EntityRecord>>,
}

impl Dehydrator<'_> {
    /// Normalize the value at `path`. `None` when it is not an object.
    fn normalize(&mut self, value: &CacheValue, path: &DataPath) -> Option<NormalizedNode> {
        let CacheValue::Map(fields) = value else {
            return None;
        };

        let record = entity_id_at(value, path, self.paths).map(|guid| self.records.get_or_create(guid));
        let mut node = match &record {
            Some(r) => NormalizedNode::entity_backed(r.guid()),
            None => NormalizedNode::inline(),
        };

        for (key, child) in fields {
            let child_path = path.field(key);
            match child {
                CacheValue::Map(_) => {
                    if let Some(child_node) = self.normalize(child, &child_path) {
                        node.references.insert(key.clone(), child_node);
                    }
                }
                CacheValue::List(items) => {
                    self.normalize_list(&mut node, record.as_deref(), key, items, &child_path);
                }
                scalar => self.store_scalar(&mut node, record.as_deref(), key, scalar.clone()),
            }
        }

        if let Some(record) = record {
            // A change in this node's shape matters to every existing
            // dependent, even when no field value changed.
            match self.requestor {
                Some(q) => self.impacted.extend(record.add_reference(q)),
                None => self.impacted.extend(record.referenced_by()),
            }
            self.touched.insert(record.guid().to_string(), record);
        }
        Some(node)
    }

    fn normalize_list(
        &mut self,
        node: &mut NormalizedNode,
        record: Option<&EntityRecord>,
        key: &str,
        items: &[CacheValue],
        path: &DataPath,
    ) {
        let mut object_refs = Vec::new();
        let mut scalar_count = 0usize;
        for (i, item) in items.iter().enumerate() {
            match self.normalize(item, &path.index(i)) {
                Some(child) => object_refs.push(child),
                None => scalar_count += 1,
            }
        }

        match (object_refs.is_empty(), scalar_count == 0) {
            // mixed: keep the original array as one opaque value
            (false, false) => {
                debug!(path = %path, "Mixed object/scalar list stored as opaque value");
                self.store_scalar(node, record, key, CacheValue::List(items.to_vec()));
            }
            (false, true) => {
                node.object_lists.insert(key.to_string(), object_refs);
            }
            (true, false) => self.store_scalar(node, record, key, CacheValue::List(items.to_vec())),
            // empty: only an owning record can remember "present but empty"
            (true, true) => {
                if record.is_some() {
                    self.store_scalar(node, record, key, CacheValue::List(Vec::new()));
                }
            }
        }
    }

    fn store_scalar(&mut self, node: &mut NormalizedNode, record: Option<&EntityRecord>, key: &str, value: CacheValue) {
        match record {
            Some(record) => {
                let dependents = record.update_field(key, value, self.requestor);
                self.impacted.extend(dependents);
            }
            None => {
                node.scalars.insert(key.to_string(), value);
            }
        }
    }
}

/// Entity id for the object `value` found at `path`: path metadata first,
/// then an in-band tagged field.
fn entity_id_at<'v>(value: &'v CacheValue, path: &DataPath, paths: &'v EntityPaths) -> Option<&'v str> {
    paths.entity_id(path).or_else(|| value.inline_entity_id())
}

/// All guids a dehydration of `value` will touch.
#[must_use]
pub fn collect_entity_ids(value: &CacheValue, paths: &EntityPaths) -> BTreeSet<String> {
    fn walk(value: &CacheValue, path: &DataPath, paths: &EntityPaths, out: &mut BTreeSet<String>) {
        match value {
            CacheValue::Map(fields) => {
                if let Some(id) = entity_id_at(value, path, paths) {
                    out.insert(id.to_string());
                }
                for (key, child) in fields {
                    walk(child, &path.field(key), paths, out);
                }
            }
            CacheValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    walk(item, &path.index(i), paths, out);
                }
            }
            _ => {}
        }
    }

    let mut out = BTreeSet::new();
    walk(value, &DataPath::root(), paths, &mut out);
    out
}

/// Synchronous dehydration over pre-resolved records.
pub fn dehydrate_with(
    hydrated: &CacheValue,
    paths: &EntityPaths,
    records: &mut EntitySet,
    requestor: Option<&QueryId>,
) -> Result<Dehydrated, StorageError> {
    let mut pass = Dehydrator {
        paths,
        records,
        requestor,
        impacted: BTreeSet::new(),
        touched: BTreeMap::new(),
    };

    let Some(root) = pass.normalize(hydrated, &DataPath::root()) else {
        crate::metrics::record_anomaly("non_object_root");
        return Err(StorageError::codec(
            requestor.map_or("<anonymous>", QueryId::as_str),
            "result root is not an object",
        ));
    };

    let mut impacted = pass.impacted;
    if let Some(q) = requestor {
        impacted.remove(q);
    }
    let touched: Vec<_> = pass.touched.into_values().collect();

    let data = root
        .to_blob()
        .map_err(|e| StorageError::codec(requestor.map_or("<anonymous>", QueryId::as_str), e))?;

    Ok(Dehydrated { data, root, impacted, touched })
}

/// Synchronous hydration over pre-resolved records.
#[must_use]
pub fn hydrate_with(node: &NormalizedNode, records: &EntitySet) -> CacheValue {
    let mut out = BTreeMap::new();

    match &node.entity {
        Some(guid) => match records.get(guid) {
            Some(record) => out.extend(record.fields()),
            None => warn!(guid = %guid, "Entity record missing during hydration"),
        },
        None => out.extend(node.scalars.iter().map(|(k, v)| (k.clone(), v.clone()))),
    }

    for (key, child) in &node.references {
        out.insert(key.clone(), hydrate_with(child, records));
    }
    for (key, list) in &node.object_lists {
        let items = list.iter().map(|child| hydrate_with(child, records)).collect();
        out.insert(key.clone(), CacheValue::List(items));
    }

    CacheValue::Map(out)
}

/// Dehydrate/hydrate against a [`CacheProvider`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeProcessor;

impl TreeProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Normalize `hydrated` into `provider`'s entity store.
    ///
    /// Touched records are written back through the provider before this
    /// returns; the caller stores the returned skeleton.
    pub async fn dehydrate(
        &self,
        hydrated: &CacheValue,
        paths: &EntityPaths,
        provider: &dyn CacheProvider,
        requestor: Option<&QueryId>,
    ) -> Result<Dehydrated, StorageError> {
        let guids = collect_entity_ids(hydrated, paths);
        let mut records = EntitySet::new(provider.entity_data_batch(&guids).await?);

        let dehydrated = dehydrate_with(hydrated, paths, &mut records, requestor)?;
        for record in &dehydrated.touched {
            provider.update_entity_data(record).await?;
        }

        crate::metrics::record_entities_touched(dehydrated.touched.len());
        debug!(
            entities = dehydrated.touched.len(),
            impacted = dehydrated.impacted.len(),
            "Dehydrated result tree"
        );
        Ok(dehydrated)
    }

    /// Rebuild the full tree for a stored skeleton.
    ///
    /// Read-only: records missing from the store hydrate as empty objects
    /// and are not created.
    pub async fn hydrate(&self, root: &NormalizedNode, provider: &dyn CacheProvider) -> Result<CacheValue, StorageError> {
        let guids = root.entity_guids();
        let records = if guids.is_empty() {
            EntitySet::default()
        } else {
            EntitySet::new(provider.stored_entity_data(&guids).await?)
        };
        Ok(hydrate_with(root, &records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{CacheIdentity, StorageKind};
    use crate::path::EntityPathHint;
    use crate::storage::memory::EphemeralProvider;
    use serde_json::json;

    fn provider() -> EphemeralProvider {
        EphemeralProvider::new(CacheIdentity::new(StorageKind::Memory, "p", None, "h"))
    }

    fn item_paths(guid: &str) -> EntityPaths {
        EntityPaths::new().with(DataPath::root().field("item"), EntityPathHint::Single(guid.into()))
    }

    #[tokio::test]
    async fn test_round_trip_nested_entities() {
        let p = provider();
        let json = json!({
            "item": {
                "id": "G1",
                "price": 10,
                "tags": ["a", "b"],
                "owner": {"id": "U1", "name": "Ann", "address": {"city": "Oslo"}},
                "variants": [{"id": "V1", "size": "S"}, {"id": "V2", "size": "M"}]
            },
            "count": 3
        });
        let paths = EntityPaths::from_extensions(&json!([
            {"path": ["item"], "entityId": "G1"},
            {"path": ["item", "owner"], "entityId": "U1"},
            {"path": ["item", "variants"], "entityIds": ["V1", "V2"]}
        ]));

        let processor = TreeProcessor::new();
        let value = CacheValue::from(json.clone());
        let out = processor.dehydrate(&value, &paths, &p, Some(&QueryId::from("Q1"))).await.unwrap();

        assert_eq!(out.touched.len(), 4);
        assert!(out.impacted.is_empty());
        let hydrated = processor.hydrate(&out.root, &p).await.unwrap();
        assert_eq!(hydrated.into_json(), json);
    }

    #[tokio::test]
    async fn test_entity_scalars_live_on_record() {
        let p = provider();
        let value = CacheValue::from(json!({"item": {"price": 10, "meta": {"x": 1}}}));
        let out = TreeProcessor::new()
            .dehydrate(&value, &item_paths("G1"), &p, None)
            .await
            .unwrap();

        let item = &out.root.references["item"];
        assert_eq!(item.entity.as_deref(), Some("G1"));
        assert!(item.scalars.is_empty());
        assert_eq!(item.references["meta"].scalars["x"], CacheValue::from(1));
        assert!(!out.data.contains("price"));

        let record = p.entity_data("G1").await.unwrap();
        assert_eq!(record.read_field("price"), Some(CacheValue::from(10)));
    }

    #[tokio::test]
    async fn test_entity_dedup_across_trees() {
        let p = provider();
        let processor = TreeProcessor::new();
        let first = CacheValue::from(json!({"item": {"price": 10}}));
        let second = CacheValue::from(json!({"other": {"price": 20, "name": "x"}}));
        let other_paths = EntityPaths::new().with(DataPath::root().field("other"), EntityPathHint::Single("G1".into()));

        processor.dehydrate(&first, &item_paths("G1"), &p, Some(&QueryId::from("A"))).await.unwrap();
        let before = p.entity_data("G1").await.unwrap();
        processor.dehydrate(&second, &other_paths, &p, Some(&QueryId::from("B"))).await.unwrap();
        let after = p.entity_data("G1").await.unwrap();

        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.read_field("price"), Some(CacheValue::from(20)));
        assert_eq!(after.read_field("name"), Some(CacheValue::from("x")));
        assert_eq!(p.stats().await.unwrap().entities, 1);
    }

    #[tokio::test]
    async fn test_fan_out_excludes_requestor() {
        let p = provider();
        let processor = TreeProcessor::new();
        let value = CacheValue::from(json!({"item": {"price": 1}}));
        let paths = item_paths("E");

        for q in ["A", "B", "C"] {
            processor.dehydrate(&value, &paths, &p, Some(&QueryId::from(q))).await.unwrap();
        }

        // C is already a dependent but is never impacted by its own write
        let out = processor.dehydrate(&value, &paths, &p, Some(&QueryId::from("C"))).await.unwrap();
        assert_eq!(out.impacted, BTreeSet::from([QueryId::from("A"), QueryId::from("B")]));
    }

    #[tokio::test]
    async fn test_structural_change_still_impacts_dependents() {
        let p = provider();
        let processor = TreeProcessor::new();
        let paths = item_paths("E");
        processor
            .dehydrate(&CacheValue::from(json!({"item": {"price": 1}})), &paths, &p, Some(&QueryId::from("A")))
            .await
            .unwrap();

        // No scalar fields at all, only a nested object
        let out = processor
            .dehydrate(&CacheValue::from(json!({"item": {"owner": {"n": 1}}})), &paths, &p, Some(&QueryId::from("B")))
            .await
            .unwrap();
        assert_eq!(out.impacted, BTreeSet::from([QueryId::from("A")]));
    }

    #[tokio::test]
    async fn test_mixed_array_stored_as_opaque_scalar() {
        let p = provider();
        let json = json!({"item": {"mixed": [{"id": "X"}, 1, "two"]}, "plain": {"mixed": [{"a": 1}, null]}});
        let paths = EntityPaths::new()
            .with(DataPath::root().field("item"), EntityPathHint::Single("G1".into()))
            .with(DataPath::root().field("item").field("mixed").index(0), EntityPathHint::Single("X".into()));

        let processor = TreeProcessor::new();
        let out = processor.dehydrate(&CacheValue::from(json.clone()), &paths, &p, None).await.unwrap();

        let item = &out.root.references["item"];
        assert!(item.object_lists.is_empty());
        let stored = p.entity_data("G1").await.unwrap().read_field("mixed").unwrap();
        assert_eq!(stored.into_json(), json!([{"id": "X"}, 1, "two"]));

        let plain = &out.root.references["plain"];
        assert!(plain.object_lists.is_empty());
        assert_eq!(plain.scalars["mixed"].clone().into_json(), json!([{"a": 1}, null]));

        assert_eq!(processor.hydrate(&out.root, &p).await.unwrap().into_json(), json);
    }

    #[tokio::test]
    async fn test_empty_list_kept_on_entity_dropped_inline() {
        let p = provider();
        let json = json!({"item": {"tags": []}, "plain": {"tags": [], "n": 1}});
        let processor = TreeProcessor::new();
        let out = processor
            .dehydrate(&CacheValue::from(json), &item_paths("G1"), &p, None)
            .await
            .unwrap();

        assert_eq!(
            p.entity_data("G1").await.unwrap().read_field("tags"),
            Some(CacheValue::List(vec![]))
        );
        assert!(!out.root.references["plain"].scalars.contains_key("tags"));

        let hydrated = processor.hydrate(&out.root, &p).await.unwrap().into_json();
        assert_eq!(hydrated, json!({"item": {"tags": []}, "plain": {"n": 1}}));
    }

    #[tokio::test]
    async fn test_scalar_list_on_entity_notifies_dependents() {
        let p = provider();
        let processor = TreeProcessor::new();
        let paths = item_paths("G1");
        processor
            .dehydrate(&CacheValue::from(json!({"item": {"tags": ["a"]}})), &paths, &p, Some(&QueryId::from("A")))
            .await
            .unwrap();
        let out = processor
            .dehydrate(&CacheValue::from(json!({"item": {"tags": ["b"]}})), &paths, &p, Some(&QueryId::from("B")))
            .await
            .unwrap();

        assert_eq!(out.impacted, BTreeSet::from([QueryId::from("A")]));
        assert_eq!(
            p.entity_data("G1").await.unwrap().read_field("tags").unwrap().into_json(),
            json!(["b"])
        );
    }

    #[tokio::test]
    async fn test_inline_entity_id_tag() {
        let p = provider();
        let mut item = BTreeMap::new();
        item.insert("id".to_string(), CacheValue::EntityId("G7".into()));
        item.insert("price".to_string(), CacheValue::from(3));
        let mut root = BTreeMap::new();
        root.insert("item".to_string(), CacheValue::Map(item));

        let out = TreeProcessor::new()
            .dehydrate(&CacheValue::Map(root), &EntityPaths::new(), &p, None)
            .await
            .unwrap();
        assert_eq!(out.root.references["item"].entity.as_deref(), Some("G7"));
        assert_eq!(
            p.entity_data("G7").await.unwrap().read_field("price"),
            Some(CacheValue::from(3))
        );
    }

    #[tokio::test]
    async fn test_hydrate_reflects_later_writes() {
        let p = provider();
        let processor = TreeProcessor::new();
        let first = processor
            .dehydrate(&CacheValue::from(json!({"item": {"price": 10}})), &item_paths("G1"), &p, Some(&QueryId::from("Q1")))
            .await
            .unwrap();
        processor
            .dehydrate(&CacheValue::from(json!({"item": {"price": 20}})), &item_paths("G1"), &p, Some(&QueryId::from("Q2")))
            .await
            .unwrap();

        let hydrated = processor.hydrate(&first.root, &p).await.unwrap();
        assert_eq!(hydrated.into_json(), json!({"item": {"price": 20}}));
    }

    #[tokio::test]
    async fn test_hydrate_does_not_create_records() {
        let p = provider();
        let mut root = NormalizedNode::inline();
        root.references.insert("item".into(), NormalizedNode::entity_backed("ghost"));

        let hydrated = TreeProcessor::new().hydrate(&root, &p).await.unwrap();
        assert_eq!(hydrated.into_json(), json!({"item": {}}));
        assert_eq!(p.stats().await.unwrap().entities, 0);
    }

    #[test]
    fn test_non_object_root_is_rejected() {
        let mut records = EntitySet::default();
        let result = dehydrate_with(&CacheValue::from(json!([1, 2])), &EntityPaths::new(), &mut records, None);
        assert!(result.unwrap_err().is_codec());
    }

    #[test]
    fn test_collect_entity_ids() {
        let value = CacheValue::from(json!({"a": {"b": [{"x": 1}, {"x": 2}]}, "c": {}}));
        let paths = EntityPaths::new()
            .with(DataPath::root().field("a").field("b"), EntityPathHint::PerElement(vec!["B0".into(), "B1".into()]))
            .with(DataPath::root().field("c"), EntityPathHint::Single("C".into()))
            .with(DataPath::root().field("missing"), EntityPathHint::Single("M".into()));

        let ids = collect_entity_ids(&value, &paths);
        assert_eq!(ids, BTreeSet::from(["B0".to_string(), "B1".into(), "C".into()]));
    }

    #[test]
    fn test_hydrate_missing_record_keeps_shape() {
        let mut node = NormalizedNode::inline();
        node.references.insert("item".into(), NormalizedNode::entity_backed("gone"));
        let hydrated = hydrate_with(&node, &EntitySet::default());
        assert_eq!(hydrated.into_json(), json!({"item": {}}));
    }
}
