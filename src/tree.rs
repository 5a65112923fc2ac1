#![allow(dead_code)]
//! Flattening of adjacency-list rows into jsTree items.
//!
//! A build loads the rows of one entity, optionally walks every row's
//! parent chain so the client can render a path to any node, turns rows
//! into [`TreeItem`]s and caches that unselected map. Selection state is
//! applied per request on top of the (possibly cached) map and is never
//! written back to the cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::TreeCache;
use crate::config::TreeActionConfig;
use crate::error::{ConfigError, SourceError, TreeError};
use crate::rows::{is_falsy, key_string, lookup_path, Row, RowQuery, RowSource};

/// Parent value of top-level items.
pub const ROOT_PARENT: &str = "#";

/// Name of the query parameter holding comma-separated selected ids.
pub const SELECTED_IDS_PARAM: &str = "selected";

/// Link attributes rendered on the item's anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorAttrs {
    #[serde(rename = "data-id")]
    pub data_id: Value,
    #[serde(rename = "data-parent_id")]
    pub data_parent_id: Value,
    #[serde(rename = "data-type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened: Option<bool>,
    pub selected: bool,
}

/// One node in jsTree's flat JSON format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeItem {
    pub id: Value,
    /// Parent id, or `"#"` for roots.
    pub parent: Value,
    pub text: Value,
    pub a_attr: AnchorAttrs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub item_type: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ItemState>,
}

impl TreeItem {
    pub fn new(id: Value, parent: Value, text: Value) -> Self {
        Self {
            a_attr: AnchorAttrs {
                data_id: id.clone(),
                data_parent_id: parent.clone(),
                data_type: None,
            },
            id,
            parent,
            text,
            icon: None,
            item_type: None,
            state: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.as_str() == Some(ROOT_PARENT)
    }
}

/// Items keyed by id, in insertion order.
///
/// Inserting an id that is already present replaces the item but keeps its
/// original position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemMap {
    items: Vec<TreeItem>,
    index: HashMap<String, usize>,
}

impl ItemMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an existing item was replaced.
    pub fn insert(&mut self, item: TreeItem) -> bool {
        let key = key_string(&item.id);
        match self.index.get(&key) {
            Some(&pos) => {
                self.items[pos] = item;
                true
            }
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(item);
                false
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&TreeItem> {
        self.index.get(key).map(|&pos| &self.items[pos])
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut TreeItem> {
        match self.index.get(key) {
            Some(&pos) => Some(&mut self.items[pos]),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<TreeItem> {
        self.items
    }
}

/// Per-request selection inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Marked opened and selected.
    pub selected_id: Option<String>,
    /// Marked selected only. Wins over `selected_id` for the same item.
    pub selected_ids: Vec<String>,
}

impl Selection {
    /// Read the selection from query parameters. The selected-id parameter
    /// falls back to the parent-id parameter only when it is absent.
    pub fn from_query(query: &HashMap<String, String>, config: &TreeActionConfig) -> Self {
        let selected_id = query
            .get(&config.query_selected_param)
            .or_else(|| query.get(&config.query_parent_param))
            .cloned();

        let selected_ids = query
            .get(SELECTED_IDS_PARAM)
            .map(|raw| {
                raw.split(',')
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            selected_id,
            selected_ids,
        }
    }

    /// Mark items. The list pass runs second and replaces `state` wholesale.
    pub fn apply(&self, items: &mut ItemMap) {
        if let Some(id) = self.selected_id.as_deref() {
            if let Some(item) = items.get_mut(id) {
                item.state = Some(ItemState {
                    opened: Some(true),
                    selected: true,
                });
            }
        }

        for id in &self.selected_ids {
            if let Some(item) = items.get_mut(id) {
                item.state = Some(ItemState {
                    opened: None,
                    selected: true,
                });
            }
        }
    }
}

/// Builds the item list for one tree action.
pub struct TreeFlattener {
    config: Arc<TreeActionConfig>,
    entity: String,
    source: Arc<dyn RowSource>,
    cache: Arc<dyn TreeCache>,
}

impl TreeFlattener {
    /// Validates the action against the row source before any request is served.
    pub fn new(
        config: TreeActionConfig,
        source: Arc<dyn RowSource>,
        cache: Arc<dyn TreeCache>,
    ) -> Result<Self, ConfigError> {
        let entity = config.validate(source.as_ref())?.to_string();
        Ok(Self {
            config: Arc::new(config),
            entity,
            source,
            cache,
        })
    }

    pub fn config(&self) -> &TreeActionConfig {
        &self.config
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn cache_key(&self) -> String {
        format!(
            "TreeData:{}:{}:{}",
            self.config.cache_key.resolve(),
            self.entity,
            self.config.sort_field
        )
    }

    /// Invalidation tag shared by every cached tree of `entity`.
    pub fn cache_tag(entity: &str) -> String {
        format!("entity:{}", entity)
    }

    /// Produce the ordered item list with `selection` applied.
    pub async fn build(&self, selection: &Selection) -> Result<Vec<TreeItem>, TreeError> {
        let mut items = if self.config.cache_enabled {
            let key = self.cache_key();
            match self.cache.get(&key) {
                Some(items) => {
                    debug!("Tree '{}': cache hit for {}", self.config.name, key);
                    items
                }
                None => {
                    debug!("Tree '{}': cache miss for {}", self.config.name, key);
                    let items = self.build_items().await?;
                    self.cache.set(
                        &key,
                        items.clone(),
                        Duration::from_secs(self.config.cache_lifetime),
                        &[Self::cache_tag(&self.entity)],
                    );
                    items
                }
            }
        } else {
            self.build_items().await?
        };

        selection.apply(&mut items);
        Ok(items.into_items())
    }

    async fn build_items(&self) -> Result<ItemMap, TreeError> {
        let relations = self.config.with_relations.resolve();
        let query = RowQuery {
            entity: self.entity.clone(),
            order_by: self.config.sort_field.clone(),
            condition: self.config.where_condition.resolve(),
            relations: relations.clone(),
        };

        let mut rows = self.source.fetch_all(&query).await?;
        if rows.is_empty() {
            debug!("Tree '{}': no rows", self.config.name);
            return Ok(ItemMap::new());
        }
        let fetched = rows.len();

        if self.config.recursive_parents {
            let ancestors = self.collect_ancestors(&rows, &relations).await?;
            rows.extend(ancestors);
        }

        let mut items = ItemMap::new();
        for row in &rows {
            items.insert(self.to_item(row));
        }

        info!(
            "Tree '{}': built {} items from {} rows ({} ancestors)",
            self.config.name,
            items.len(),
            fetched,
            rows.len() - fetched
        );
        Ok(items)
    }

    /// Walk every row's parent chain upward.
    ///
    /// `visited` is shared across all walks, so a parent reached a second
    /// time (another path, or a cycle) ends the walk.
    async fn collect_ancestors(
        &self,
        rows: &[Row],
        relations: &[String],
    ) -> Result<Vec<Row>, SourceError> {
        let cfg = &self.config;
        let mut visited = HashSet::new();
        let mut ancestors: Vec<Row> = Vec::new();

        for row in rows {
            let mut parent = match lookup_path(row, &cfg.parent_field) {
                Some(p) if !is_falsy(Some(p)) => p.clone(),
                _ => continue,
            };

            loop {
                if !visited.insert(key_string(&parent)) {
                    break;
                }
                let Some(found) = self
                    .source
                    .fetch_one(&self.entity, &cfg.id_field, &parent, relations)
                    .await?
                else {
                    break;
                };

                let next = lookup_path(&found, &cfg.parent_field)
                    .filter(|p| !is_falsy(Some(*p)))
                    .cloned();
                if !ancestors.contains(&found) {
                    ancestors.push(found);
                }
                match next {
                    Some(p) => parent = p,
                    None => break,
                }
            }
        }

        Ok(ancestors)
    }

    fn to_item(&self, row: &Row) -> TreeItem {
        let cfg = &self.config;
        let id = lookup_path(row, &cfg.id_field).cloned().unwrap_or(Value::from(0));
        let raw_parent = lookup_path(row, &cfg.parent_field).cloned().unwrap_or(Value::Null);
        let parent = if is_falsy(Some(&raw_parent)) {
            Value::from(ROOT_PARENT)
        } else {
            raw_parent.clone()
        };
        let text = lookup_path(row, &cfg.label_field)
            .cloned()
            .unwrap_or_else(|| Value::from("item"));

        let mut item = TreeItem::new(id, parent, text);
        item.a_attr.data_parent_id = raw_parent;

        if let Some(field) = &cfg.type_field {
            item.a_attr.data_type = Some(lookup_path(row, field).cloned().unwrap_or(Value::Null));
        }

        if let Some(icons) = &cfg.icons {
            let icon_name = lookup_path(row, &cfg.icon_field)
                .filter(|v| !is_falsy(Some(*v)))
                .map(key_string);
            item.icon = icon_name
                .and_then(|name| icons.get(&name))
                .or_else(|| icons.get("default"))
                .cloned();
        }

        if let Some(field) = &cfg.vary_by_type_field {
            item.item_type = Some(lookup_path(row, field).cloned().unwrap_or(Value::Null));
        }

        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::Deferred;
    use crate::rows::MemoryRowSource;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    /// Wraps a source and counts calls.
    struct CountingSource {
        inner: MemoryRowSource,
        fetch_all_calls: AtomicUsize,
        fetch_one_calls: AtomicUsize,
    }

    impl CountingSource {
        fn new(inner: MemoryRowSource) -> Arc<Self> {
            Arc::new(Self {
                inner,
                fetch_all_calls: AtomicUsize::new(0),
                fetch_one_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl RowSource for CountingSource {
        fn has_entity(&self, entity: &str) -> bool {
            self.inner.has_entity(entity)
        }

        async fn fetch_all(&self, query: &RowQuery) -> Result<Vec<Row>, SourceError> {
            self.fetch_all_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_all(query).await
        }

        async fn fetch_one(
            &self,
            entity: &str,
            field: &str,
            value: &Value,
            relations: &[String],
        ) -> Result<Option<Row>, SourceError> {
            self.fetch_one_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_one(entity, field, value, relations).await
        }
    }

    /// Records the lifetime of every `set` and keeps nothing.
    #[derive(Default)]
    struct RecordingCache {
        ttls: std::sync::Mutex<Vec<Duration>>,
    }

    impl TreeCache for RecordingCache {
        fn get(&self, _key: &str) -> Option<ItemMap> {
            None
        }

        fn set(&self, _key: &str, _items: ItemMap, ttl: Duration, _tags: &[String]) {
            self.ttls.lock().unwrap().push(ttl);
        }

        fn invalidate_tag(&self, _tag: &str) -> usize {
            0
        }
    }

    fn categories(rows: Vec<Value>) -> MemoryRowSource {
        MemoryRowSource::new().with_entity("category", rows.into_iter().map(row).collect())
    }

    fn uncached(name: &str) -> TreeActionConfig {
        let mut config = TreeActionConfig::new(name, "category");
        config.cache_enabled = false;
        config
    }

    fn flattener(config: TreeActionConfig, source: Arc<dyn RowSource>) -> TreeFlattener {
        TreeFlattener::new(config, source, Arc::new(MemoryCache::new())).unwrap()
    }

    fn ids(items: &[TreeItem]) -> Vec<Value> {
        items.iter().map(|i| i.id.clone()).collect()
    }

    fn select_one(id: &str) -> Selection {
        Selection {
            selected_id: Some(id.to_string()),
            selected_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_child_and_root_with_single_selection() {
        let source = categories(vec![
            json!({"id": 2, "parent_id": 1, "name": "Child", "sort_order": 2}),
            json!({"id": 1, "parent_id": 0, "name": "Root", "sort_order": 1}),
        ]);
        let tree = flattener(uncached("categories"), Arc::new(source));

        let items = tree.build(&select_one("2")).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, json!(1));
        assert_eq!(items[0].parent, json!("#"));
        assert_eq!(items[0].text, json!("Root"));
        assert_eq!(items[0].state, None);
        assert_eq!(items[1].id, json!(2));
        assert_eq!(items[1].parent, json!(1));
        assert_eq!(
            items[1].state,
            Some(ItemState {
                opened: Some(true),
                selected: true
            })
        );
    }

    #[tokio::test]
    async fn test_serialized_shape() {
        let source = categories(vec![json!({"id": 1, "parent_id": null, "name": "Root"})]);
        let tree = flattener(uncached("categories"), Arc::new(source));

        let items = tree.build(&select_one("1")).await.unwrap();
        let json = serde_json::to_value(&items).unwrap();

        assert_eq!(
            json,
            json!([{
                "id": 1,
                "parent": "#",
                "text": "Root",
                "a_attr": {"data-id": 1, "data-parent_id": null},
                "state": {"opened": true, "selected": true}
            }])
        );
    }

    #[tokio::test]
    async fn test_falsy_parents_map_to_root() {
        let source = categories(vec![
            json!({"id": 1, "parent_id": 0, "sort_order": 1}),
            json!({"id": 2, "parent_id": "", "sort_order": 2}),
            json!({"id": 3, "parent_id": null, "sort_order": 3}),
            json!({"id": 4, "parent_id": "0", "sort_order": 4}),
            json!({"id": 5, "parent_id": false, "sort_order": 5}),
            json!({"id": 6, "sort_order": 6}),
        ]);
        let mut config = uncached("categories");
        config.recursive_parents = false;
        let tree = flattener(config, Arc::new(source));

        let items = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(items.len(), 6);
        assert!(items.iter().all(TreeItem::is_root));
        // Label falls back when the field is missing.
        assert!(items.iter().all(|i| i.text == json!("item")));
    }

    #[tokio::test]
    async fn test_empty_rows_yield_empty_output() {
        let tree = flattener(uncached("categories"), Arc::new(categories(Vec::new())));
        let items = tree.build(&select_one("1")).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_list_selection_overwrites_single_selection() {
        let source = categories(vec![
            json!({"id": 1, "parent_id": 0, "name": "A", "sort_order": 1}),
            json!({"id": 2, "parent_id": 0, "name": "B", "sort_order": 2}),
        ]);
        let tree = flattener(uncached("categories"), Arc::new(source));
        let selection = Selection {
            selected_id: Some("1".to_string()),
            selected_ids: vec!["1".to_string(), "2".to_string(), "99".to_string()],
        };

        let items = tree.build(&selection).await.unwrap();
        let only_selected = Some(ItemState {
            opened: None,
            selected: true,
        });

        assert_eq!(items[0].state, only_selected);
        assert_eq!(items[1].state, only_selected);
        let json = serde_json::to_value(&items[0]).unwrap();
        assert_eq!(json["state"], json!({"selected": true}));
    }

    #[tokio::test]
    async fn test_ancestor_completeness() {
        // Only C passes the filter; B and A are reached through parents.
        let source = categories(vec![
            json!({"id": 1, "parent_id": 0, "name": "A", "visible": 0}),
            json!({"id": 2, "parent_id": 1, "name": "B", "visible": 0}),
            json!({"id": 3, "parent_id": 2, "name": "C", "visible": 1}),
        ]);
        let mut config = uncached("categories");
        config.where_condition = Deferred::Value([("visible".to_string(), json!(1))].into());
        let tree = flattener(config, Arc::new(source));

        let items = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(ids(&items), vec![json!(3), json!(2), json!(1)]);
        assert_eq!(items[2].parent, json!("#"));
    }

    #[tokio::test]
    async fn test_shared_ancestor_fetched_once() {
        let source = CountingSource::new(categories(vec![
            json!({"id": 1, "parent_id": 0, "name": "A", "leaf": 0}),
            json!({"id": 2, "parent_id": 1, "name": "B", "leaf": 1}),
            json!({"id": 3, "parent_id": 1, "name": "C", "leaf": 1}),
        ]));
        let mut config = uncached("categories");
        config.where_condition = Deferred::Value([("leaf".to_string(), json!(1))].into());
        let tree = flattener(config, source.clone());

        let items = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(ids(&items), vec![json!(2), json!(3), json!(1)]);
        assert_eq!(source.fetch_one_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ancestors_overwrite_in_place() {
        // B is fetched directly and again as A's parent.
        let source = categories(vec![
            json!({"id": 1, "parent_id": 2, "name": "A", "sort_order": 1}),
            json!({"id": 2, "parent_id": 0, "name": "B", "sort_order": 2}),
        ]);
        let tree = flattener(uncached("categories"), Arc::new(source));

        let items = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(ids(&items), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_cyclic_parents_terminate() {
        let source = CountingSource::new(categories(vec![
            json!({"id": 1, "parent_id": 3, "name": "A", "sort_order": 1}),
            json!({"id": 2, "parent_id": 1, "name": "B", "sort_order": 2}),
            json!({"id": 3, "parent_id": 2, "name": "C", "sort_order": 3}),
        ]));
        let tree = flattener(uncached("categories"), source.clone());

        let items = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(ids(&items), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(source.fetch_one_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_parent_row_ends_walk() {
        let source = categories(vec![json!({"id": 5, "parent_id": 404, "name": "Orphan"})]);
        let tree = flattener(uncached("categories"), Arc::new(source));

        let items = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].parent, json!(404));
    }

    #[tokio::test]
    async fn test_icons_type_and_attributes() {
        let source = categories(vec![
            json!({"id": 1, "parent_id": 0, "name": "Docs", "icon": "dir", "kind": "folder", "sort_order": 1}),
            json!({"id": 2, "parent_id": 1, "name": "a.pdf", "icon": "pdf", "kind": "file", "sort_order": 2}),
            json!({"id": 3, "parent_id": 1, "name": "b.txt", "icon": "", "kind": "file", "sort_order": 3}),
            json!({"id": 4, "parent_id": 1, "name": "c.xyz", "icon": "xyz", "kind": "file", "sort_order": 4}),
        ]);
        let mut config = uncached("files");
        config.icons = Some(HashMap::from([
            ("default".to_string(), "fa fa-file".to_string()),
            ("dir".to_string(), "fa fa-folder-o".to_string()),
            ("pdf".to_string(), "fa fa-file-pdf-o".to_string()),
        ]));
        config.type_field = Some("kind".to_string());
        config.vary_by_type_field = Some("kind".to_string());
        let tree = flattener(config, Arc::new(source));

        let items = tree.build(&Selection::default()).await.unwrap();
        let icons: Vec<_> = items.iter().map(|i| i.icon.as_deref()).collect();

        assert_eq!(
            icons,
            vec![
                Some("fa fa-folder-o"),
                Some("fa fa-file-pdf-o"),
                Some("fa fa-file"),
                Some("fa fa-file")
            ]
        );
        assert_eq!(items[0].item_type, Some(json!("folder")));
        assert_eq!(items[1].a_attr.data_type, Some(json!("file")));
        assert_eq!(items[1].a_attr.data_parent_id, json!(1));
    }

    #[tokio::test]
    async fn test_label_from_relation_path() {
        let source = categories(vec![json!({"id": 1, "parent_id": 0})])
            .with_entity(
                "category_translation",
                vec![row(json!({"category_id": 1, "name": "Raíz"}))],
            )
            .with_relation(
                "category",
                "defaultTranslation",
                crate::rows::RelationDef {
                    entity: "category_translation".to_string(),
                    local_field: "id".to_string(),
                    foreign_field: "category_id".to_string(),
                    many: false,
                },
            );
        let mut config = uncached("categories");
        config.label_field = "defaultTranslation.name".to_string();
        config.with_relations = Deferred::Value(vec!["defaultTranslation".to_string()]);
        let tree = flattener(config, Arc::new(source));

        let items = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(items[0].text, json!("Raíz"));
    }

    #[tokio::test]
    async fn test_uncached_builds_are_idempotent() {
        let source = CountingSource::new(categories(vec![
            json!({"id": 1, "parent_id": 0, "name": "A", "sort_order": 1}),
            json!({"id": 2, "parent_id": 1, "name": "B", "sort_order": 2}),
        ]));
        let tree = flattener(uncached("categories"), source.clone());

        let first = tree.build(&select_one("2")).await.unwrap();
        let second = tree.build(&Selection::default()).await.unwrap();

        assert_eq!(source.fetch_all_calls.load(Ordering::SeqCst), 2);
        let strip = |items: Vec<TreeItem>| {
            items
                .into_iter()
                .map(|mut i| {
                    i.state = None;
                    i
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(first), strip(second));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_source_and_keeps_selection_fresh() {
        let source = CountingSource::new(categories(vec![
            json!({"id": 1, "parent_id": 0, "name": "A", "sort_order": 1}),
            json!({"id": 2, "parent_id": 1, "name": "B", "sort_order": 2}),
        ]));
        let cache = Arc::new(MemoryCache::new());
        let config = TreeActionConfig::new("categories", "category");
        let tree = TreeFlattener::new(config, source.clone(), cache.clone()).unwrap();

        let first = tree.build(&select_one("2")).await.unwrap();
        assert!(first[1].state.is_some());
        assert_eq!(source.fetch_all_calls.load(Ordering::SeqCst), 1);

        let second = tree.build(&select_one("1")).await.unwrap();
        assert_eq!(source.fetch_all_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.fetch_one_calls.load(Ordering::SeqCst), 1);
        assert!(second[0].state.is_some());
        assert_eq!(second[1].state, None);

        // The cached map carries no selection.
        let cached = cache.get(&tree.cache_key()).unwrap();
        assert!(cached.into_items().iter().all(|i| i.state.is_none()));
    }

    #[tokio::test]
    async fn test_configured_cache_lifetime_is_applied() {
        let cache = Arc::new(RecordingCache::default());
        let mut config = TreeActionConfig::new("categories", "category");
        config.cache_lifetime = 90;
        let source = Arc::new(categories(vec![json!({"id": 1, "parent_id": 0})]));
        let tree = TreeFlattener::new(config, source, cache.clone()).unwrap();

        tree.build(&Selection::default()).await.unwrap();

        assert_eq!(*cache.ttls.lock().unwrap(), vec![Duration::from_secs(90)]);
    }

    #[tokio::test]
    async fn test_expired_tree_is_rebuilt_from_source() {
        let source = CountingSource::new(categories(vec![json!({"id": 1, "parent_id": 0})]));
        let mut config = TreeActionConfig::new("categories", "category");
        config.cache_lifetime = 1;
        let tree =
            TreeFlattener::new(config, source.clone(), Arc::new(MemoryCache::new())).unwrap();

        tree.build(&Selection::default()).await.unwrap();
        tree.build(&Selection::default()).await.unwrap();
        assert_eq!(source.fetch_all_calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        tree.build(&Selection::default()).await.unwrap();
        assert_eq!(source.fetch_all_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_constructor_rejects_overflowing_cache_lifetime() {
        let mut config = TreeActionConfig::new("categories", "category");
        config.cache_lifetime = u64::MAX;
        let result = TreeFlattener::new(
            config,
            Arc::new(categories(Vec::new())),
            Arc::new(MemoryCache::new()),
        );
        assert!(matches!(result, Err(ConfigError::InvalidCacheLifetime { .. })));
    }

    #[tokio::test]
    async fn test_tag_invalidation_forces_rebuild() {
        let source = CountingSource::new(categories(vec![json!({"id": 1, "parent_id": 0})]));
        let cache = Arc::new(MemoryCache::new());
        let tree = TreeFlattener::new(
            TreeActionConfig::new("categories", "category"),
            source.clone(),
            cache.clone(),
        )
        .unwrap();

        tree.build(&Selection::default()).await.unwrap();
        assert_eq!(cache.invalidate_tag(&TreeFlattener::cache_tag("category")), 1);
        tree.build(&Selection::default()).await.unwrap();

        assert_eq!(source.fetch_all_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_key_uses_computed_prefix() {
        let mut config = TreeActionConfig::new("categories", "category");
        config.cache_key = Deferred::computed(|| "tenant-7".to_string());
        let tree = flattener(config, Arc::new(categories(Vec::new())));
        assert_eq!(tree.cache_key(), "TreeData:tenant-7:category:sort_order");
    }

    #[test]
    fn test_constructor_rejects_bad_config() {
        let mut config = TreeActionConfig::new("broken", "category");
        config.entity = None;
        let result = TreeFlattener::new(
            config,
            Arc::new(categories(Vec::new())),
            Arc::new(MemoryCache::new()),
        );
        assert!(matches!(result, Err(ConfigError::MissingEntity(_))));
    }

    #[test]
    fn test_item_map_keeps_first_position_on_overwrite() {
        let mut map = ItemMap::new();
        assert!(!map.insert(TreeItem::new(json!(1), json!("#"), json!("old"))));
        assert!(!map.insert(TreeItem::new(json!(2), json!("#"), json!("two"))));
        assert!(map.insert(TreeItem::new(json!("1"), json!("#"), json!("new"))));

        assert_eq!(map.len(), 2);
        assert_eq!(map.get("1").unwrap().text, json!("new"));
        let texts: Vec<_> = map.into_items().into_iter().map(|i| i.text).collect();
        assert_eq!(texts, vec![json!("new"), json!("two")]);
    }

    #[test]
    fn test_selection_from_query() {
        let config = TreeActionConfig::new("categories", "category");
        let query = HashMap::from([
            ("id".to_string(), "4".to_string()),
            ("selected".to_string(), "1,,3,".to_string()),
        ]);
        let selection = Selection::from_query(&query, &config);
        assert_eq!(selection.selected_id.as_deref(), Some("4"));
        assert_eq!(selection.selected_ids, vec!["1", "3"]);

        let query = HashMap::from([
            ("id".to_string(), "4".to_string()),
            ("selected_id".to_string(), "9".to_string()),
        ]);
        let selection = Selection::from_query(&query, &config);
        assert_eq!(selection.selected_id.as_deref(), Some("9"));
        assert!(selection.selected_ids.is_empty());
    }
}
