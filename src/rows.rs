#![allow(dead_code)]
//! Row source abstraction and the in-memory dataset implementation.
//!
//! Rows are plain JSON objects. Field lookups accept dotted paths so a label
//! can come from an eager-loaded relation (`defaultTranslation.name`).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::SourceError;

/// A single row as delivered by a row source.
pub type Row = Map<String, Value>;

/// Equality filter: every field must loosely equal its value.
/// An array value matches any of its elements.
pub type Condition = BTreeMap<String, Value>;

/// Parameters for a fetch-all call.
#[derive(Debug, Clone, Default)]
pub struct RowQuery {
    pub entity: String,
    pub order_by: String,
    pub condition: Condition,
    pub relations: Vec<String>,
}

/// External collaborator that supplies rows for tree actions.
#[async_trait::async_trait]
pub trait RowSource: Send + Sync {
    /// Whether the entity collection exists. Used for setup-time validation.
    fn has_entity(&self, entity: &str) -> bool;

    /// All rows of `query.entity`, filtered, with relations loaded, ordered
    /// ascending by `query.order_by`.
    async fn fetch_all(&self, query: &RowQuery) -> Result<Vec<Row>, SourceError>;

    /// First row of `entity` whose `field` equals `value`, with `relations`
    /// loaded the same way as `fetch_all`.
    async fn fetch_one(
        &self,
        entity: &str,
        field: &str,
        value: &Value,
        relations: &[String],
    ) -> Result<Option<Row>, SourceError>;
}

// ============================================================================
// Value helpers
// ============================================================================

/// Resolve a dotted path (`a.b.c`) inside a row.
pub fn lookup_path<'a>(row: &'a Row, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = row.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// The string an id is addressed by, so that `2` and `"2"` are the same key.
pub fn key_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
                    _ => n.to_string(),
                }
            }
        }
        other => other.to_string(),
    }
}

/// Empty-ish values: null, false, 0, "", "0", empty containers.
pub fn is_falsy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
        Some(Value::String(s)) => s.is_empty() || s == "0",
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
    }
}

/// Loose equality used by conditions and fetch-one lookups.
pub fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (_, Value::Array(options)) => options.iter().any(|o| loosely_equal(actual, o)),
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => key_string(actual) == key_string(expected),
    }
}

fn sort_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(_) => 4,
    }
}

/// Ascending order for `order_by` values. Nulls sort first.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => sort_rank(a).cmp(&sort_rank(b)),
    }
}

fn matches_condition(row: &Row, condition: &Condition) -> bool {
    condition.iter().all(|(field, expected)| {
        let actual = lookup_path(row, field).unwrap_or(&Value::Null);
        loosely_equal(actual, expected)
    })
}

// ============================================================================
// In-memory dataset
// ============================================================================

/// How a relation name maps onto another entity.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationDef {
    pub entity: String,
    #[serde(default = "default_local_field")]
    pub local_field: String,
    pub foreign_field: String,
    /// Load every match as an array instead of the first match.
    #[serde(default)]
    pub many: bool,
}

fn default_local_field() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityData {
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub relations: HashMap<String, RelationDef>,
}

/// On-disk dataset layout: `{"entities": {"category": {"rows": [...]}}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub entities: HashMap<String, EntityData>,
}

/// Row source backed by a JSON dataset held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowSource {
    entities: HashMap<String, EntityData>,
}

impl MemoryRowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dataset(dataset: Dataset) -> Self {
        Self {
            entities: dataset.entities,
        }
    }

    /// Load a dataset file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset: {:?}", path))?;
        let dataset: Dataset = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse dataset: {:?}", path))?;

        for (name, data) in &dataset.entities {
            info!("Loaded entity '{}' ({} rows) from {:?}", name, data.rows.len(), path);
        }

        Ok(Self::from_dataset(dataset))
    }

    /// Add or replace an entity's rows.
    pub fn with_entity(mut self, name: impl Into<String>, rows: Vec<Row>) -> Self {
        self.entities.entry(name.into()).or_default().rows = rows;
        self
    }

    /// Declare a relation on an existing or new entity.
    pub fn with_relation(
        mut self,
        entity: impl Into<String>,
        relation: impl Into<String>,
        def: RelationDef,
    ) -> Self {
        self.entities
            .entry(entity.into())
            .or_default()
            .relations
            .insert(relation.into(), def);
        self
    }

    fn entity(&self, name: &str) -> Result<&EntityData, SourceError> {
        self.entities
            .get(name)
            .ok_or_else(|| SourceError::UnknownEntity(name.to_string()))
    }

    fn relation_defs<'a>(
        entity: &str,
        data: &'a EntityData,
        names: &'a [String],
    ) -> Result<Vec<(&'a str, &'a RelationDef)>, SourceError> {
        names
            .iter()
            .map(|name| {
                data.relations
                    .get(name)
                    .map(|def| (name.as_str(), def))
                    .ok_or_else(|| SourceError::UnknownRelation {
                        entity: entity.to_string(),
                        relation: name.clone(),
                    })
            })
            .collect()
    }

    fn load_relation(
        &self,
        row: &mut Row,
        name: &str,
        def: &RelationDef,
    ) -> Result<(), SourceError> {
        let foreign = self.entity(&def.entity)?;
        let Some(local) = row.get(&def.local_field).filter(|v| !v.is_null()).cloned() else {
            let empty = if def.many {
                Value::Array(Vec::new())
            } else {
                Value::Null
            };
            row.insert(name.to_string(), empty);
            return Ok(());
        };

        let mut matched = foreign
            .rows
            .iter()
            .filter(|r| {
                r.get(&def.foreign_field)
                    .map(|v| loosely_equal(v, &local))
                    .unwrap_or(false)
            })
            .map(|r| Value::Object(r.clone()));

        let loaded = if def.many {
            Value::Array(matched.collect())
        } else {
            matched.next().unwrap_or(Value::Null)
        };
        row.insert(name.to_string(), loaded);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RowSource for MemoryRowSource {
    fn has_entity(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    async fn fetch_all(&self, query: &RowQuery) -> Result<Vec<Row>, SourceError> {
        let data = self.entity(&query.entity)?;

        let relations = Self::relation_defs(&query.entity, data, &query.relations)?;

        let mut rows = Vec::new();
        for row in &data.rows {
            let mut row = row.clone();
            for (name, def) in &relations {
                self.load_relation(&mut row, name, def)?;
            }
            if matches_condition(&row, &query.condition) {
                rows.push(row);
            }
        }

        // Stable, so equal sort keys keep dataset order.
        rows.sort_by(|a, b| {
            compare_values(lookup_path(a, &query.order_by), lookup_path(b, &query.order_by))
        });

        debug!(
            "MemoryRowSource: fetched {} of {} rows from '{}'",
            rows.len(),
            data.rows.len(),
            query.entity
        );
        Ok(rows)
    }

    async fn fetch_one(
        &self,
        entity: &str,
        field: &str,
        value: &Value,
        relations: &[String],
    ) -> Result<Option<Row>, SourceError> {
        let data = self.entity(entity)?;
        let relations = Self::relation_defs(entity, data, relations)?;

        let Some(found) = data
            .rows
            .iter()
            .find(|r| lookup_path(r, field).map(|v| loosely_equal(v, value)).unwrap_or(false))
        else {
            return Ok(None);
        };

        let mut row = found.clone();
        for (name, def) in &relations {
            self.load_relation(&mut row, name, def)?;
        }
        Ok(Some(row))
    }
}
