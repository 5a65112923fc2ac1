//! Client-side configuration for a tree picker bound to a form input.
//!
//! The picker is a hidden input plus a jsTree instance that loads its data
//! from the tree action. Only the configuration is produced here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::TreeActionConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PickerQuery {
    pub input_id: Option<String>,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PickerConfig {
    pub input_id: String,
    pub tree_id: String,
    pub multiple: bool,
    pub data_url: String,
    pub options: Value,
}

pub fn picker_config(config: &TreeActionConfig, query: &PickerQuery) -> PickerConfig {
    let input_id = query
        .input_id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("input_tree__{}", config.name));

    let mut options = config.picker.clone();
    merge_json(
        &mut options,
        json!({
            "core": {
                "multiple": query.multiple,
                "dblclick_toggle": false,
            }
        }),
    );

    PickerConfig {
        tree_id: format!("{}__tree", input_id),
        input_id,
        multiple: query.multiple,
        data_url: format!("/trees/{}", config.name),
        options,
    }
}

/// Recursive merge: objects merge key by key, arrays append, anything else
/// is replaced by `overlay`.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base), Value::Array(overlay)) => base.extend(overlay),
        (base, overlay) => *base = overlay,
    }
}
