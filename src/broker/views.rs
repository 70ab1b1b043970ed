//! Live view definitions and the per-context View Cache.
//!
//! A view is the last ordering, histogram or group-by request a client made
//! for a dimension. After every mutating call the cached views are replayed
//! against the compute worker so attached clients converge on the new
//! filtered state. Views are only ever overwritten, never edited in place.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::Value;

use super::key::SessionKey;
use super::wire::WorkerCommand;

// ── Ordering parameters ───────────────────────────────────────────────────────

/// Which end of the ordered column to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Top,
    Bottom,
    All,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Top    => "top",
            SortOrder::Bottom => "bottom",
            SortOrder::All    => "all",
        }
    }
}

/// Ordering request for a dimension: `sort_order` rows, `row_count` of them,
/// projecting `columns`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowOrder {
    pub sort_order: SortOrder,
    /// `None` is only meaningful together with [`SortOrder::All`].
    pub row_count:  Option<u32>,
    pub columns:    String,
}

/// Ordering request for a group-by result.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRowOrder {
    pub sort_order:  SortOrder,
    pub row_count:   Option<u32>,
    pub sort_column: String,
}

// ── Aggregation spec ──────────────────────────────────────────────────────────

/// A group-by aggregation such as `{"amount": ["sum", "mean"]}`.
///
/// `wire` is what the worker receives; `key` identifies the aggregation within
/// a dimension (`amount:sum:mean`), matching how the worker keys its groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationSpec {
    wire: String,
    key:  String,
}

impl AggregationSpec {
    /// Build from the client's value, which is either the object itself or its
    /// JSON text.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(_) => Self::from_object(value),
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed @ Value::Object(_)) => Self::from_object(&parsed),
                _ => AggregationSpec { wire: text.clone(), key: text.clone() },
            },
            other => {
                let text = other.to_string();
                AggregationSpec { wire: text.clone(), key: text }
            }
        }
    }

    fn from_object(value: &Value) -> Self {
        let mut parts: Vec<String> = Vec::new();
        if let Value::Object(map) = value {
            parts.extend(map.keys().cloned());
            match map.values().next() {
                Some(Value::Array(aggs)) => parts.extend(aggs.iter().map(value_text)),
                Some(single) => parts.push(value_text(single)),
                None => {}
            }
        }
        AggregationSpec { wire: value.to_string(), key: parts.join(":") }
    }

    pub fn wire(&self) -> &str { &self.wire }

    pub fn key(&self) -> &str { &self.key }
}

/// Render a JSON scalar the way it appears in a query string: strings without
/// quotes, arrays joined by commas, everything else as JSON text.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null      => String::new(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

// ── View definitions ──────────────────────────────────────────────────────────

/// Identity of a view inside one context. A newer definition with the same
/// identity replaces the older one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewId {
    DimensionOrder(String),
    Histogram(String),
    GroupOrder(String, String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewDefinition {
    /// `order` is `None` for a dimension that was loaded but never ordered.
    DimensionOrder {
        dimension: String,
        order:     Option<RowOrder>,
    },
    Histogram {
        dimension: String,
        bins:      u32,
    },
    /// `order` is `None` for a group-by that was loaded but never ordered.
    GroupOrder {
        dimension:   String,
        aggregation: AggregationSpec,
        order:       Option<GroupRowOrder>,
    },
}

impl ViewDefinition {
    pub fn id(&self) -> ViewId {
        match self {
            ViewDefinition::DimensionOrder { dimension, .. } => {
                ViewId::DimensionOrder(dimension.clone())
            }
            ViewDefinition::Histogram { dimension, .. } => ViewId::Histogram(dimension.clone()),
            ViewDefinition::GroupOrder { dimension, aggregation, .. } => {
                ViewId::GroupOrder(dimension.clone(), aggregation.key().to_string())
            }
        }
    }

    pub fn dimension(&self) -> &str {
        match self {
            ViewDefinition::DimensionOrder { dimension, .. }
            | ViewDefinition::Histogram { dimension, .. }
            | ViewDefinition::GroupOrder { dimension, .. } => dimension,
        }
    }

    /// The worker command that recomputes this view, or `None` when the view
    /// has no ordering to replay yet.
    pub fn replay_command(&self) -> Option<WorkerCommand> {
        match self {
            ViewDefinition::DimensionOrder { dimension, order } => {
                order.as_ref().map(|order| WorkerCommand::DimensionFilterOrder {
                    dimension: dimension.clone(),
                    order:     order.clone(),
                })
            }
            ViewDefinition::Histogram { dimension, bins } => Some(WorkerCommand::DimensionHist {
                dimension: dimension.clone(),
                bins:      *bins,
            }),
            ViewDefinition::GroupOrder { dimension, aggregation, order } => {
                order.as_ref().map(|order| WorkerCommand::GroupbyFilterOrder {
                    dimension:   dimension.clone(),
                    aggregation: aggregation.clone(),
                    order:       order.clone(),
                })
            }
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────────

/// Last-issued view definitions, grouped by compute context.
#[derive(Debug, Default)]
pub struct ViewCache {
    views: HashMap<SessionKey, BTreeMap<ViewId, ViewDefinition>>,
}

impl ViewCache {
    pub fn new() -> Self { Self::default() }

    /// Store `view`, replacing any definition with the same identity.
    pub fn put(&mut self, key: &SessionKey, view: ViewDefinition) {
        self.views.entry(key.clone()).or_default().insert(view.id(), view);
    }

    /// Store `view` only if nothing with its identity is cached yet.
    /// Returns `true` when the view was inserted.
    pub fn register(&mut self, key: &SessionKey, view: ViewDefinition) -> bool {
        let slot = self.views.entry(key.clone()).or_default();
        let id = view.id();
        if slot.contains_key(&id) {
            return false;
        }
        slot.insert(id, view);
        true
    }

    /// Remove `view` if it is still what is cached under its identity.
    pub fn remove_if_current(&mut self, key: &SessionKey, view: &ViewDefinition) -> bool {
        let Some(slot) = self.views.get_mut(key) else { return false };
        let id = view.id();
        if slot.get(&id) != Some(view) {
            return false;
        }
        slot.remove(&id);
        if slot.is_empty() {
            self.views.remove(key);
        }
        true
    }

    pub fn for_each(&self, key: &SessionKey, f: impl FnMut(&ViewDefinition)) {
        if let Some(views) = self.views.get(key) {
            views.values().for_each(f);
        }
    }

    /// Copy of every view cached for `key`, in identity order.
    pub fn snapshot(&self, key: &SessionKey) -> Vec<ViewDefinition> {
        let mut out = Vec::new();
        self.for_each(key, |view| out.push(view.clone()));
        out
    }

    /// Drop every view for `key`; returns how many were removed.
    pub fn clear(&mut self, key: &SessionKey) -> usize {
        self.views.remove(key).map_or(0, |views| views.len())
    }

    pub fn len(&self, key: &SessionKey) -> usize {
        self.views.get(key).map_or(0, BTreeMap::len)
    }
}
