use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Schema tag carried by every data context value. Step definitions declare
/// their `data_dependencies` against these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Text,
    Int,
    Decimal,
    Bool,
    Timestamp,
    List,
    Map,
    Blob,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Text => write!(f, "text"),
            ValueKind::Int => write!(f, "int"),
            ValueKind::Decimal => write!(f, "decimal"),
            ValueKind::Bool => write!(f, "bool"),
            ValueKind::Timestamp => write!(f, "timestamp"),
            ValueKind::List => write!(f, "list"),
            ValueKind::Map => write!(f, "map"),
            ValueKind::Blob => write!(f, "blob"),
        }
    }
}

/// A typed value produced and consumed by steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DataValue {
    Text(String),
    Int(i64),
    Decimal(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    List(Vec<DataValue>),
    Map(BTreeMap<String, DataValue>),
    /// Opaque payload the engine stores but never interprets.
    Blob(serde_json::Value),
}

impl DataValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            DataValue::Text(_) => ValueKind::Text,
            DataValue::Int(_) => ValueKind::Int,
            DataValue::Decimal(_) => ValueKind::Decimal,
            DataValue::Bool(_) => ValueKind::Bool,
            DataValue::Timestamp(_) => ValueKind::Timestamp,
            DataValue::List(_) => ValueKind::List,
            DataValue::Map(_) => ValueKind::Map,
            DataValue::Blob(_) => ValueKind::Blob,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DataValue::Int(i) => Some(*i as f64),
            DataValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Truthiness for bare condition expressions: false/empty values are falsy,
    /// everything else present is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            DataValue::Bool(b) => *b,
            DataValue::Text(s) => !s.is_empty(),
            DataValue::Int(i) => *i != 0,
            DataValue::Decimal(d) => *d != 0.0,
            DataValue::Blob(v) => !v.is_null(),
            _ => true,
        }
    }

    /// Resolve a nested member, for dotted-path lookups into map values.
    pub fn member(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataValue::Map(m) => m.get(key),
            _ => None,
        }
    }
}

pub type DataMap = BTreeMap<String, DataValue>;

/// A data context write that violated the merge rules. Either variant is
/// fatal to the flow: the proposed writes are discarded in full.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteViolation {
    #[error("conflicting write to '{key}': step '{step}' and running step '{other}' both declare it as an output")]
    ConflictingWrite {
        step: String,
        key: String,
        other: String,
    },
    #[error("step '{step}' overwrote '{key}' without declaring it as an output")]
    UndeclaredOverwrite { step: String, key: String },
}

/// Per-flow typed key-value store shared across steps.
///
/// Reads inside a running step go against a snapshot captured at launch;
/// writes are deferred until the step completes and are applied here as part
/// of the scheduler's atomic commit. Values are never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataContext {
    values: DataMap,
}

impl DataContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: DataMap) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn kind_of(&self, key: &str) -> Option<ValueKind> {
        self.values.get(key).map(DataValue::kind)
    }

    /// Resolve a dotted path like "kyc.level" into nested map values.
    pub fn resolve_path(&self, path: &str) -> Option<&DataValue> {
        let mut parts = path.split('.');
        let mut current = self.values.get(parts.next()?)?;
        for part in parts {
            current = current.member(part)?;
        }
        Some(current)
    }

    /// Read-consistent view handed to a step at launch.
    pub fn view(&self) -> DataMap {
        self.values.clone()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    /// Seed an initial value. Used only when building a flow, before any
    /// step has run.
    pub fn seed(&mut self, key: impl Into<String>, value: DataValue) {
        self.values.insert(key.into(), value);
    }

    /// Apply a completed step's writes atomically.
    ///
    /// Rules: a key that already exists may only be overwritten when the
    /// writing step declares it as an output; a key declared as an output by
    /// another currently running step is a conflicting write. All keys are
    /// validated before any is applied, so a rejected merge leaves the
    /// context untouched.
    pub fn merge_step_writes(
        &mut self,
        step: &str,
        writes: &DataMap,
        declared_outputs: &[String],
        running_outputs: &BTreeMap<String, String>,
    ) -> Result<(), WriteViolation> {
        for key in writes.keys() {
            if let Some(other) = running_outputs.get(key) {
                return Err(WriteViolation::ConflictingWrite {
                    step: step.to_string(),
                    key: key.clone(),
                    other: other.clone(),
                });
            }
            if self.values.contains_key(key) && !declared_outputs.iter().any(|o| o == key) {
                return Err(WriteViolation::UndeclaredOverwrite {
                    step: step.to_string(),
                    key: key.clone(),
                });
            }
        }
        for (key, value) in writes {
            self.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(key: &str, value: DataValue) -> DataContext {
        let mut ctx = DataContext::new();
        ctx.seed(key, value);
        ctx
    }

    #[test]
    fn kind_tags_match_variants() {
        assert_eq!(DataValue::Int(1).kind(), ValueKind::Int);
        assert_eq!(DataValue::Decimal(1.5).kind(), ValueKind::Decimal);
        assert_eq!(DataValue::Text("x".into()).kind(), ValueKind::Text);
        assert_eq!(DataValue::Bool(true).kind(), ValueKind::Bool);
    }

    #[test]
    fn resolve_path_walks_nested_maps() {
        let mut inner = BTreeMap::new();
        inner.insert("level".to_string(), DataValue::Text("verified".into()));
        let ctx = ctx_with("kyc", DataValue::Map(inner));

        assert_eq!(
            ctx.resolve_path("kyc.level").and_then(DataValue::as_str),
            Some("verified")
        );
        assert!(ctx.resolve_path("kyc.missing").is_none());
    }

    #[test]
    fn undeclared_overwrite_is_rejected_and_context_untouched() {
        let mut ctx = ctx_with("amount", DataValue::Int(1));
        let mut writes = DataMap::new();
        writes.insert("fresh".to_string(), DataValue::Int(2));
        writes.insert("amount".to_string(), DataValue::Int(99));

        let err = ctx
            .merge_step_writes("charge", &writes, &[], &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, WriteViolation::UndeclaredOverwrite { .. }));
        assert_eq!(ctx.get("amount"), Some(&DataValue::Int(1)));
        assert!(!ctx.contains("fresh"));
    }

    #[test]
    fn declared_output_may_overwrite() {
        let mut ctx = ctx_with("amount", DataValue::Int(1));
        let mut writes = DataMap::new();
        writes.insert("amount".to_string(), DataValue::Int(99));

        ctx.merge_step_writes("charge", &writes, &["amount".to_string()], &BTreeMap::new())
            .unwrap();
        assert_eq!(ctx.get("amount"), Some(&DataValue::Int(99)));
    }

    #[test]
    fn conflicting_write_names_the_other_step() {
        let mut ctx = DataContext::new();
        let mut writes = DataMap::new();
        writes.insert("receipt".to_string(), DataValue::Int(7));
        let mut running = BTreeMap::new();
        running.insert("receipt".to_string(), "refund".to_string());

        let err = ctx
            .merge_step_writes("charge", &writes, &["receipt".to_string()], &running)
            .unwrap_err();
        assert_eq!(
            err,
            WriteViolation::ConflictingWrite {
                step: "charge".to_string(),
                key: "receipt".to_string(),
                other: "refund".to_string(),
            }
        );
    }

    #[test]
    fn serde_round_trip_is_lossless() {
        let mut ctx = DataContext::new();
        ctx.seed("name", DataValue::Text("alice".into()));
        ctx.seed("amount", DataValue::Decimal(150.25));
        ctx.seed("approved", DataValue::Bool(true));
        ctx.seed(
            "tags",
            DataValue::List(vec![DataValue::Text("kyc".into()), DataValue::Int(3)]),
        );

        let json = serde_json::to_string(&ctx).unwrap();
        let back: DataContext = serde_json::from_str(&json).unwrap();
        assert_eq!(ctx, back);
    }
}
