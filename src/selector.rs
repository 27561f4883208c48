//! # Selectors
//!
//! The find-query language used by match stages and geo-near queries:
//! per-field predicate tests, conjunction/disjunction, and the JS escape
//! hatch (`where`). A selector is a pure description; rendering to the
//! native query document happens in [`Selector::to_json`].
//!
//! Pipelinability is the one interesting decision a selector carries: a
//! selector containing a `where` anywhere cannot run as a native pipeline
//! stage and forces the map-reduce fallback at crush time.

use serde_json::{json, Value};

use crate::expr::DocVar;
use crate::js;

/// Per-field predicate tests.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Predicate {
    Eq(Value),
    Neq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

impl Predicate {
    fn to_json(&self) -> Value {
        match self {
            Predicate::Eq(v) => v.clone(),
            Predicate::Neq(v) => json!({ "$ne": v }),
            Predicate::Gt(v) => json!({ "$gt": v }),
            Predicate::Gte(v) => json!({ "$gte": v }),
            Predicate::Lt(v) => json!({ "$lt": v }),
            Predicate::Lte(v) => json!({ "$lte": v }),
            Predicate::In(vs) => json!({ "$in": vs }),
            Predicate::Nin(vs) => json!({ "$nin": vs }),
            Predicate::Exists(b) => json!({ "$exists": b }),
        }
    }
}

/// A find-query selector.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Selector {
    /// Test one field against a predicate
    Field { field: DocVar, predicate: Predicate },
    And(Box<Selector>, Box<Selector>),
    Or(Box<Selector>, Box<Selector>),
    Nor(Box<Selector>, Box<Selector>),
    /// JS escape hatch; unpipelinable
    Where(js::Func),
}

impl Selector {
    /// Test a single field.
    pub fn field(field: DocVar, predicate: Predicate) -> Self {
        Selector::Field { field, predicate }
    }

    /// Equality on a single named top-level field.
    pub fn eq(name: impl Into<String>, value: Value) -> Self {
        Selector::Field {
            field: DocVar::field(name),
            predicate: Predicate::Eq(value),
        }
    }

    /// Canonical conjunction, used by match-over-match coalescing.
    pub fn and(left: Selector, right: Selector) -> Self {
        Selector::And(Box::new(left), Box::new(right))
    }

    /// A selector is pipelinable iff it contains no JS predicate anywhere.
    /// Compound selectors propagate the decision by conjunction.
    pub fn is_pipelinable(&self) -> bool {
        match self {
            Selector::Field { .. } => true,
            Selector::And(l, r) | Selector::Or(l, r) | Selector::Nor(l, r) => {
                l.is_pipelinable() && r.is_pipelinable()
            }
            Selector::Where(_) => false,
        }
    }

    /// Apply a partial field-path substitution to every tested field.
    ///
    /// The `where` escape is opaque to path rewriting; its function body is
    /// carried unchanged.
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> Selector {
        match self {
            Selector::Field { field, predicate } => {
                let field = f(&field).unwrap_or(field);
                Selector::Field { field, predicate }
            }
            Selector::And(l, r) => {
                Selector::And(Box::new(l.rewrite_refs(f)), Box::new(r.rewrite_refs(f)))
            }
            Selector::Or(l, r) => {
                Selector::Or(Box::new(l.rewrite_refs(f)), Box::new(r.rewrite_refs(f)))
            }
            Selector::Nor(l, r) => {
                Selector::Nor(Box::new(l.rewrite_refs(f)), Box::new(r.rewrite_refs(f)))
            }
            Selector::Where(func) => Selector::Where(func),
        }
    }

    /// Collect every tested field path into `acc`.
    pub fn collect_refs(&self, acc: &mut Vec<DocVar>) {
        match self {
            Selector::Field { field, .. } => acc.push(field.clone()),
            Selector::And(l, r) | Selector::Or(l, r) | Selector::Nor(l, r) => {
                l.collect_refs(acc);
                r.collect_refs(acc);
            }
            Selector::Where(_) => {}
        }
    }

    /// Render as a native query document.
    pub fn to_json(&self) -> Value {
        match self {
            Selector::Field { field, predicate } => {
                let mut doc = serde_json::Map::new();
                doc.insert(field.key(), predicate.to_json());
                Value::Object(doc)
            }
            Selector::And(l, r) => json!({ "$and": [l.to_json(), r.to_json()] }),
            Selector::Or(l, r) => json!({ "$or": [l.to_json(), r.to_json()] }),
            Selector::Nor(l, r) => json!({ "$nor": [l.to_json(), r.to_json()] }),
            Selector::Where(func) => json!({ "$where": func.to_string() }),
        }
    }
}
