//! # Reshapes
//!
//! A `Reshape` describes a record constructor: either a document with named
//! fields or an array with positional entries. Field insertion order is
//! preserved and observable, since pipeline stages read fields in declared
//! order.
//!
//! Reshapes merge recursively. Two reshapes merge when no leaf field
//! conflicts; on conflict the merge fails and the caller namespaces both
//! sides under distinct labels instead.

use serde_json::Value;

use crate::expr::{DocVar, Expression, PathElement};

/// A single reshape entry: either a computed expression or a nested reshape.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum FieldValue {
    Expr(Expression),
    Nested(Reshape),
}

impl FieldValue {
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> FieldValue {
        match self {
            FieldValue::Expr(e) => FieldValue::Expr(e.rewrite_refs(f)),
            FieldValue::Nested(r) => FieldValue::Nested(r.rewrite_refs(f)),
        }
    }

    pub fn collect_refs(&self, acc: &mut Vec<DocVar>) {
        match self {
            FieldValue::Expr(e) => e.collect_refs(acc),
            FieldValue::Nested(r) => r.collect_refs(acc),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Expr(e) => e.to_json(),
            FieldValue::Nested(r) => r.to_json(),
        }
    }
}

/// An ordered record constructor, document- or array-shaped.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Reshape {
    /// Ordered field-name to value mapping
    Doc(Vec<(String, FieldValue)>),
    /// Ordered positional-index to value mapping
    Arr(Vec<(usize, FieldValue)>),
}

impl Reshape {
    pub fn doc(fields: Vec<(String, FieldValue)>) -> Self {
        Reshape::Doc(fields)
    }

    pub fn arr(entries: Vec<(usize, FieldValue)>) -> Self {
        Reshape::Arr(entries)
    }

    /// Convenience constructor for a single-field document.
    pub fn doc1(name: impl Into<String>, value: FieldValue) -> Self {
        Reshape::Doc(vec![(name.into(), value)])
    }

    /// Top-level field names of a document reshape, in declared order.
    pub fn field_names(&self) -> Vec<String> {
        match self {
            Reshape::Doc(fields) => fields.iter().map(|(n, _)| n.clone()).collect(),
            Reshape::Arr(entries) => entries.iter().map(|(i, _)| i.to_string()).collect(),
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        match self {
            Reshape::Doc(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            Reshape::Arr(_) => None,
        }
    }

    /// Recursive merge. The result keeps `self`'s field order, with `other`'s
    /// new fields appended in their declared order. A leaf conflict makes the
    /// whole merge fail.
    pub fn merge(&self, other: &Reshape) -> Option<Reshape> {
        match (self, other) {
            (Reshape::Doc(left), Reshape::Doc(right)) => {
                let mut merged = left.clone();
                for (name, rvalue) in right {
                    match merged.iter_mut().find(|(n, _)| n == name) {
                        None => merged.push((name.clone(), rvalue.clone())),
                        Some((_, lvalue)) => {
                            let nested = match (&*lvalue, rvalue) {
                                (FieldValue::Nested(lr), FieldValue::Nested(rr)) => {
                                    lr.merge(rr)?
                                }
                                _ => return None,
                            };
                            *lvalue = FieldValue::Nested(nested);
                        }
                    }
                }
                Some(Reshape::Doc(merged))
            }
            (Reshape::Arr(left), Reshape::Arr(right)) => {
                let mut merged = left.clone();
                for (idx, rvalue) in right {
                    match merged.iter_mut().find(|(i, _)| i == idx) {
                        None => merged.push((*idx, rvalue.clone())),
                        Some((_, lvalue)) => {
                            let nested = match (&*lvalue, rvalue) {
                                (FieldValue::Nested(lr), FieldValue::Nested(rr)) => {
                                    lr.merge(rr)?
                                }
                                _ => return None,
                            };
                            *lvalue = FieldValue::Nested(nested);
                        }
                    }
                }
                Some(Reshape::Arr(merged))
            }
            _ => None,
        }
    }

    /// Resolve a field path against this reshape, synthesizing the expression
    /// that would occupy it.
    ///
    /// A path landing on an expression resolves to that expression; a path
    /// that continues past a plain reference extends the reference. Paths
    /// that land on a nested reshape (or descend into a computed expression)
    /// do not resolve, so callers fall back to keeping both nodes.
    pub fn resolve(&self, path: &DocVar) -> Option<Expression> {
        let mut shape = self;
        let elements = path.elements();
        for (pos, elem) in elements.iter().enumerate() {
            let value = match (shape, elem) {
                (Reshape::Doc(fields), PathElement::Field(name)) => {
                    fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)?
                }
                (Reshape::Arr(entries), PathElement::Index(idx)) => {
                    entries.iter().find(|(i, _)| i == idx).map(|(_, v)| v)?
                }
                _ => return None,
            };
            match value {
                FieldValue::Nested(inner) => shape = inner,
                FieldValue::Expr(e) => {
                    let rest = DocVar::new(elements[pos + 1..].to_vec());
                    if rest.is_root() {
                        return Some(e.clone());
                    }
                    // Descending into a computed expression only works for a
                    // plain reference, which extends by the remaining path.
                    return match e {
                        Expression::Var(v) => Some(Expression::Var(v.concat(&rest))),
                        _ => None,
                    };
                }
            }
        }
        None
    }

    /// Push this reshape through an inner reshape: every reference in `self`
    /// is replaced by its definition in `inner`. `None` when any reference
    /// does not resolve, in which case the caller keeps both projections.
    pub fn inline_in(&self, inner: &Reshape) -> Option<Reshape> {
        let resolve = |v: &DocVar| inner.resolve(v);
        match self {
            Reshape::Doc(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, value) in fields {
                    let inlined = match value {
                        FieldValue::Expr(e) => FieldValue::Expr(e.substitute(&resolve)?),
                        FieldValue::Nested(r) => FieldValue::Nested(r.inline_in(inner)?),
                    };
                    out.push((name.clone(), inlined));
                }
                Some(Reshape::Doc(out))
            }
            Reshape::Arr(entries) => {
                let mut out = Vec::with_capacity(entries.len());
                for (idx, value) in entries {
                    let inlined = match value {
                        FieldValue::Expr(e) => FieldValue::Expr(e.substitute(&resolve)?),
                        FieldValue::Nested(r) => FieldValue::Nested(r.inline_in(inner)?),
                    };
                    out.push((*idx, inlined));
                }
                Some(Reshape::Arr(out))
            }
        }
    }

    /// Apply a partial field-path substitution to every embedded expression.
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> Reshape {
        match self {
            Reshape::Doc(fields) => Reshape::Doc(
                fields
                    .into_iter()
                    .map(|(n, v)| (n, v.rewrite_refs(f)))
                    .collect(),
            ),
            Reshape::Arr(entries) => Reshape::Arr(
                entries
                    .into_iter()
                    .map(|(i, v)| (i, v.rewrite_refs(f)))
                    .collect(),
            ),
        }
    }

    /// Collect every embedded field reference into `acc`.
    pub fn collect_refs(&self, acc: &mut Vec<DocVar>) {
        match self {
            Reshape::Doc(fields) => {
                for (_, v) in fields {
                    v.collect_refs(acc);
                }
            }
            Reshape::Arr(entries) => {
                for (_, v) in entries {
                    v.collect_refs(acc);
                }
            }
        }
    }

    /// Render in native aggregation syntax. Documents keep declared field
    /// order; arrays render in entry order.
    pub fn to_json(&self) -> Value {
        match self {
            Reshape::Doc(fields) => {
                let mut doc = serde_json::Map::new();
                for (name, value) in fields {
                    doc.insert(name.clone(), value.to_json());
                }
                Value::Object(doc)
            }
            Reshape::Arr(entries) => {
                Value::Array(entries.iter().map(|(_, v)| v.to_json()).collect())
            }
        }
    }
}
