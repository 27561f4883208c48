//! # Expression Layer
//!
//! Document expressions for aggregation stages: field references (`DocVar`),
//! literals, arithmetic and comparison operators, conditionals, and the
//! group-operator sub-family that is only valid inside a group stage.
//!
//! All expressions support a uniform bottom-up rewrite (`map_up`) and
//! reference rewriting (`rewrite_refs`). Reference collection is a pure fold
//! into a caller-provided accumulator.

use serde_json::{json, Value};

use crate::error::{PlanError, PlanResult};

// ============================================================================
// Field paths
// ============================================================================

/// One step of a field path: a named field or a positional index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub enum PathElement {
    /// Named document field
    Field(String),
    /// Positional array index
    Index(usize),
}

impl std::fmt::Display for PathElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathElement::Field(name) => write!(f, "{name}"),
            PathElement::Index(idx) => write!(f, "{idx}"),
        }
    }
}

/// A rooted field path inside the current document.
///
/// The empty path is the document root. Paths compare by prefix
/// (`starts_with`) and concatenate with [`DocVar::concat`], which is how a
/// sub-plan's output is relocated under a new base during merges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, serde::Serialize)]
pub struct DocVar(Vec<PathElement>);

impl DocVar {
    /// The document root.
    pub fn root() -> Self {
        DocVar(Vec::new())
    }

    /// A single named field under the root.
    pub fn field(name: impl Into<String>) -> Self {
        DocVar(vec![PathElement::Field(name.into())])
    }

    /// Build a path from elements.
    pub fn new(elements: Vec<PathElement>) -> Self {
        DocVar(elements)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    /// Append a named field.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut elements = self.0.clone();
        elements.push(PathElement::Field(name.into()));
        DocVar(elements)
    }

    /// Append a positional index.
    pub fn child_index(&self, idx: usize) -> Self {
        let mut elements = self.0.clone();
        elements.push(PathElement::Index(idx));
        DocVar(elements)
    }

    /// Concatenation: `self` then `other`.
    pub fn concat(&self, other: &DocVar) -> Self {
        let mut elements = self.0.clone();
        elements.extend(other.0.iter().cloned());
        DocVar(elements)
    }

    /// Prefix comparison: does `self` start with `prefix`?
    pub fn starts_with(&self, prefix: &DocVar) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Liveness test used by field pruning: one path contains the other.
    pub fn overlaps(&self, other: &DocVar) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// The first path element, if any.
    pub fn head(&self) -> Option<&PathElement> {
        self.0.first()
    }

    /// Key-position rendering: `a.b.0`. Empty for the root.
    pub fn key(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl std::fmt::Display for DocVar {
    /// Expression-position rendering: `$a.b.0`, or `$$ROOT` for the root.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            write!(f, "$$ROOT")
        } else {
            write!(f, "${}", self.key())
        }
    }
}

// ============================================================================
// Expressions
// ============================================================================

/// A document expression usable inside project, redact, and group stages.
///
/// Note: `Expression` does not implement `Eq` or `Hash` because literal
/// values carry floats.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Expression {
    /// Literal scalar/document/array value
    Literal(Value),
    /// Field reference
    Var(DocVar),

    // Arithmetic
    Add(Box<Expression>, Box<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Box<Expression>, Box<Expression>),
    Divide(Box<Expression>, Box<Expression>),
    Mod(Box<Expression>, Box<Expression>),

    // Comparison
    Eq(Box<Expression>, Box<Expression>),
    Neq(Box<Expression>, Box<Expression>),
    Lt(Box<Expression>, Box<Expression>),
    Lte(Box<Expression>, Box<Expression>),
    Gt(Box<Expression>, Box<Expression>),
    Gte(Box<Expression>, Box<Expression>),
    /// Three-way comparison
    Cmp(Box<Expression>, Box<Expression>),

    // Conditional
    Cond {
        pred: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    IfNull(Box<Expression>, Box<Expression>),

    /// Group-operator family, only valid inside a group stage
    Group(GroupOp),
}

impl Expression {
    /// Reference to the document root.
    pub fn root() -> Self {
        Expression::Var(DocVar::root())
    }

    /// Reference to a single named field.
    pub fn field(name: impl Into<String>) -> Self {
        Expression::Var(DocVar::field(name))
    }

    /// Literal value.
    pub fn literal(value: Value) -> Self {
        Expression::Literal(value)
    }

    /// Uniform bottom-up rewrite: children are rewritten first, then `f` is
    /// applied to the rebuilt node.
    pub fn map_up(self, f: &mut impl FnMut(Expression) -> Expression) -> Expression {
        let rebuilt = match self {
            Expression::Literal(_) | Expression::Var(_) => self,
            Expression::Add(l, r) => Expression::Add(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Subtract(l, r) => {
                Expression::Subtract(Box::new(l.map_up(f)), Box::new(r.map_up(f)))
            }
            Expression::Multiply(l, r) => {
                Expression::Multiply(Box::new(l.map_up(f)), Box::new(r.map_up(f)))
            }
            Expression::Divide(l, r) => {
                Expression::Divide(Box::new(l.map_up(f)), Box::new(r.map_up(f)))
            }
            Expression::Mod(l, r) => Expression::Mod(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Eq(l, r) => Expression::Eq(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Neq(l, r) => Expression::Neq(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Lt(l, r) => Expression::Lt(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Lte(l, r) => Expression::Lte(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Gt(l, r) => Expression::Gt(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Gte(l, r) => Expression::Gte(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Cmp(l, r) => Expression::Cmp(Box::new(l.map_up(f)), Box::new(r.map_up(f))),
            Expression::Cond {
                pred,
                then,
                otherwise,
            } => Expression::Cond {
                pred: Box::new(pred.map_up(f)),
                then: Box::new(then.map_up(f)),
                otherwise: Box::new(otherwise.map_up(f)),
            },
            Expression::IfNull(l, r) => {
                Expression::IfNull(Box::new(l.map_up(f)), Box::new(r.map_up(f)))
            }
            Expression::Group(op) => Expression::Group(op.map_expr(&mut |e| e.map_up(f))),
        };
        f(rebuilt)
    }

    /// Apply a partial field-path substitution to every reference.
    ///
    /// Paths outside `f`'s domain are left untouched.
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> Expression {
        self.map_up(&mut |e| match e {
            Expression::Var(v) => match f(&v) {
                Some(rebased) => Expression::Var(rebased),
                None => Expression::Var(v),
            },
            other => other,
        })
    }

    /// Replace every reference with an expression from `f`.
    ///
    /// Returns `None` as soon as a reference is outside `f`'s domain, which is
    /// how project inlining detects that it cannot fuse.
    pub fn substitute(&self, f: &impl Fn(&DocVar) -> Option<Expression>) -> Option<Expression> {
        let pair = |l: &Expression, r: &Expression| -> Option<(Box<Expression>, Box<Expression>)> {
            Some((Box::new(l.substitute(f)?), Box::new(r.substitute(f)?)))
        };
        Some(match self {
            Expression::Literal(v) => Expression::Literal(v.clone()),
            Expression::Var(v) => return f(v),
            Expression::Add(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Add(l, r)
            }
            Expression::Subtract(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Subtract(l, r)
            }
            Expression::Multiply(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Multiply(l, r)
            }
            Expression::Divide(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Divide(l, r)
            }
            Expression::Mod(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Mod(l, r)
            }
            Expression::Eq(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Eq(l, r)
            }
            Expression::Neq(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Neq(l, r)
            }
            Expression::Lt(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Lt(l, r)
            }
            Expression::Lte(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Lte(l, r)
            }
            Expression::Gt(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Gt(l, r)
            }
            Expression::Gte(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Gte(l, r)
            }
            Expression::Cmp(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::Cmp(l, r)
            }
            Expression::Cond {
                pred,
                then,
                otherwise,
            } => Expression::Cond {
                pred: Box::new(pred.substitute(f)?),
                then: Box::new(then.substitute(f)?),
                otherwise: Box::new(otherwise.substitute(f)?),
            },
            Expression::IfNull(l, r) => {
                let (l, r) = pair(l, r)?;
                Expression::IfNull(l, r)
            }
            Expression::Group(op) => Expression::Group(op.substitute(f)?),
        })
    }

    /// Collect every field reference into `acc`, in traversal order.
    pub fn collect_refs(&self, acc: &mut Vec<DocVar>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Var(v) => acc.push(v.clone()),
            Expression::Add(l, r)
            | Expression::Subtract(l, r)
            | Expression::Multiply(l, r)
            | Expression::Divide(l, r)
            | Expression::Mod(l, r)
            | Expression::Eq(l, r)
            | Expression::Neq(l, r)
            | Expression::Lt(l, r)
            | Expression::Lte(l, r)
            | Expression::Gt(l, r)
            | Expression::Gte(l, r)
            | Expression::Cmp(l, r)
            | Expression::IfNull(l, r) => {
                l.collect_refs(acc);
                r.collect_refs(acc);
            }
            Expression::Cond {
                pred,
                then,
                otherwise,
            } => {
                pred.collect_refs(acc);
                then.collect_refs(acc);
                otherwise.collect_refs(acc);
            }
            Expression::Group(op) => op.expr().collect_refs(acc),
        }
    }

    /// Downcast to a group operator.
    ///
    /// Fails when a rewrite has left a plain expression where a group stage
    /// requires a group operator.
    pub fn into_group_op(self, field: &str) -> PlanResult<GroupOp> {
        match self {
            Expression::Group(op) => Ok(op),
            _ => Err(PlanError::NonGroupOpRewrite {
                field: field.to_string(),
            }),
        }
    }

    /// Render in native aggregation syntax.
    pub fn to_json(&self) -> Value {
        let op = |name: &str, l: &Expression, r: &Expression| -> Value {
            json!({ name: [l.to_json(), r.to_json()] })
        };
        match self {
            Expression::Literal(v) => json!({ "$literal": v }),
            Expression::Var(v) => Value::String(v.to_string()),
            Expression::Add(l, r) => op("$add", l, r),
            Expression::Subtract(l, r) => op("$subtract", l, r),
            Expression::Multiply(l, r) => op("$multiply", l, r),
            Expression::Divide(l, r) => op("$divide", l, r),
            Expression::Mod(l, r) => op("$mod", l, r),
            Expression::Eq(l, r) => op("$eq", l, r),
            Expression::Neq(l, r) => op("$ne", l, r),
            Expression::Lt(l, r) => op("$lt", l, r),
            Expression::Lte(l, r) => op("$lte", l, r),
            Expression::Gt(l, r) => op("$gt", l, r),
            Expression::Gte(l, r) => op("$gte", l, r),
            Expression::Cmp(l, r) => op("$cmp", l, r),
            Expression::Cond {
                pred,
                then,
                otherwise,
            } => json!({ "$cond": [pred.to_json(), then.to_json(), otherwise.to_json()] }),
            Expression::IfNull(l, r) => op("$ifNull", l, r),
            Expression::Group(g) => g.to_json(),
        }
    }
}

// ============================================================================
// Group operators
// ============================================================================

/// Accumulator expressions valid only inside a group stage.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum GroupOp {
    Sum(Box<Expression>),
    Avg(Box<Expression>),
    Push(Box<Expression>),
    AddToSet(Box<Expression>),
    First(Box<Expression>),
    Last(Box<Expression>),
    Max(Box<Expression>),
    Min(Box<Expression>),
}

impl GroupOp {
    /// The operand expression.
    pub fn expr(&self) -> &Expression {
        match self {
            GroupOp::Sum(e)
            | GroupOp::Avg(e)
            | GroupOp::Push(e)
            | GroupOp::AddToSet(e)
            | GroupOp::First(e)
            | GroupOp::Last(e)
            | GroupOp::Max(e)
            | GroupOp::Min(e) => e,
        }
    }

    /// Rebuild with a transformed operand. Type-preserving by construction:
    /// the accumulator kind never changes.
    pub fn map_expr(self, f: &mut impl FnMut(Expression) -> Expression) -> GroupOp {
        match self {
            GroupOp::Sum(e) => GroupOp::Sum(Box::new(f(*e))),
            GroupOp::Avg(e) => GroupOp::Avg(Box::new(f(*e))),
            GroupOp::Push(e) => GroupOp::Push(Box::new(f(*e))),
            GroupOp::AddToSet(e) => GroupOp::AddToSet(Box::new(f(*e))),
            GroupOp::First(e) => GroupOp::First(Box::new(f(*e))),
            GroupOp::Last(e) => GroupOp::Last(Box::new(f(*e))),
            GroupOp::Max(e) => GroupOp::Max(Box::new(f(*e))),
            GroupOp::Min(e) => GroupOp::Min(Box::new(f(*e))),
        }
    }

    /// Apply a partial field-path substitution to the operand.
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> GroupOp {
        self.map_expr(&mut |e| e.rewrite_refs(f))
    }

    /// Replace operand references with expressions from `f`; `None` when any
    /// reference is outside `f`'s domain.
    pub fn substitute(&self, f: &impl Fn(&DocVar) -> Option<Expression>) -> Option<GroupOp> {
        let inner = self.expr().substitute(f)?;
        Some(self.clone().map_expr(&mut |_| inner.clone()))
    }

    pub fn to_json(&self) -> Value {
        let (name, e) = match self {
            GroupOp::Sum(e) => ("$sum", e),
            GroupOp::Avg(e) => ("$avg", e),
            GroupOp::Push(e) => ("$push", e),
            GroupOp::AddToSet(e) => ("$addToSet", e),
            GroupOp::First(e) => ("$first", e),
            GroupOp::Last(e) => ("$last", e),
            GroupOp::Max(e) => ("$max", e),
            GroupOp::Min(e) => ("$min", e),
        };
        json!({ name: e.to_json() })
    }
}

/// The ordered output-name to group-operator mapping of a group stage.
///
/// Invariant: values are always group operators. Rewrites go through
/// [`GroupOp`] so the invariant holds by construction; inlining passes that
/// substitute whole expressions must re-check with
/// [`Expression::into_group_op`].
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize)]
pub struct Grouped(pub Vec<(String, GroupOp)>);

impl Grouped {
    pub fn new(fields: Vec<(String, GroupOp)>) -> Self {
        Grouped(fields)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&GroupOp> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, op)| op)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    pub fn fields(&self) -> &[(String, GroupOp)] {
        &self.0
    }

    /// Apply a partial field-path substitution to every operand.
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> Grouped {
        Grouped(
            self.0
                .into_iter()
                .map(|(n, op)| (n, op.rewrite_refs(f)))
                .collect(),
        )
    }

    /// Replace operand references with expressions from `f`; `None` when any
    /// reference fails to resolve.
    pub fn substitute(&self, f: &impl Fn(&DocVar) -> Option<Expression>) -> Option<Grouped> {
        let mut fields = Vec::with_capacity(self.0.len());
        for (name, op) in &self.0 {
            fields.push((name.clone(), op.substitute(f)?));
        }
        Some(Grouped(fields))
    }

    /// Collect operand references into `acc`.
    pub fn collect_refs(&self, acc: &mut Vec<DocVar>) {
        for (_, op) in &self.0 {
            op.expr().collect_refs(acc);
        }
    }

    pub fn to_json(&self) -> Value {
        let mut doc = serde_json::Map::new();
        for (name, op) in &self.0 {
            doc.insert(name.clone(), op.to_json());
        }
        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docvar_concat_and_prefix() {
        let a = DocVar::field("a").child("b");
        let b = DocVar::field("c");
        let joined = a.concat(&b);

        assert_eq!(joined.key(), "a.b.c");
        assert!(joined.starts_with(&a));
        assert!(!a.starts_with(&joined));
        assert!(joined.overlaps(&a));
        assert!(a.overlaps(&joined));
    }

    #[test]
    fn test_docvar_root_rendering() {
        assert_eq!(DocVar::root().to_string(), "$$ROOT");
        assert_eq!(DocVar::field("a").child("b").to_string(), "$a.b");
        assert_eq!(DocVar::field("a").child_index(0).to_string(), "$a.0");
    }

    #[test]
    fn test_rewrite_refs_rebases_vars() {
        let expr = Expression::Add(
            Box::new(Expression::field("x")),
            Box::new(Expression::Literal(json!(1))),
        );
        let base = DocVar::field("lEft");
        let rebased = expr.rewrite_refs(&|v| Some(base.concat(v)));

        assert_eq!(
            rebased,
            Expression::Add(
                Box::new(Expression::Var(DocVar::field("lEft").child("x"))),
                Box::new(Expression::Literal(json!(1))),
            )
        );
    }

    #[test]
    fn test_rewrite_refs_outside_domain_is_identity() {
        let expr = Expression::field("x");
        let rewritten = expr.clone().rewrite_refs(&|_| None);
        assert_eq!(rewritten, expr);
    }

    #[test]
    fn test_substitute_fails_on_unresolved_ref() {
        let expr = Expression::Add(
            Box::new(Expression::field("known")),
            Box::new(Expression::field("unknown")),
        );
        let result = expr.substitute(&|v| {
            (v == &DocVar::field("known")).then(|| Expression::Literal(json!(7)))
        });
        assert_eq!(result, None);
    }

    #[test]
    fn test_group_op_rewrite_preserves_kind() {
        let op = GroupOp::Sum(Box::new(Expression::field("a")));
        let rewritten = op.rewrite_refs(&|v| Some(DocVar::field("rIght").concat(v)));
        assert!(matches!(rewritten, GroupOp::Sum(_)));
    }

    #[test]
    fn test_into_group_op_rejects_plain_expression() {
        let err = Expression::field("a").into_group_op("total").unwrap_err();
        assert_eq!(
            err,
            PlanError::NonGroupOpRewrite {
                field: "total".to_string()
            }
        );
    }

    #[test]
    fn test_collect_refs_in_traversal_order() {
        let expr = Expression::Cond {
            pred: Box::new(Expression::field("p")),
            then: Box::new(Expression::field("t")),
            otherwise: Box::new(Expression::field("e")),
        };
        let mut refs = Vec::new();
        expr.collect_refs(&mut refs);
        assert_eq!(
            refs,
            vec![DocVar::field("p"), DocVar::field("t"), DocVar::field("e")]
        );
    }

    #[test]
    fn test_expression_to_json() {
        let expr = Expression::Multiply(
            Box::new(Expression::field("price")),
            Box::new(Expression::Literal(json!(2))),
        );
        assert_eq!(
            expr.to_json(),
            json!({ "$multiply": ["$price", { "$literal": 2 }] })
        );
    }

    #[test]
    fn test_grouped_preserves_insertion_order() {
        let grouped = Grouped::new(vec![
            ("z".to_string(), GroupOp::Sum(Box::new(Expression::field("a")))),
            ("a".to_string(), GroupOp::Avg(Box::new(Expression::field("b")))),
        ]);
        let names: Vec<_> = grouped.names().collect();
        assert_eq!(names, vec!["z", "a"]);
    }
}
