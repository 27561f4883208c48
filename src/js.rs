//! # JS Subset
//!
//! The closed, serializable JavaScript subset carried by user-defined
//! map/flat-map/reduce stages and emitted by the map-reduce lowering:
//! literals, identifiers, member access (static and computed), calls,
//! anonymous functions, binary operators, assignment, var declarations,
//! for-in, if, return, and object/array literals.
//!
//! This is a description, not an interpreter. `Display` renders source text
//! deterministically, which is what makes lowered plans comparable in tests.

use serde_json::Value;

use crate::expr::{DocVar, Expression, PathElement};
use crate::reshape::{FieldValue, Reshape};
use crate::selector::{Predicate, Selector};

/// Binary operators of the subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum BinOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Lte => "<=",
            BinOp::Gt => ">",
            BinOp::Gte => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        };
        write!(f, "{op}")
    }
}

/// Expressions of the subset.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Expr {
    Lit(Value),
    Ident(String),
    /// Static member access: `base.name`
    Select(Box<Expr>, String),
    /// Computed member access: `base[index]`
    Access(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    /// Anonymous function expression
    Func(Func),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Obj(Vec<(String, Expr)>),
    Arr(Vec<Expr>),
}

impl Expr {
    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }

    pub fn select(self, name: impl Into<String>) -> Self {
        Expr::Select(Box::new(self), name.into())
    }

    pub fn call(self, args: Vec<Expr>) -> Self {
        Expr::Call(Box::new(self), args)
    }

    pub fn binop(op: BinOp, l: Expr, r: Expr) -> Self {
        Expr::BinOp(op, Box::new(l), Box::new(r))
    }

    /// Member-access chain for a field path rooted at `base`.
    ///
    /// Identifier-safe names use static selection; everything else goes
    /// through computed access so the rendering stays valid source.
    pub fn path(base: Expr, var: &DocVar) -> Expr {
        var.elements().iter().fold(base, |acc, elem| match elem {
            PathElement::Field(name) if is_valid_ident(name) => acc.select(name.clone()),
            PathElement::Field(name) => {
                Expr::Access(Box::new(acc), Box::new(Expr::Lit(Value::String(name.clone()))))
            }
            PathElement::Index(idx) => {
                Expr::Access(Box::new(acc), Box::new(Expr::Lit(Value::from(*idx))))
            }
        })
    }
}

fn is_valid_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Lit(v) => {
                let text = serde_json::to_string(v).map_err(|_| std::fmt::Error)?;
                write!(f, "{text}")
            }
            Expr::Ident(name) => write!(f, "{name}"),
            Expr::Select(base, name) => write!(f, "{base}.{name}"),
            Expr::Access(base, idx) => write!(f, "{base}[{idx}]"),
            Expr::Call(callee, args) => {
                let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "{callee}({})", rendered.join(", "))
            }
            Expr::Func(func) => write!(f, "({func})"),
            Expr::BinOp(op, l, r) => write!(f, "({l} {op} {r})"),
            Expr::Obj(fields) => {
                let rendered: Vec<String> = fields
                    .iter()
                    .map(|(name, value)| {
                        let key = if is_valid_ident(name) {
                            name.clone()
                        } else {
                            format!("{:?}", name)
                        };
                        format!("{key}: {value}")
                    })
                    .collect();
                write!(f, "{{ {} }}", rendered.join(", "))
            }
            Expr::Arr(items) => {
                let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

/// Statements of the subset.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum Stmt {
    VarDecl(String, Option<Expr>),
    Assign(Expr, Expr),
    ForIn(String, Expr, Vec<Stmt>),
    If(Expr, Vec<Stmt>, Option<Vec<Stmt>>),
    Return(Expr),
    Expr(Expr),
}

fn render_block(stmts: &[Stmt]) -> String {
    stmts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

impl std::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stmt::VarDecl(name, Some(init)) => write!(f, "var {name} = {init};"),
            Stmt::VarDecl(name, None) => write!(f, "var {name};"),
            Stmt::Assign(lhs, rhs) => write!(f, "{lhs} = {rhs};"),
            Stmt::ForIn(name, obj, body) => {
                write!(f, "for (var {name} in {obj}) {{ {} }}", render_block(body))
            }
            Stmt::If(cond, then, None) => {
                write!(f, "if ({cond}) {{ {} }}", render_block(then))
            }
            Stmt::If(cond, then, Some(otherwise)) => write!(
                f,
                "if ({cond}) {{ {} }} else {{ {} }}",
                render_block(then),
                render_block(otherwise)
            ),
            Stmt::Return(expr) => write!(f, "return {expr};"),
            Stmt::Expr(expr) => write!(f, "{expr};"),
        }
    }
}

/// An anonymous function of the subset.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Func {
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

impl Func {
    pub fn new(params: Vec<&str>, body: Vec<Stmt>) -> Self {
        Func {
            params: params.into_iter().map(str::to_string).collect(),
            body,
        }
    }
}

impl std::fmt::Display for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "function ({}) {{ {} }}",
            self.params.join(", "),
            render_block(&self.body)
        )
    }
}

// ============================================================================
// Conversions from the expression layer
// ============================================================================

/// Translate a document expression into a JS expression over `doc`.
///
/// Only the plainly-transformable part of the expression language converts:
/// literals, references, arithmetic, and comparisons. Conditionals, null
/// coalescing, and group operators return `None`, and the caller leaves the
/// stage in pipeline form.
pub fn expr_to_js(expr: &Expression, doc: &Expr) -> Option<Expr> {
    let bin = |op: BinOp, l: &Expression, r: &Expression| -> Option<Expr> {
        Some(Expr::binop(op, expr_to_js(l, doc)?, expr_to_js(r, doc)?))
    };
    match expr {
        Expression::Literal(v) => Some(Expr::Lit(v.clone())),
        Expression::Var(v) => Some(Expr::path(doc.clone(), v)),
        Expression::Add(l, r) => bin(BinOp::Add, l, r),
        Expression::Subtract(l, r) => bin(BinOp::Sub, l, r),
        Expression::Multiply(l, r) => bin(BinOp::Mul, l, r),
        Expression::Divide(l, r) => bin(BinOp::Div, l, r),
        Expression::Mod(l, r) => bin(BinOp::Mod, l, r),
        Expression::Eq(l, r) => bin(BinOp::Eq, l, r),
        Expression::Neq(l, r) => bin(BinOp::Neq, l, r),
        Expression::Lt(l, r) => bin(BinOp::Lt, l, r),
        Expression::Lte(l, r) => bin(BinOp::Lte, l, r),
        Expression::Gt(l, r) => bin(BinOp::Gt, l, r),
        Expression::Gte(l, r) => bin(BinOp::Gte, l, r),
        Expression::Cmp(_, _)
        | Expression::Cond { .. }
        | Expression::IfNull(_, _)
        | Expression::Group(_) => None,
    }
}

/// Translate a reshape into a JS object/array literal over `doc`.
pub fn reshape_to_js(shape: &Reshape, doc: &Expr) -> Option<Expr> {
    match shape {
        Reshape::Doc(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, value) in fields {
                out.push((name.clone(), field_value_to_js(value, doc)?));
            }
            Some(Expr::Obj(out))
        }
        Reshape::Arr(entries) => {
            let mut out = Vec::with_capacity(entries.len());
            for (_, value) in entries {
                out.push(field_value_to_js(value, doc)?);
            }
            Some(Expr::Arr(out))
        }
    }
}

fn field_value_to_js(value: &FieldValue, doc: &Expr) -> Option<Expr> {
    match value {
        FieldValue::Expr(e) => expr_to_js(e, doc),
        FieldValue::Nested(r) => reshape_to_js(r, doc),
    }
}

/// Translate a selector into a JS predicate over `doc`.
///
/// Unlike [`expr_to_js`] this is total: every selector form, including the
/// `where` escape, has a JS reading. This is what makes the map-reduce
/// fallback for unpipelinable matches possible.
pub fn selector_to_js(selector: &Selector, doc: &Expr) -> Expr {
    match selector {
        Selector::Field { field, predicate } => {
            let target = Expr::path(doc.clone(), field);
            predicate_to_js(predicate, &target)
        }
        Selector::And(l, r) => Expr::binop(
            BinOp::And,
            selector_to_js(l, doc),
            selector_to_js(r, doc),
        ),
        Selector::Or(l, r) => Expr::binop(
            BinOp::Or,
            selector_to_js(l, doc),
            selector_to_js(r, doc),
        ),
        Selector::Nor(l, r) => Expr::binop(
            BinOp::And,
            Expr::binop(BinOp::Eq, selector_to_js(l, doc), Expr::Lit(Value::Bool(false))),
            Expr::binop(BinOp::Eq, selector_to_js(r, doc), Expr::Lit(Value::Bool(false))),
        ),
        Selector::Where(func) => Expr::Func(func.clone()).call(vec![doc.clone()]),
    }
}

fn predicate_to_js(predicate: &Predicate, target: &Expr) -> Expr {
    let cmp = |op: BinOp, v: &Value| Expr::binop(op, target.clone(), Expr::Lit(v.clone()));
    match predicate {
        Predicate::Eq(v) => cmp(BinOp::Eq, v),
        Predicate::Neq(v) => cmp(BinOp::Neq, v),
        Predicate::Gt(v) => cmp(BinOp::Gt, v),
        Predicate::Gte(v) => cmp(BinOp::Gte, v),
        Predicate::Lt(v) => cmp(BinOp::Lt, v),
        Predicate::Lte(v) => cmp(BinOp::Lte, v),
        Predicate::In(values) => values
            .iter()
            .map(|v| cmp(BinOp::Eq, v))
            .reduce(|acc, e| Expr::binop(BinOp::Or, acc, e))
            .unwrap_or(Expr::Lit(Value::Bool(false))),
        Predicate::Nin(values) => values
            .iter()
            .map(|v| cmp(BinOp::Neq, v))
            .reduce(|acc, e| Expr::binop(BinOp::And, acc, e))
            .unwrap_or(Expr::Lit(Value::Bool(true))),
        Predicate::Exists(true) => Expr::binop(
            BinOp::Neq,
            target.clone(),
            Expr::ident("undefined"),
        ),
        Predicate::Exists(false) => Expr::binop(
            BinOp::Eq,
            target.clone(),
            Expr::ident("undefined"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_function() {
        let func = Func::new(
            vec!["key", "value"],
            vec![Stmt::Return(Expr::Arr(vec![
                Expr::ident("key"),
                Expr::ident("value"),
            ]))],
        );
        assert_eq!(func.to_string(), "function (key, value) { return [key, value]; }");
    }

    #[test]
    fn test_render_for_in_copy_loop() {
        let body = vec![Stmt::Assign(
            Expr::Access(
                Box::new(Expr::ident("out")),
                Box::new(Expr::ident("attr")),
            ),
            Expr::Access(
                Box::new(Expr::ident("value")),
                Box::new(Expr::ident("attr")),
            ),
        )];
        let stmt = Stmt::ForIn("attr".to_string(), Expr::ident("value"), body);
        assert_eq!(
            stmt.to_string(),
            "for (var attr in value) { out[attr] = value[attr]; }"
        );
    }

    #[test]
    fn test_path_uses_computed_access_for_odd_names() {
        let var = DocVar::field("a").child("odd name").child_index(2);
        let rendered = Expr::path(Expr::ident("value"), &var).to_string();
        assert_eq!(rendered, "value.a[\"odd name\"][2]");
    }

    #[test]
    fn test_expr_to_js_arithmetic() {
        let expr = Expression::Multiply(
            Box::new(Expression::field("price")),
            Box::new(Expression::Literal(json!(2))),
        );
        let js = expr_to_js(&expr, &Expr::ident("value")).expect("convertible");
        assert_eq!(js.to_string(), "(value.price * 2)");
    }

    #[test]
    fn test_expr_to_js_rejects_group_ops() {
        let expr = Expression::Group(crate::expr::GroupOp::Sum(Box::new(Expression::field("a"))));
        assert_eq!(expr_to_js(&expr, &Expr::ident("value")), None);
    }

    #[test]
    fn test_selector_to_js_is_total_for_where() {
        let sel = Selector::Where(Func::new(
            vec!["doc"],
            vec![Stmt::Return(Expr::binop(
                BinOp::Gt,
                Expr::ident("doc").select("x"),
                Expr::Lit(json!(0)),
            ))],
        ));
        let js = selector_to_js(&sel, &Expr::ident("value"));
        assert_eq!(
            js.to_string(),
            "(function (doc) { return (doc.x > 0); })(value)"
        );
    }
}
