//! # Unused-Field Pruning
//!
//! The `finish` pass: a top-down walk that threads the set of fields the
//! parent consumes and deletes projected/grouped definitions nothing
//! downstream reads.
//!
//! The consumed-field set is `Option`-wrapped: `None` means the consumer is
//! unknown (the workflow root, or anything below an opaque JS op whose body
//! cannot be analyzed), and nothing is deleted at that node. Project and
//! group reset the set to their own references, which is what lets pruning
//! resume below them.

use std::collections::BTreeSet;

use tracing::debug;

use crate::expr::{DocVar, Grouped};
use crate::op::WorkflowOp;
use crate::reshape::Reshape;

/// Drop unused projected fields everywhere in the graph.
///
/// Idempotent: `finish(finish(w)) == finish(w)`.
pub fn finish(op: WorkflowOp) -> WorkflowOp {
    prune(op, None)
}

/// A definition is live when some consumed path contains it or is contained
/// by it.
fn is_live(def: &DocVar, refs: &BTreeSet<DocVar>) -> bool {
    refs.iter().any(|r| def.overlaps(r))
}

fn trim_shape(shape: Reshape, refs: &BTreeSet<DocVar>) -> Reshape {
    let Reshape::Doc(fields) = shape else {
        return shape;
    };
    let kept: Vec<_> = fields
        .iter()
        .filter(|(name, _)| is_live(&DocVar::field(name.clone()), refs))
        .cloned()
        .collect();
    if kept.is_empty() {
        // Nothing survives; leave the projection alone rather than emit an
        // empty stage.
        return Reshape::Doc(fields);
    }
    if kept.len() < fields.len() {
        debug!(dropped = fields.len() - kept.len(), "pruned projected fields");
    }
    Reshape::Doc(kept)
}

fn trim_grouped(grouped: Grouped, refs: &BTreeSet<DocVar>) -> Grouped {
    let kept: Vec<_> = grouped
        .fields()
        .iter()
        .filter(|(name, _)| is_live(&DocVar::field(name.clone()), refs))
        .cloned()
        .collect();
    if kept.len() < grouped.len() {
        debug!(dropped = grouped.len() - kept.len(), "pruned grouped fields");
    }
    // An empty grouped map is still a valid group: it carries the key.
    Grouped::new(kept)
}

fn own_refs(op: &WorkflowOp) -> BTreeSet<DocVar> {
    let mut acc = Vec::new();
    op.collect_stage_refs(&mut acc);
    acc.into_iter().collect()
}

fn prune(op: WorkflowOp, parent_refs: Option<&BTreeSet<DocVar>>) -> WorkflowOp {
    // Delete definitions the parent provably does not consume.
    let op = match (op, parent_refs) {
        (WorkflowOp::Project { src, shape }, Some(refs)) => WorkflowOp::Project {
            src,
            shape: trim_shape(shape, refs),
        },
        (WorkflowOp::Group { src, grouped, by }, Some(refs)) => WorkflowOp::Group {
            src,
            grouped: trim_grouped(grouped, refs),
            by,
        },
        (op, _) => op,
    };

    // Work out what this op's source must keep alive.
    let child_refs: Option<BTreeSet<DocVar>> = match &op {
        // Shape resets: upstream only feeds what the stage itself reads.
        WorkflowOp::Project { .. } | WorkflowOp::Group { .. } => Some(own_refs(&op)),
        // Opaque JS bodies: anything might be read upstream.
        WorkflowOp::Map { .. } | WorkflowOp::FlatMap { .. } | WorkflowOp::Reduce { .. } => None,
        // The unwound path alone is not a use.
        WorkflowOp::Unwind { .. } => parent_refs.cloned(),
        // Everything else extends the parent's set with its own references,
        // but an unknown consumer stays unknown.
        _ => parent_refs.map(|refs| {
            let mut extended = refs.clone();
            extended.extend(own_refs(&op));
            extended
        }),
    };
    let child_refs = child_refs.as_ref();

    match op {
        WorkflowOp::Match { src, selector } => WorkflowOp::Match {
            src: Box::new(prune(*src, child_refs)),
            selector,
        },
        WorkflowOp::Sort { src, keys } => WorkflowOp::Sort {
            src: Box::new(prune(*src, child_refs)),
            keys,
        },
        WorkflowOp::Limit { src, count } => WorkflowOp::Limit {
            src: Box::new(prune(*src, child_refs)),
            count,
        },
        WorkflowOp::Skip { src, count } => WorkflowOp::Skip {
            src: Box::new(prune(*src, child_refs)),
            count,
        },
        WorkflowOp::Project { src, shape } => WorkflowOp::Project {
            src: Box::new(prune(*src, child_refs)),
            shape,
        },
        WorkflowOp::Redact { src, expr } => WorkflowOp::Redact {
            src: Box::new(prune(*src, child_refs)),
            expr,
        },
        WorkflowOp::Unwind { src, field } => WorkflowOp::Unwind {
            src: Box::new(prune(*src, child_refs)),
            field,
        },
        WorkflowOp::Group { src, grouped, by } => WorkflowOp::Group {
            src: Box::new(prune(*src, child_refs)),
            grouped,
            by,
        },
        WorkflowOp::GeoNear { src, geo } => WorkflowOp::GeoNear {
            src: Box::new(prune(*src, child_refs)),
            geo,
        },
        WorkflowOp::Map { src, func } => WorkflowOp::Map {
            src: Box::new(prune(*src, child_refs)),
            func,
        },
        WorkflowOp::FlatMap { src, func } => WorkflowOp::FlatMap {
            src: Box::new(prune(*src, child_refs)),
            func,
        },
        WorkflowOp::Reduce { src, func } => WorkflowOp::Reduce {
            src: Box::new(prune(*src, child_refs)),
            func,
        },
        WorkflowOp::FoldLeft { head, tails } => WorkflowOp::FoldLeft {
            head: Box::new(prune(*head, parent_refs)),
            tails: tails
                .into_iter()
                .map(|tail| prune(tail, parent_refs))
                .collect(),
        },
        // Join semantics belong to the runtime, so its branches keep
        // everything.
        WorkflowOp::Join { srcs } => WorkflowOp::Join {
            srcs: srcs.into_iter().map(|src| prune(src, None)).collect(),
        },
        source @ (WorkflowOp::Pure(_) | WorkflowOp::Read(_)) => source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Expression, GroupOp};
    use crate::reshape::FieldValue;
    use serde_json::json;

    fn read_c() -> WorkflowOp {
        WorkflowOp::read("c")
    }

    #[test]
    fn test_project_prunes_unreferenced_group_outputs() {
        // group defines s and m; the projection above only reads s.
        let group = WorkflowOp::Group {
            src: Box::new(read_c()),
            grouped: Grouped::new(vec![
                (
                    "s".to_string(),
                    GroupOp::Sum(Box::new(Expression::field("a"))),
                ),
                (
                    "m".to_string(),
                    GroupOp::Avg(Box::new(Expression::field("b"))),
                ),
            ]),
            by: FieldValue::Expr(Expression::field("k")),
        };
        let plan = WorkflowOp::Project {
            src: Box::new(group),
            shape: Reshape::doc1(
                "out",
                FieldValue::Nested(Reshape::doc1(
                    "s",
                    FieldValue::Expr(Expression::field("s")),
                )),
            ),
        };

        let finished = finish(plan);
        let WorkflowOp::Project { src, .. } = &finished else {
            panic!("project survives");
        };
        let WorkflowOp::Group { grouped, .. } = &**src else {
            panic!("group survives");
        };
        let names: Vec<_> = grouped.names().collect();
        assert_eq!(names, vec!["s"]);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let plan = WorkflowOp::Project {
            src: Box::new(WorkflowOp::Project {
                src: Box::new(read_c()),
                shape: Reshape::doc(vec![
                    ("a".to_string(), FieldValue::Expr(Expression::field("x"))),
                    ("b".to_string(), FieldValue::Expr(Expression::field("y"))),
                ]),
            }),
            shape: Reshape::doc1("a", FieldValue::Expr(Expression::field("a"))),
        };
        let once = finish(plan.clone());
        let twice = finish(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_opaque_udf_stops_pruning_upstream() {
        // The map body cannot be analyzed, so the projection below it keeps
        // both fields.
        let project = WorkflowOp::Project {
            src: Box::new(read_c()),
            shape: Reshape::doc(vec![
                ("a".to_string(), FieldValue::Expr(Expression::field("x"))),
                ("b".to_string(), FieldValue::Expr(Expression::field("y"))),
            ]),
        };
        let map = WorkflowOp::Map {
            src: Box::new(project.clone()),
            func: crate::js::Func::new(
                vec!["key", "value"],
                vec![crate::js::Stmt::Return(crate::js::Expr::Arr(vec![
                    crate::js::Expr::ident("key"),
                    crate::js::Expr::ident("value"),
                ]))],
            ),
        };
        let plan = WorkflowOp::Match {
            src: Box::new(map),
            selector: crate::selector::Selector::eq("a", json!(1)),
        };

        let finished = finish(plan.clone());
        assert_eq!(finished, plan);
    }

    #[test]
    fn test_referenced_fields_survive_by_prefix() {
        // refs contain out.s, so the definition of out must stay.
        let project = WorkflowOp::Project {
            src: Box::new(read_c()),
            shape: Reshape::doc(vec![
                (
                    "out".to_string(),
                    FieldValue::Nested(Reshape::doc1(
                        "s",
                        FieldValue::Expr(Expression::field("x")),
                    )),
                ),
                ("gone".to_string(), FieldValue::Expr(Expression::field("y"))),
            ]),
        };
        let plan = WorkflowOp::Project {
            src: Box::new(project),
            shape: Reshape::doc1(
                "keep",
                FieldValue::Expr(Expression::Var(
                    DocVar::field("out").child("s"),
                )),
            ),
        };

        let finished = finish(plan);
        let WorkflowOp::Project { src, .. } = &finished else {
            panic!("outer project survives");
        };
        let WorkflowOp::Project { shape, .. } = &**src else {
            panic!("inner project survives");
        };
        assert_eq!(shape.field_names(), vec!["out"]);
    }
}
