//! # Finalize
//!
//! Post-construction rewrites that cross the pipeline/JS boundary, run once
//! on the completed graph before crushing:
//!
//! - A JS op over a project whose reshape is expressible as a plain JS
//!   transform swallows the projection as a composed map.
//! - A JS op over an unwind replaces the unwind with its flat-map
//!   equivalent.
//! - Fold-left heads get the `{value: ROOT}` carrier projection; tails that
//!   do not end in a reduce get the default merge-reduce appended.

use tracing::debug;

use crate::error::PlanResult;
use crate::expr::{DocVar, Expression};
use crate::js;
use crate::op::WorkflowOp;
use crate::reshape::{FieldValue, Reshape};

/// Reserved field carrying map-reduce output values.
pub const VALUE_LABEL: &str = "value";

/// Run the boundary rewrites over the whole graph, bottom-up.
pub fn finalize(op: WorkflowOp) -> PlanResult<WorkflowOp> {
    Ok(match op {
        WorkflowOp::Map { src, func } => finalize_udf(UdfKind::Map, finalize(*src)?, func),
        WorkflowOp::FlatMap { src, func } => {
            finalize_udf(UdfKind::FlatMap, finalize(*src)?, func)
        }
        WorkflowOp::Reduce { src, func } => {
            finalize_udf(UdfKind::Reduce, finalize(*src)?, func)
        }
        WorkflowOp::FoldLeft { head, tails } => {
            let head = carrier_wrap(finalize(*head)?);
            let tails = tails
                .into_iter()
                .map(|tail| Ok(ensure_reduce(finalize(tail)?)))
                .collect::<PlanResult<Vec<_>>>()?;
            WorkflowOp::FoldLeft {
                head: Box::new(head),
                tails,
            }
        }
        WorkflowOp::Join { srcs } => WorkflowOp::Join {
            srcs: srcs
                .into_iter()
                .map(finalize)
                .collect::<PlanResult<Vec<_>>>()?,
        },
        WorkflowOp::Match { src, selector } => WorkflowOp::Match {
            src: Box::new(finalize(*src)?),
            selector,
        },
        WorkflowOp::Sort { src, keys } => WorkflowOp::Sort {
            src: Box::new(finalize(*src)?),
            keys,
        },
        WorkflowOp::Limit { src, count } => WorkflowOp::Limit {
            src: Box::new(finalize(*src)?),
            count,
        },
        WorkflowOp::Skip { src, count } => WorkflowOp::Skip {
            src: Box::new(finalize(*src)?),
            count,
        },
        WorkflowOp::Project { src, shape } => WorkflowOp::Project {
            src: Box::new(finalize(*src)?),
            shape,
        },
        WorkflowOp::Redact { src, expr } => WorkflowOp::Redact {
            src: Box::new(finalize(*src)?),
            expr,
        },
        WorkflowOp::Unwind { src, field } => WorkflowOp::Unwind {
            src: Box::new(finalize(*src)?),
            field,
        },
        WorkflowOp::Group { src, grouped, by } => WorkflowOp::Group {
            src: Box::new(finalize(*src)?),
            grouped,
            by,
        },
        WorkflowOp::GeoNear { src, geo } => WorkflowOp::GeoNear {
            src: Box::new(finalize(*src)?),
            geo,
        },
        source @ (WorkflowOp::Pure(_) | WorkflowOp::Read(_)) => source,
    })
}

enum UdfKind {
    Map,
    FlatMap,
    Reduce,
}

fn rebuild_udf(kind: UdfKind, src: WorkflowOp, func: js::Func) -> WorkflowOp {
    match kind {
        UdfKind::Map => WorkflowOp::map(src, func),
        UdfKind::FlatMap => WorkflowOp::flat_map(src, func),
        UdfKind::Reduce => WorkflowOp::reduce(src, func),
    }
}

/// Rewrite what sits under a JS op so the whole prefix runs in JS.
fn finalize_udf(kind: UdfKind, src: WorkflowOp, func: js::Func) -> WorkflowOp {
    match src {
        WorkflowOp::Project { src: inner, shape } => {
            match js::reshape_to_js(&shape, &js::Expr::ident("value")) {
                Some(transform) => {
                    debug!("fused projection into JS transform below a JS op");
                    let mapper = js::Func::new(
                        vec!["key", "value"],
                        vec![js::Stmt::Return(js::Expr::Arr(vec![
                            js::Expr::ident("key"),
                            transform,
                        ]))],
                    );
                    rebuild_udf(kind, WorkflowOp::map(*inner, mapper), func)
                }
                None => rebuild_udf(
                    kind,
                    WorkflowOp::Project { src: inner, shape },
                    func,
                ),
            }
        }
        WorkflowOp::Unwind { src: inner, field } => {
            debug!("replaced unwind below a JS op with its flat-map equivalent");
            rebuild_udf(
                kind,
                WorkflowOp::flat_map(*inner, unwind_flat_map(&field)),
                func,
            )
        }
        other => rebuild_udf(kind, other, func),
    }
}

/// The JS flat-map equivalent of unwinding `field`: one shallow copy of the
/// document per array element, with the element written back at the path.
fn unwind_flat_map(field: &DocVar) -> js::Func {
    let target = js::Expr::path(js::Expr::ident("value"), field);
    let copy_target = js::Expr::path(js::Expr::ident("dup"), field);
    let per_element = js::Func::new(
        vec!["elem"],
        vec![
            js::Stmt::VarDecl("dup".to_string(), Some(js::Expr::Obj(Vec::new()))),
            js::Stmt::ForIn(
                "attr".to_string(),
                js::Expr::ident("value"),
                vec![js::Stmt::Assign(
                    js::Expr::Access(
                        Box::new(js::Expr::ident("dup")),
                        Box::new(js::Expr::ident("attr")),
                    ),
                    js::Expr::Access(
                        Box::new(js::Expr::ident("value")),
                        Box::new(js::Expr::ident("attr")),
                    ),
                )],
            ),
            js::Stmt::Assign(copy_target, js::Expr::ident("elem")),
            js::Stmt::Expr(
                js::Expr::ident("rez")
                    .select("push")
                    .call(vec![js::Expr::Arr(vec![
                        js::Expr::ident("key"),
                        js::Expr::ident("dup"),
                    ])]),
            ),
        ],
    );
    js::Func::new(
        vec!["key", "value"],
        vec![
            js::Stmt::VarDecl("rez".to_string(), Some(js::Expr::Arr(Vec::new()))),
            js::Stmt::Expr(target.select("map").call(vec![js::Expr::Func(per_element)])),
            js::Stmt::Return(js::Expr::ident("rez")),
        ],
    )
}

/// The carrier projection every fold-left head needs: `{value: ROOT}`.
fn carrier_shape() -> Reshape {
    Reshape::doc1(VALUE_LABEL, FieldValue::Expr(Expression::root()))
}

fn carrier_wrap(head: WorkflowOp) -> WorkflowOp {
    if let WorkflowOp::Project { shape, .. } = &head {
        if *shape == carrier_shape() {
            return head;
        }
    }
    WorkflowOp::project(head, carrier_shape())
}

/// Every fold-left tail must end in a reduce so its crushed form can target
/// the accumulator; tails that do not get the default merge-reduce.
fn ensure_reduce(tail: WorkflowOp) -> WorkflowOp {
    match tail {
        reduce @ WorkflowOp::Reduce { .. } => reduce,
        other => WorkflowOp::reduce(other, merge_reduce()),
    }
}

/// The default merge-reduce: fold every value's attributes into one
/// document, later writers winning.
fn merge_reduce() -> js::Func {
    let fold_one = js::Func::new(
        vec!["value"],
        vec![js::Stmt::ForIn(
            "attr".to_string(),
            js::Expr::ident("value"),
            vec![js::Stmt::Assign(
                js::Expr::Access(
                    Box::new(js::Expr::ident("rez")),
                    Box::new(js::Expr::ident("attr")),
                ),
                js::Expr::Access(
                    Box::new(js::Expr::ident("value")),
                    Box::new(js::Expr::ident("attr")),
                ),
            )],
        )],
    );
    js::Func::new(
        vec!["key", "values"],
        vec![
            js::Stmt::VarDecl(
                "rez".to_string(),
                Some(js::Expr::Obj(Vec::new())),
            ),
            js::Stmt::Expr(
                js::Expr::ident("values")
                    .select("map")
                    .call(vec![js::Expr::Func(fold_one)]),
            ),
            js::Stmt::Return(js::Expr::ident("rez")),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity_map() -> js::Func {
        js::Func::new(
            vec!["key", "value"],
            vec![js::Stmt::Return(js::Expr::Arr(vec![
                js::Expr::ident("key"),
                js::Expr::ident("value"),
            ]))],
        )
    }

    #[test]
    fn test_udf_over_project_fuses_when_expressible() {
        let project = WorkflowOp::project(
            WorkflowOp::read("c"),
            Reshape::doc1("a", FieldValue::Expr(Expression::field("x"))),
        );
        let plan = WorkflowOp::map(project, identity_map());

        let finalized = finalize(plan).expect("finalize");
        // The projection became a JS transform composed into a single map.
        let WorkflowOp::Map { src, .. } = &finalized else {
            panic!("expected a map, got {finalized:?}");
        };
        assert_eq!(**src, WorkflowOp::read("c"));
    }

    #[test]
    fn test_udf_over_project_keeps_unexpressible_reshape() {
        let shape = Reshape::doc1(
            "a",
            FieldValue::Expr(Expression::Cond {
                pred: Box::new(Expression::field("p")),
                then: Box::new(Expression::Literal(json!(1))),
                otherwise: Box::new(Expression::Literal(json!(2))),
            }),
        );
        let plan = WorkflowOp::map(
            WorkflowOp::project(WorkflowOp::read("c"), shape.clone()),
            identity_map(),
        );

        let finalized = finalize(plan).expect("finalize");
        let WorkflowOp::Map { src, .. } = &finalized else {
            panic!("expected a map");
        };
        assert!(matches!(&**src, WorkflowOp::Project { .. }));
    }

    #[test]
    fn test_udf_over_unwind_becomes_flat_map() {
        let plan = WorkflowOp::map(
            WorkflowOp::unwind(WorkflowOp::read("c"), DocVar::field("items")),
            identity_map(),
        );
        let finalized = finalize(plan).expect("finalize");
        // map over flat_map composes into one flat_map at construction time
        let WorkflowOp::FlatMap { src, .. } = &finalized else {
            panic!("expected a flat map, got {finalized:?}");
        };
        assert_eq!(**src, WorkflowOp::read("c"));
    }

    #[test]
    fn test_fold_left_head_gets_carrier_projection() {
        let plan = WorkflowOp::fold_left(
            WorkflowOp::read("a"),
            vec![WorkflowOp::reduce(
                WorkflowOp::read("b"),
                merge_reduce(),
            )],
        );
        let finalized = finalize(plan).expect("finalize");
        let WorkflowOp::FoldLeft { head, tails } = &finalized else {
            panic!("expected fold-left");
        };
        assert_eq!(
            **head,
            WorkflowOp::Project {
                src: Box::new(WorkflowOp::read("a")),
                shape: carrier_shape(),
            }
        );
        assert!(matches!(tails[0], WorkflowOp::Reduce { .. }));
    }

    #[test]
    fn test_fold_left_tail_without_reduce_gets_default() {
        let plan = WorkflowOp::fold_left(WorkflowOp::read("a"), vec![WorkflowOp::read("b")]);
        let finalized = finalize(plan).expect("finalize");
        let WorkflowOp::FoldLeft { tails, .. } = &finalized else {
            panic!("expected fold-left");
        };
        let WorkflowOp::Reduce { func, .. } = &tails[0] else {
            panic!("expected appended reduce");
        };
        assert!(func.to_string().contains("for (var attr in value)"));
    }

    #[test]
    fn test_finalize_wraps_head_once() {
        let plan = WorkflowOp::fold_left(WorkflowOp::read("a"), vec![WorkflowOp::read("b")]);
        let once = finalize(plan).expect("first finalize");
        let twice = finalize(once.clone()).expect("second finalize");
        assert_eq!(once, twice);
    }
}
