//! # Crush
//!
//! Lowering from the op graph to the executable task tree. Each node crushes
//! to `(base, task)`: the task that computes it, plus the document-relative
//! base where its logical output lives (ROOT for sources and shape-resetting
//! stages, the reserved `value` carrier after any map-reduce).
//!
//! Pipeline ops extend an existing pipeline task when their source already
//! has one, with the stage's references rebased through the source's base.
//! A match whose selector escapes to JS, and every JS op, lower to
//! map-reduce instead; a small match/sort/limit pipeline prefix is absorbed
//! into the map-reduce job's own selection/sort/limit fields.

use serde_json::Value;
use tracing::debug;

use crate::error::{PlanError, PlanResult};
use crate::expr::DocVar;
use crate::finalize::VALUE_LABEL;
use crate::js;
use crate::op::WorkflowOp;
use crate::selector::Selector;
use crate::stage::{PipelineStage, SortDir};
use crate::task::{MapReduce, OutAction, WorkflowTask};

fn value_var() -> DocVar {
    DocVar::field(VALUE_LABEL)
}

/// Lower an op graph to a task tree, returning the output base alongside.
pub fn crush(op: WorkflowOp) -> PlanResult<(DocVar, WorkflowTask)> {
    match op {
        WorkflowOp::Pure(value) => Ok((DocVar::root(), WorkflowTask::Pure(value))),
        WorkflowOp::Read(coll) => Ok((DocVar::root(), WorkflowTask::Read(coll))),

        // A JS predicate cannot run as a native stage; fall back to a
        // map-reduce whose mapper applies the selector and whose reducer is
        // the identity.
        WorkflowOp::Match { src, selector } if !selector.is_pipelinable() => {
            debug!("selector escapes to JS; lowering match to map-reduce");
            let (base, source) = crush(*src)?;
            let absolute = selector.rewrite_refs(&|v| Some(base.concat(v)));
            let spec = MapReduce::new(
                mr_filter_map_fn(&absolute, &base),
                MapReduce::identity_reduce(),
            );
            Ok((
                value_var(),
                WorkflowTask::MapReduce {
                    source: Box::new(source),
                    spec,
                },
            ))
        }

        WorkflowOp::Match { src, selector } => {
            extend_pipeline(*src, PipelineStage::Match(selector), false)
        }
        WorkflowOp::Sort { src, keys } => {
            extend_pipeline(*src, PipelineStage::Sort(keys), false)
        }
        WorkflowOp::Limit { src, count } => {
            extend_pipeline(*src, PipelineStage::Limit(count), false)
        }
        WorkflowOp::Skip { src, count } => {
            extend_pipeline(*src, PipelineStage::Skip(count), false)
        }
        WorkflowOp::Redact { src, expr } => {
            extend_pipeline(*src, PipelineStage::Redact(expr), false)
        }
        WorkflowOp::Unwind { src, field } => {
            extend_pipeline(*src, PipelineStage::Unwind(field), false)
        }
        WorkflowOp::GeoNear { src, geo } => {
            extend_pipeline(*src, PipelineStage::GeoNear(geo), false)
        }
        // Project and group reset the base: their output is the new document
        // shape.
        WorkflowOp::Project { src, shape } => {
            extend_pipeline(*src, PipelineStage::Project(shape), true)
        }
        WorkflowOp::Group { src, grouped, by } => {
            extend_pipeline(*src, PipelineStage::Group { grouped, by }, true)
        }

        WorkflowOp::Map { src, func } => crush_udf(Udf::Map, *src, func),
        WorkflowOp::FlatMap { src, func } => crush_udf(Udf::FlatMap, *src, func),
        WorkflowOp::Reduce { src, func } => crush_udf(Udf::Reduce, *src, func),

        WorkflowOp::FoldLeft { head, tails } => {
            let (_, head_task) = crush(*head)?;
            let mut tail_tasks = Vec::with_capacity(tails.len());
            for tail in tails {
                let (_, task) = crush(tail)?;
                match task {
                    WorkflowTask::MapReduce { source, mut spec } => {
                        spec.out = Some(OutAction::Reduce);
                        tail_tasks.push(WorkflowTask::MapReduce { source, spec });
                    }
                    other => {
                        return Err(PlanError::InvalidFoldLeftTail {
                            task: other.kind().to_string(),
                        })
                    }
                }
            }
            Ok((
                value_var(),
                WorkflowTask::FoldLeft {
                    head: Box::new(head_task),
                    tails: tail_tasks,
                },
            ))
        }

        WorkflowOp::Join { srcs } => {
            let tasks = srcs
                .into_iter()
                .map(|src| crush(src).map(|(_, task)| task))
                .collect::<PlanResult<Vec<_>>>()?;
            Ok((DocVar::root(), WorkflowTask::Join { srcs: tasks }))
        }
    }
}

/// Extend the source's pipeline with one more stage, or open a new pipeline
/// over whatever task the source crushed to.
fn extend_pipeline(
    src: WorkflowOp,
    stage: PipelineStage,
    resets_base: bool,
) -> PlanResult<(DocVar, WorkflowTask)> {
    let (base, task) = crush(src)?;
    let stage = if base.is_root() {
        stage
    } else {
        stage.rewrite_refs(&|v| Some(base.concat(v)))
    };
    let new_base = if resets_base { DocVar::root() } else { base };
    let task = match task {
        WorkflowTask::Pipeline { source, mut stages } => {
            stages.push(stage);
            WorkflowTask::Pipeline { source, stages }
        }
        other => WorkflowTask::Pipeline {
            source: Box::new(other),
            stages: vec![stage],
        },
    };
    Ok((new_base, task))
}

enum Udf {
    Map,
    FlatMap,
    Reduce,
}

fn crush_udf(kind: Udf, src: WorkflowOp, func: js::Func) -> PlanResult<(DocVar, WorkflowTask)> {
    let (base, task) = crush(src)?;
    match (kind, task) {
        // A map over a finished map-reduce becomes its finalizer.
        (Udf::Map, WorkflowTask::MapReduce { source, spec })
            if spec.finalizer.is_none() && base == value_var() =>
        {
            let spec = MapReduce {
                finalizer: Some(finalizer_fn(&func)),
                ..spec
            };
            Ok((value_var(), WorkflowTask::MapReduce { source, spec }))
        }
        // A reduce over a map-reduce replaces its reduce function.
        (Udf::Reduce, WorkflowTask::MapReduce { source, spec })
            if spec.finalizer.is_none() && base == value_var() =>
        {
            let spec = MapReduce {
                reduce: func,
                ..spec
            };
            Ok((value_var(), WorkflowTask::MapReduce { source, spec }))
        }
        // A small match/sort/limit prefix folds into the map-reduce job's
        // own fields.
        (kind, WorkflowTask::Pipeline { source, stages }) => match absorbable(&stages) {
            Some((selection, input_sort, limit)) => {
                debug!("absorbed pipeline prefix into map-reduce fields");
                let mut spec = fresh_spec(&kind, &func, &base);
                spec.selection = selection;
                spec.input_sort = input_sort;
                spec.limit = limit;
                Ok((
                    value_var(),
                    WorkflowTask::MapReduce { source, spec },
                ))
            }
            None => Ok((
                value_var(),
                WorkflowTask::MapReduce {
                    source: Box::new(WorkflowTask::Pipeline { source, stages }),
                    spec: fresh_spec(&kind, &func, &base),
                },
            )),
        },
        (kind, other) => Ok((
            value_var(),
            WorkflowTask::MapReduce {
                source: Box::new(other),
                spec: fresh_spec(&kind, &func, &base),
            },
        )),
    }
}

fn fresh_spec(kind: &Udf, func: &js::Func, base: &DocVar) -> MapReduce {
    match kind {
        Udf::Map => MapReduce::new(mr_map_fn(func, base), MapReduce::identity_reduce()),
        Udf::FlatMap => MapReduce::new(mr_flat_map_fn(func, base), MapReduce::identity_reduce()),
        Udf::Reduce => MapReduce::new(mr_identity_map_fn(base), func.clone()),
    }
}

/// A pipeline prefix is absorbable when it is some combination of one
/// pipelinable match, one sort, and one limit.
fn absorbable(
    stages: &[PipelineStage],
) -> Option<(
    Option<Selector>,
    Option<Vec<(DocVar, SortDir)>>,
    Option<u64>,
)> {
    let mut selection = None;
    let mut input_sort = None;
    let mut limit = None;
    for stage in stages {
        match stage {
            PipelineStage::Match(sel) if sel.is_pipelinable() && selection.is_none() => {
                selection = Some(sel.clone());
            }
            PipelineStage::Sort(keys) if input_sort.is_none() => {
                input_sort = Some(keys.clone());
            }
            PipelineStage::Limit(n) if limit.is_none() => {
                limit = Some(*n);
            }
            _ => return None,
        }
    }
    Some((selection, input_sort, limit))
}

// ============================================================================
// JS wrappers around op-level functions
// ============================================================================

fn this_doc(base: &DocVar) -> js::Expr {
    js::Expr::path(js::Expr::ident("this"), base)
}

fn this_id() -> js::Expr {
    js::Expr::ident("this").select("_id")
}

/// `function () { emit.apply(null, f(this._id, this<.base>)); }`
fn mr_map_fn(func: &js::Func, base: &DocVar) -> js::Func {
    js::Func::new(
        vec![],
        vec![js::Stmt::Expr(
            js::Expr::ident("emit").select("apply").call(vec![
                js::Expr::Lit(Value::Null),
                js::Expr::Func(func.clone()).call(vec![this_id(), this_doc(base)]),
            ]),
        )],
    )
}

/// `function () { f(this._id, this<.base>).map(function (pair) { emit(pair[0], pair[1]); }); }`
fn mr_flat_map_fn(func: &js::Func, base: &DocVar) -> js::Func {
    let pair = js::Expr::ident("pair");
    let emit_pair = js::Func::new(
        vec!["pair"],
        vec![js::Stmt::Expr(js::Expr::ident("emit").call(vec![
            js::Expr::Access(Box::new(pair.clone()), Box::new(js::Expr::Lit(Value::from(0)))),
            js::Expr::Access(Box::new(pair), Box::new(js::Expr::Lit(Value::from(1)))),
        ]))],
    );
    js::Func::new(
        vec![],
        vec![js::Stmt::Expr(
            js::Expr::Func(func.clone())
                .call(vec![this_id(), this_doc(base)])
                .select("map")
                .call(vec![js::Expr::Func(emit_pair)]),
        )],
    )
}

/// `function () { emit(this._id, this<.base>); }`
fn mr_identity_map_fn(base: &DocVar) -> js::Func {
    js::Func::new(
        vec![],
        vec![js::Stmt::Expr(
            js::Expr::ident("emit").call(vec![this_id(), this_doc(base)]),
        )],
    )
}

/// `function () { if (<selector>) { emit(this._id, this<.base>); } }`
fn mr_filter_map_fn(selector: &Selector, base: &DocVar) -> js::Func {
    let predicate = js::selector_to_js(selector, &js::Expr::ident("this"));
    js::Func::new(
        vec![],
        vec![js::Stmt::If(
            predicate,
            vec![js::Stmt::Expr(
                js::Expr::ident("emit").call(vec![this_id(), this_doc(base)]),
            )],
            None,
        )],
    )
}

/// `function (key, value) { return f(key, value)[1]; }`
fn finalizer_fn(func: &js::Func) -> js::Func {
    js::Func::new(
        vec!["key", "value"],
        vec![js::Stmt::Return(js::Expr::Access(
            Box::new(
                js::Expr::Func(func.clone())
                    .call(vec![js::Expr::ident("key"), js::Expr::ident("value")]),
            ),
            Box::new(js::Expr::Lit(Value::from(1))),
        ))],
    )
}
