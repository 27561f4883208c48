//! # Workflow Ops
//!
//! The DAG node types of the workflow IR and their smart constructors.
//!
//! Ops are immutable value objects. Construction goes through the `make`
//! entry points below (`match_`, `limit`, `project`, ...), never through the
//! data constructors directly: each entry point runs a local peephole
//! coalescing pass over the node it builds. Coalescing inspects only the
//! immediate source, and composes because every constructor runs on
//! already-coalesced children. It never changes plan semantics.
//!
//! Category hierarchy, as predicates over the sealed sum:
//!
//! ```text
//! SourceOp            Pure, Read
//! SingleSourceOp      everything with exactly one src (supports reparent)
//!   WPipelineOp       representable as a native pipeline stage
//!     ShapePreserving match, sort, limit, skip
//!   UDF               map, flat_map, reduce (opaque JS)
//! Multi-source        fold_left, join
//! ```

use serde_json::Value;

use crate::error::{PlanError, PlanResult};
use crate::expr::{DocVar, Expression, Grouped, PathElement};
use crate::js;
use crate::reshape::{FieldValue, Reshape};
use crate::selector::Selector;
use crate::stage::{GeoNear, PipelineStage, SortDir};

/// Handle to a named collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct Collection(pub String);

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Collection(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A workflow operation: one node of the op DAG.
///
/// Note: `WorkflowOp` does not implement `Eq` or `Hash` because literal
/// values carry floats.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum WorkflowOp {
    /// Literal source value
    Pure(Value),
    /// Collection read
    Read(Collection),

    // Shape-preserving pipeline ops
    Match {
        src: Box<WorkflowOp>,
        selector: Selector,
    },
    Sort {
        src: Box<WorkflowOp>,
        /// Non-empty list of sort keys
        keys: Vec<(DocVar, SortDir)>,
    },
    Limit {
        src: Box<WorkflowOp>,
        count: u64,
    },
    Skip {
        src: Box<WorkflowOp>,
        count: u64,
    },

    // Shape-changing pipeline ops
    Project {
        src: Box<WorkflowOp>,
        shape: Reshape,
    },
    Redact {
        src: Box<WorkflowOp>,
        expr: Expression,
    },
    Unwind {
        src: Box<WorkflowOp>,
        field: DocVar,
    },
    Group {
        src: Box<WorkflowOp>,
        grouped: Grouped,
        by: FieldValue,
    },
    GeoNear {
        src: Box<WorkflowOp>,
        geo: GeoNear,
    },

    // Opaque JS ops
    /// `(key, value) -> [key, value]`
    Map {
        src: Box<WorkflowOp>,
        func: js::Func,
    },
    /// `(key, value) -> [[key, value], ...]`
    FlatMap {
        src: Box<WorkflowOp>,
        func: js::Func,
    },
    /// `(key, values) -> value`
    Reduce {
        src: Box<WorkflowOp>,
        func: js::Func,
    },

    // Multi-source ops
    FoldLeft {
        head: Box<WorkflowOp>,
        /// Non-empty list of tails
        tails: Vec<WorkflowOp>,
    },
    /// Unordered set of sources; join semantics belong to the runtime
    Join {
        srcs: Vec<WorkflowOp>,
    },
}

impl WorkflowOp {
    // ========================================================================
    // Smart constructors
    // ========================================================================

    pub fn pure(value: Value) -> WorkflowOp {
        WorkflowOp::Pure(value)
    }

    pub fn read(collection: impl Into<String>) -> WorkflowOp {
        WorkflowOp::Read(Collection::new(collection))
    }

    /// Match floats above sorts and fuses with an adjacent match by ANDing
    /// the selectors.
    pub fn match_(src: WorkflowOp, selector: Selector) -> WorkflowOp {
        match src {
            WorkflowOp::Sort { src: inner, keys } => {
                WorkflowOp::sort(WorkflowOp::match_(*inner, selector), keys)
            }
            WorkflowOp::Match {
                src: inner,
                selector: first,
            } => WorkflowOp::match_(*inner, Selector::and(first, selector)),
            other => WorkflowOp::Match {
                src: Box::new(other),
                selector,
            },
        }
    }

    /// `keys` must be non-empty.
    pub fn sort(src: WorkflowOp, keys: Vec<(DocVar, SortDir)>) -> WorkflowOp {
        debug_assert!(!keys.is_empty(), "sort requires at least one key");
        WorkflowOp::Sort {
            src: Box::new(src),
            keys,
        }
    }

    /// Adjacent limits keep the minimum; a limit over a skip becomes a skip
    /// over a widened limit.
    pub fn limit(src: WorkflowOp, count: u64) -> WorkflowOp {
        match src {
            WorkflowOp::Limit {
                src: inner,
                count: existing,
            } => WorkflowOp::limit(*inner, count.min(existing)),
            WorkflowOp::Skip {
                src: inner,
                count: skipped,
            } => WorkflowOp::skip(
                WorkflowOp::limit(*inner, count.saturating_add(skipped)),
                skipped,
            ),
            other => WorkflowOp::Limit {
                src: Box::new(other),
                count,
            },
        }
    }

    /// Adjacent skips add.
    pub fn skip(src: WorkflowOp, count: u64) -> WorkflowOp {
        match src {
            WorkflowOp::Skip {
                src: inner,
                count: existing,
            } => WorkflowOp::skip(*inner, count.saturating_add(existing)),
            other => WorkflowOp::Skip {
                src: Box::new(other),
                count,
            },
        }
    }

    /// Project inlines through an adjacent project when every outer
    /// reference resolves to an inner definition, fuses with a group when
    /// every projected field passes through a group output, and performs the
    /// three-way project/unwind/group fusion (rewriting the unwound path).
    pub fn project(src: WorkflowOp, shape: Reshape) -> WorkflowOp {
        match src {
            WorkflowOp::Project {
                src: inner,
                shape: inner_shape,
            } => match shape.inline_in(&inner_shape) {
                Some(fused) => WorkflowOp::project(*inner, fused),
                None => WorkflowOp::Project {
                    src: Box::new(WorkflowOp::Project {
                        src: inner,
                        shape: inner_shape,
                    }),
                    shape,
                },
            },
            WorkflowOp::Group { src: inner, grouped, by } => {
                match project_group_fusion(&shape, &grouped) {
                    Some(fused) => WorkflowOp::group(*inner, fused, by),
                    None => WorkflowOp::Project {
                        src: Box::new(WorkflowOp::Group {
                            src: inner,
                            grouped,
                            by,
                        }),
                        shape,
                    },
                }
            }
            WorkflowOp::Unwind { src: inner, field }
                if matches!(*inner, WorkflowOp::Group { .. }) =>
            {
                let WorkflowOp::Group {
                    src: gsrc,
                    grouped,
                    by,
                } = *inner
                else {
                    unreachable!("guarded by matches! above");
                };
                match project_unwind_group_fusion(&shape, &grouped, &field) {
                    Some((fused, new_field)) => WorkflowOp::unwind(
                        WorkflowOp::group(*gsrc, fused, by),
                        new_field,
                    ),
                    None => WorkflowOp::Project {
                        src: Box::new(WorkflowOp::Unwind {
                            src: Box::new(WorkflowOp::Group {
                                src: gsrc,
                                grouped,
                                by,
                            }),
                            field,
                        }),
                        shape,
                    },
                }
            }
            other => WorkflowOp::Project {
                src: Box::new(other),
                shape,
            },
        }
    }

    pub fn redact(src: WorkflowOp, expr: Expression) -> WorkflowOp {
        WorkflowOp::Redact {
            src: Box::new(src),
            expr,
        }
    }

    pub fn unwind(src: WorkflowOp, field: DocVar) -> WorkflowOp {
        WorkflowOp::Unwind {
            src: Box::new(src),
            field,
        }
    }

    /// Group folds an adjacent project's definitions back into its
    /// expressions when every reference resolves (group-project inlining).
    pub fn group(src: WorkflowOp, grouped: Grouped, by: FieldValue) -> WorkflowOp {
        match src {
            WorkflowOp::Project { src: inner, shape } => {
                let resolve = |v: &DocVar| shape.resolve(v);
                let inlined_grouped = grouped.substitute(&resolve);
                let inlined_by = match &by {
                    FieldValue::Expr(e) => e.substitute(&resolve).map(FieldValue::Expr),
                    FieldValue::Nested(r) => r.inline_in(&shape).map(FieldValue::Nested),
                };
                match (inlined_grouped, inlined_by) {
                    (Some(grouped), Some(by)) => WorkflowOp::group(*inner, grouped, by),
                    _ => WorkflowOp::Group {
                        src: Box::new(WorkflowOp::Project { src: inner, shape }),
                        grouped,
                        by,
                    },
                }
            }
            other => WorkflowOp::Group {
                src: Box::new(other),
                grouped,
                by,
            },
        }
    }

    /// Geo-near must be the first stage after the source, so it hoists below
    /// every pipeline op above it. Two geo-nears in one chain are rejected.
    pub fn geo_near(src: WorkflowOp, geo: GeoNear) -> PlanResult<WorkflowOp> {
        match src {
            WorkflowOp::GeoNear { .. } => Err(PlanError::DuplicateGeoNear),
            WorkflowOp::Match { src: inner, selector } => Ok(WorkflowOp::match_(
                WorkflowOp::geo_near(*inner, geo)?,
                selector,
            )),
            WorkflowOp::Sort { src: inner, keys } => {
                Ok(WorkflowOp::sort(WorkflowOp::geo_near(*inner, geo)?, keys))
            }
            WorkflowOp::Limit { src: inner, count } => {
                Ok(WorkflowOp::limit(WorkflowOp::geo_near(*inner, geo)?, count))
            }
            WorkflowOp::Skip { src: inner, count } => {
                Ok(WorkflowOp::skip(WorkflowOp::geo_near(*inner, geo)?, count))
            }
            WorkflowOp::Project { src: inner, shape } => {
                Ok(WorkflowOp::project(WorkflowOp::geo_near(*inner, geo)?, shape))
            }
            WorkflowOp::Redact { src: inner, expr } => {
                Ok(WorkflowOp::redact(WorkflowOp::geo_near(*inner, geo)?, expr))
            }
            WorkflowOp::Unwind { src: inner, field } => {
                Ok(WorkflowOp::unwind(WorkflowOp::geo_near(*inner, geo)?, field))
            }
            WorkflowOp::Group { src: inner, grouped, by } => Ok(WorkflowOp::group(
                WorkflowOp::geo_near(*inner, geo)?,
                grouped,
                by,
            )),
            other => Ok(WorkflowOp::GeoNear {
                src: Box::new(other),
                geo,
            }),
        }
    }

    /// Adjacent maps compose their functions.
    pub fn map(src: WorkflowOp, func: js::Func) -> WorkflowOp {
        match src {
            WorkflowOp::Map { src: inner, func: first } => WorkflowOp::Map {
                src: inner,
                func: compose_map_map(&first, &func),
            },
            WorkflowOp::FlatMap { src: inner, func: first } => WorkflowOp::FlatMap {
                src: inner,
                func: compose_flat_map_map(&first, &func),
            },
            other => WorkflowOp::Map {
                src: Box::new(other),
                func,
            },
        }
    }

    pub fn flat_map(src: WorkflowOp, func: js::Func) -> WorkflowOp {
        match src {
            WorkflowOp::Map { src: inner, func: first } => WorkflowOp::FlatMap {
                src: inner,
                func: compose_map_flat_map(&first, &func),
            },
            WorkflowOp::FlatMap { src: inner, func: first } => WorkflowOp::FlatMap {
                src: inner,
                func: compose_flat_map_flat_map(&first, &func),
            },
            other => WorkflowOp::FlatMap {
                src: Box::new(other),
                func,
            },
        }
    }

    pub fn reduce(src: WorkflowOp, func: js::Func) -> WorkflowOp {
        WorkflowOp::Reduce {
            src: Box::new(src),
            func,
        }
    }

    /// A fold-left head that is itself a fold-left flattens into one.
    /// `tails` must be non-empty.
    pub fn fold_left(head: WorkflowOp, tails: Vec<WorkflowOp>) -> WorkflowOp {
        debug_assert!(!tails.is_empty(), "fold_left requires at least one tail");
        match head {
            WorkflowOp::FoldLeft {
                head: inner_head,
                tails: mut inner_tails,
            } => {
                inner_tails.extend(tails);
                WorkflowOp::FoldLeft {
                    head: inner_head,
                    tails: inner_tails,
                }
            }
            other => WorkflowOp::FoldLeft {
                head: Box::new(other),
                tails,
            },
        }
    }

    /// Sources form an unordered set; structural duplicates are dropped.
    pub fn join(srcs: Vec<WorkflowOp>) -> WorkflowOp {
        let mut unique: Vec<WorkflowOp> = Vec::with_capacity(srcs.len());
        for src in srcs {
            if !unique.contains(&src) {
                unique.push(src);
            }
        }
        WorkflowOp::Join { srcs: unique }
    }

    // ========================================================================
    // Categories
    // ========================================================================

    /// No inputs.
    pub fn is_source(&self) -> bool {
        matches!(self, WorkflowOp::Pure(_) | WorkflowOp::Read(_))
    }

    /// Exactly one predecessor.
    pub fn is_single_source(&self) -> bool {
        self.src().is_some()
    }

    /// Representable as a native pipeline stage.
    pub fn is_pipeline_op(&self) -> bool {
        matches!(
            self,
            WorkflowOp::Match { .. }
                | WorkflowOp::Sort { .. }
                | WorkflowOp::Limit { .. }
                | WorkflowOp::Skip { .. }
                | WorkflowOp::Project { .. }
                | WorkflowOp::Redact { .. }
                | WorkflowOp::Unwind { .. }
                | WorkflowOp::Group { .. }
                | WorkflowOp::GeoNear { .. }
        )
    }

    /// Leaves the document shape unchanged.
    pub fn is_shape_preserving(&self) -> bool {
        matches!(
            self,
            WorkflowOp::Match { .. }
                | WorkflowOp::Sort { .. }
                | WorkflowOp::Limit { .. }
                | WorkflowOp::Skip { .. }
        )
    }

    /// Opaque JS op.
    pub fn is_udf(&self) -> bool {
        matches!(
            self,
            WorkflowOp::Map { .. } | WorkflowOp::FlatMap { .. } | WorkflowOp::Reduce { .. }
        )
    }

    /// The single predecessor of a single-source op.
    pub fn src(&self) -> Option<&WorkflowOp> {
        match self {
            WorkflowOp::Match { src, .. }
            | WorkflowOp::Sort { src, .. }
            | WorkflowOp::Limit { src, .. }
            | WorkflowOp::Skip { src, .. }
            | WorkflowOp::Project { src, .. }
            | WorkflowOp::Redact { src, .. }
            | WorkflowOp::Unwind { src, .. }
            | WorkflowOp::Group { src, .. }
            | WorkflowOp::GeoNear { src, .. }
            | WorkflowOp::Map { src, .. }
            | WorkflowOp::FlatMap { src, .. }
            | WorkflowOp::Reduce { src, .. } => Some(src),
            WorkflowOp::Pure(_)
            | WorkflowOp::Read(_)
            | WorkflowOp::FoldLeft { .. }
            | WorkflowOp::Join { .. } => None,
        }
    }

    /// Rebuild a single-source op over a new source, re-running its
    /// constructor so coalescing composes. Sources and multi-source ops are
    /// returned unchanged.
    pub fn reparent(self, new_src: WorkflowOp) -> PlanResult<WorkflowOp> {
        Ok(match self {
            WorkflowOp::Match { selector, .. } => WorkflowOp::match_(new_src, selector),
            WorkflowOp::Sort { keys, .. } => WorkflowOp::sort(new_src, keys),
            WorkflowOp::Limit { count, .. } => WorkflowOp::limit(new_src, count),
            WorkflowOp::Skip { count, .. } => WorkflowOp::skip(new_src, count),
            WorkflowOp::Project { shape, .. } => WorkflowOp::project(new_src, shape),
            WorkflowOp::Redact { expr, .. } => WorkflowOp::redact(new_src, expr),
            WorkflowOp::Unwind { field, .. } => WorkflowOp::unwind(new_src, field),
            WorkflowOp::Group { grouped, by, .. } => WorkflowOp::group(new_src, grouped, by),
            WorkflowOp::GeoNear { geo, .. } => return WorkflowOp::geo_near(new_src, geo),
            WorkflowOp::Map { func, .. } => WorkflowOp::map(new_src, func),
            WorkflowOp::FlatMap { func, .. } => WorkflowOp::flat_map(new_src, func),
            WorkflowOp::Reduce { func, .. } => WorkflowOp::reduce(new_src, func),
            other => other,
        })
    }

    /// The native stage of a pipeline op; `None` for everything else.
    pub fn pipeline_stage(&self) -> Option<PipelineStage> {
        match self {
            WorkflowOp::Match { selector, .. } => Some(PipelineStage::Match(selector.clone())),
            WorkflowOp::Sort { keys, .. } => Some(PipelineStage::Sort(keys.clone())),
            WorkflowOp::Limit { count, .. } => Some(PipelineStage::Limit(*count)),
            WorkflowOp::Skip { count, .. } => Some(PipelineStage::Skip(*count)),
            WorkflowOp::Project { shape, .. } => Some(PipelineStage::Project(shape.clone())),
            WorkflowOp::Redact { expr, .. } => Some(PipelineStage::Redact(expr.clone())),
            WorkflowOp::Unwind { field, .. } => Some(PipelineStage::Unwind(field.clone())),
            WorkflowOp::Group { grouped, by, .. } => Some(PipelineStage::Group {
                grouped: grouped.clone(),
                by: by.clone(),
            }),
            WorkflowOp::GeoNear { geo, .. } => Some(PipelineStage::GeoNear(geo.clone())),
            _ => None,
        }
    }

    // ========================================================================
    // Reference rewriting
    // ========================================================================

    /// Apply a partial field-path substitution to the immediate stage only.
    ///
    /// Child ops are never descended into; the node type is preserved.
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> WorkflowOp {
        match self {
            WorkflowOp::Match { src, selector } => WorkflowOp::Match {
                src,
                selector: selector.rewrite_refs(f),
            },
            WorkflowOp::Sort { src, keys } => WorkflowOp::Sort {
                src,
                keys: keys
                    .into_iter()
                    .map(|(k, dir)| (f(&k).unwrap_or(k), dir))
                    .collect(),
            },
            WorkflowOp::Project { src, shape } => WorkflowOp::Project {
                src,
                shape: shape.rewrite_refs(f),
            },
            WorkflowOp::Redact { src, expr } => WorkflowOp::Redact {
                src,
                expr: expr.rewrite_refs(f),
            },
            WorkflowOp::Unwind { src, field } => WorkflowOp::Unwind {
                src,
                field: f(&field).unwrap_or(field),
            },
            WorkflowOp::Group { src, grouped, by } => WorkflowOp::Group {
                src,
                grouped: grouped.rewrite_refs(f),
                by: by.rewrite_refs(f),
            },
            WorkflowOp::GeoNear { src, geo } => WorkflowOp::GeoNear {
                src,
                geo: geo.rewrite_refs(f),
            },
            other => other,
        }
    }

    /// Collect the references of the immediate stage into `acc`.
    pub fn collect_stage_refs(&self, acc: &mut Vec<DocVar>) {
        if let Some(stage) = self.pipeline_stage() {
            stage.collect_refs(acc);
        }
    }

    // ========================================================================
    // Debug rendering
    // ========================================================================

    /// Pretty print the op tree for debugging.
    pub fn pretty_print(&self, indent: usize) -> String {
        let prefix = "  ".repeat(indent);
        match self {
            WorkflowOp::Pure(value) => format!("{}Pure({})", prefix, value),
            WorkflowOp::Read(coll) => format!("{}Read({})", prefix, coll),
            WorkflowOp::Match { src, selector } => format!(
                "{}Match({})\n{}",
                prefix,
                selector.to_json(),
                src.pretty_print(indent + 1)
            ),
            WorkflowOp::Sort { src, keys } => {
                let rendered: Vec<String> = keys
                    .iter()
                    .map(|(k, dir)| format!("{} {:?}", k.key(), dir))
                    .collect();
                format!(
                    "{}Sort({})\n{}",
                    prefix,
                    rendered.join(", "),
                    src.pretty_print(indent + 1)
                )
            }
            WorkflowOp::Limit { src, count } => {
                format!("{}Limit({})\n{}", prefix, count, src.pretty_print(indent + 1))
            }
            WorkflowOp::Skip { src, count } => {
                format!("{}Skip({})\n{}", prefix, count, src.pretty_print(indent + 1))
            }
            WorkflowOp::Project { src, shape } => format!(
                "{}Project({})\n{}",
                prefix,
                shape.to_json(),
                src.pretty_print(indent + 1)
            ),
            WorkflowOp::Redact { src, expr } => format!(
                "{}Redact({})\n{}",
                prefix,
                expr.to_json(),
                src.pretty_print(indent + 1)
            ),
            WorkflowOp::Unwind { src, field } => {
                format!("{}Unwind({})\n{}", prefix, field, src.pretty_print(indent + 1))
            }
            WorkflowOp::Group { src, grouped, by } => format!(
                "{}Group(by={}, grouped={})\n{}",
                prefix,
                by.to_json(),
                grouped.to_json(),
                src.pretty_print(indent + 1)
            ),
            WorkflowOp::GeoNear { src, geo } => format!(
                "{}GeoNear({})\n{}",
                prefix,
                geo.to_json(),
                src.pretty_print(indent + 1)
            ),
            WorkflowOp::Map { src, func } => {
                format!("{}Map({})\n{}", prefix, func, src.pretty_print(indent + 1))
            }
            WorkflowOp::FlatMap { src, func } => {
                format!("{}FlatMap({})\n{}", prefix, func, src.pretty_print(indent + 1))
            }
            WorkflowOp::Reduce { src, func } => {
                format!("{}Reduce({})\n{}", prefix, func, src.pretty_print(indent + 1))
            }
            WorkflowOp::FoldLeft { head, tails } => {
                let mut out = format!("{}FoldLeft\n{}", prefix, head.pretty_print(indent + 1));
                for tail in tails {
                    out.push('\n');
                    out.push_str(&tail.pretty_print(indent + 1));
                }
                out
            }
            WorkflowOp::Join { srcs } => {
                let mut out = format!("{}Join", prefix);
                for src in srcs {
                    out.push('\n');
                    out.push_str(&src.pretty_print(indent + 1));
                }
                out
            }
        }
    }
}

// ============================================================================
// Project/group fusion helpers
// ============================================================================

/// Fuse a projection into the group below it.
///
/// Fusion fires when every projected field inlines over the group's outputs
/// and the inlined expression is still a group operator. A computed
/// expression like `add($total, 1)` inlines to a plain expression instead,
/// which [`Expression::into_group_op`] rejects, and both nodes are kept.
fn project_group_fusion(shape: &Reshape, grouped: &Grouped) -> Option<Grouped> {
    let Reshape::Doc(fields) = shape else {
        return None;
    };
    let resolve = |v: &DocVar| -> Option<Expression> {
        match v.elements() {
            [PathElement::Field(name)] => grouped.get(name).cloned().map(Expression::Group),
            _ => None,
        }
    };
    let mut out = Vec::new();
    for (name, value) in fields {
        let FieldValue::Expr(expr) = value else {
            return None;
        };
        // The _id key passes through untouched; it is not part of the
        // grouped map.
        if let Expression::Var(var) = expr {
            if matches!(var.elements(), [PathElement::Field(f)] if f == "_id") {
                if name == "_id" {
                    continue;
                }
                return None;
            }
        }
        let inlined = expr.substitute(&resolve)?;
        let op = inlined.into_group_op(name).ok()?;
        out.push((name.clone(), op));
    }
    if out.is_empty() {
        return None;
    }
    Some(Grouped::new(out))
}

/// Three-way project/unwind/group fusion. The unwound path is renamed to the
/// projected name that passes it through.
fn project_unwind_group_fusion(
    shape: &Reshape,
    grouped: &Grouped,
    field: &DocVar,
) -> Option<(Grouped, DocVar)> {
    let fused = project_group_fusion(shape, grouped)?;
    let [PathElement::Field(target)] = field.elements() else {
        return None;
    };
    let Reshape::Doc(fields) = shape else {
        return None;
    };
    let new_name = fields.iter().find_map(|(name, value)| match value {
        FieldValue::Expr(Expression::Var(var)) => match var.elements() {
            [PathElement::Field(source)] if source == target => Some(name.clone()),
            _ => None,
        },
        _ => None,
    })?;
    Some((fused, DocVar::field(new_name)))
}

// ============================================================================
// JS composition for map/flat-map coalescing
// ============================================================================

fn apply_fn(func: &js::Func, arg: js::Expr) -> js::Expr {
    js::Expr::Func(func.clone())
        .select("apply")
        .call(vec![js::Expr::Lit(Value::Null), arg])
}

fn call_fn(func: &js::Func, args: Vec<js::Expr>) -> js::Expr {
    js::Expr::Func(func.clone()).call(args)
}

fn key_value_args() -> Vec<js::Expr> {
    vec![js::Expr::ident("key"), js::Expr::ident("value")]
}

/// `map g . map f`: apply `g` to the pair produced by `f`.
fn compose_map_map(f: &js::Func, g: &js::Func) -> js::Func {
    js::Func::new(
        vec!["key", "value"],
        vec![js::Stmt::Return(apply_fn(g, call_fn(f, key_value_args())))],
    )
}

/// `map g . flat_map f`: apply `g` to every pair produced by `f`.
fn compose_flat_map_map(f: &js::Func, g: &js::Func) -> js::Func {
    let mapper = js::Func::new(
        vec!["pair"],
        vec![js::Stmt::Return(apply_fn(g, js::Expr::ident("pair")))],
    );
    js::Func::new(
        vec!["key", "value"],
        vec![js::Stmt::Return(
            call_fn(f, key_value_args())
                .select("map")
                .call(vec![js::Expr::Func(mapper)]),
        )],
    )
}

/// `flat_map g . map f`: `g` already returns the pair list.
fn compose_map_flat_map(f: &js::Func, g: &js::Func) -> js::Func {
    js::Func::new(
        vec!["key", "value"],
        vec![js::Stmt::Return(apply_fn(g, call_fn(f, key_value_args())))],
    )
}

/// `flat_map g . flat_map f`: concatenate the lists produced by `g` on every
/// pair produced by `f`.
fn compose_flat_map_flat_map(f: &js::Func, g: &js::Func) -> js::Func {
    let collect = js::Func::new(
        vec!["nested"],
        vec![js::Stmt::Expr(
            js::Expr::ident("out")
                .select("push")
                .call(vec![js::Expr::ident("nested")]),
        )],
    );
    let outer = js::Func::new(
        vec!["pair"],
        vec![js::Stmt::Expr(
            apply_fn(g, js::Expr::ident("pair"))
                .select("map")
                .call(vec![js::Expr::Func(collect)]),
        )],
    );
    js::Func::new(
        vec!["key", "value"],
        vec![
            js::Stmt::VarDecl("out".to_string(), Some(js::Expr::Arr(Vec::new()))),
            js::Stmt::Expr(
                call_fn(f, key_value_args())
                    .select("map")
                    .call(vec![js::Expr::Func(outer)]),
            ),
            js::Stmt::Return(js::Expr::ident("out")),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_c() -> WorkflowOp {
        WorkflowOp::read("c")
    }

    #[test]
    fn test_limit_over_limit_takes_minimum() {
        let op = WorkflowOp::limit(WorkflowOp::limit(read_c(), 10), 5);
        assert_eq!(
            op,
            WorkflowOp::Limit {
                src: Box::new(read_c()),
                count: 5
            }
        );
    }

    #[test]
    fn test_match_over_match_ands_selectors() {
        let op = WorkflowOp::match_(
            WorkflowOp::match_(read_c(), Selector::eq("x", json!(1))),
            Selector::eq("y", json!(2)),
        );
        assert_eq!(
            op,
            WorkflowOp::Match {
                src: Box::new(read_c()),
                selector: Selector::and(
                    Selector::eq("x", json!(1)),
                    Selector::eq("y", json!(2))
                ),
            }
        );
    }

    #[test]
    fn test_match_floats_above_sort() {
        let keys = vec![(DocVar::field("k"), SortDir::Ascending)];
        let op = WorkflowOp::match_(
            WorkflowOp::sort(read_c(), keys.clone()),
            Selector::eq("x", json!(1)),
        );
        assert_eq!(
            op,
            WorkflowOp::Sort {
                src: Box::new(WorkflowOp::Match {
                    src: Box::new(read_c()),
                    selector: Selector::eq("x", json!(1)),
                }),
                keys,
            }
        );
    }

    #[test]
    fn test_limit_over_skip_rewrites_to_skip_over_limit() {
        let op = WorkflowOp::limit(WorkflowOp::skip(read_c(), 3), 5);
        assert_eq!(
            op,
            WorkflowOp::Skip {
                src: Box::new(WorkflowOp::Limit {
                    src: Box::new(read_c()),
                    count: 8
                }),
                count: 3,
            }
        );
    }

    #[test]
    fn test_skip_over_skip_adds() {
        let op = WorkflowOp::skip(WorkflowOp::skip(read_c(), 3), 4);
        assert_eq!(
            op,
            WorkflowOp::Skip {
                src: Box::new(read_c()),
                count: 7
            }
        );
    }

    #[test]
    fn test_project_over_project_inlines() {
        let inner = Reshape::doc(vec![(
            "a".to_string(),
            FieldValue::Expr(Expression::field("src")),
        )]);
        let outer = Reshape::doc(vec![(
            "b".to_string(),
            FieldValue::Expr(Expression::field("a")),
        )]);
        let op = WorkflowOp::project(WorkflowOp::project(read_c(), inner), outer);
        assert_eq!(
            op,
            WorkflowOp::Project {
                src: Box::new(read_c()),
                shape: Reshape::doc(vec![(
                    "b".to_string(),
                    FieldValue::Expr(Expression::field("src")),
                )]),
            }
        );
    }

    #[test]
    fn test_project_over_project_keeps_both_on_unresolved_ref() {
        let inner = Reshape::doc(vec![(
            "a".to_string(),
            FieldValue::Expr(Expression::field("src")),
        )]);
        let outer = Reshape::doc(vec![(
            "b".to_string(),
            FieldValue::Expr(Expression::field("missing")),
        )]);
        let op = WorkflowOp::project(WorkflowOp::project(read_c(), inner.clone()), outer.clone());
        assert_eq!(
            op,
            WorkflowOp::Project {
                src: Box::new(WorkflowOp::Project {
                    src: Box::new(read_c()),
                    shape: inner,
                }),
                shape: outer,
            }
        );
    }

    #[test]
    fn test_project_over_group_fuses_passthroughs() {
        use crate::expr::GroupOp;
        let grouped = Grouped::new(vec![
            ("s".to_string(), GroupOp::Sum(Box::new(Expression::field("a")))),
            ("m".to_string(), GroupOp::Avg(Box::new(Expression::field("b")))),
        ]);
        let by = FieldValue::Expr(Expression::field("city"));
        let shape = Reshape::doc(vec![(
            "total".to_string(),
            FieldValue::Expr(Expression::field("s")),
        )]);

        let op = WorkflowOp::project(
            WorkflowOp::group(read_c(), grouped, by.clone()),
            shape,
        );
        assert_eq!(
            op,
            WorkflowOp::Group {
                src: Box::new(read_c()),
                grouped: Grouped::new(vec![(
                    "total".to_string(),
                    GroupOp::Sum(Box::new(Expression::field("a"))),
                )]),
                by,
            }
        );
    }

    #[test]
    fn test_project_over_group_keeps_computed_expression() {
        use crate::expr::GroupOp;
        let grouped = Grouped::new(vec![(
            "s".to_string(),
            GroupOp::Sum(Box::new(Expression::field("a"))),
        )]);
        let by = FieldValue::Expr(Expression::field("k"));
        // add($s, 1) would demote the group operator, so both nodes stay.
        let shape = Reshape::doc1(
            "t",
            FieldValue::Expr(Expression::Add(
                Box::new(Expression::field("s")),
                Box::new(Expression::Literal(json!(1))),
            )),
        );

        let op = WorkflowOp::project(
            WorkflowOp::group(read_c(), grouped.clone(), by.clone()),
            shape.clone(),
        );
        assert_eq!(
            op,
            WorkflowOp::Project {
                src: Box::new(WorkflowOp::Group {
                    src: Box::new(read_c()),
                    grouped,
                    by,
                }),
                shape,
            }
        );
    }

    #[test]
    fn test_group_over_project_inlines_definitions() {
        use crate::expr::GroupOp;
        let shape = Reshape::doc(vec![(
            "a".to_string(),
            FieldValue::Expr(Expression::field("raw")),
        )]);
        let grouped = Grouped::new(vec![(
            "total".to_string(),
            GroupOp::Sum(Box::new(Expression::field("a"))),
        )]);
        let by = FieldValue::Expr(Expression::field("a"));

        let op = WorkflowOp::group(WorkflowOp::project(read_c(), shape), grouped, by);
        assert_eq!(
            op,
            WorkflowOp::Group {
                src: Box::new(read_c()),
                grouped: Grouped::new(vec![(
                    "total".to_string(),
                    GroupOp::Sum(Box::new(Expression::field("raw"))),
                )]),
                by: FieldValue::Expr(Expression::field("raw")),
            }
        );
    }

    #[test]
    fn test_geo_near_hoists_below_pipeline_ops() {
        let geo = GeoNear::new((0.0, 0.0), DocVar::field("dist"));
        let op = WorkflowOp::geo_near(
            WorkflowOp::match_(read_c(), Selector::eq("x", json!(1))),
            geo.clone(),
        )
        .expect("single geo-near is fine");
        assert_eq!(
            op,
            WorkflowOp::Match {
                src: Box::new(WorkflowOp::GeoNear {
                    src: Box::new(read_c()),
                    geo,
                }),
                selector: Selector::eq("x", json!(1)),
            }
        );
    }

    #[test]
    fn test_two_geo_nears_in_one_chain_are_rejected() {
        let geo = GeoNear::new((0.0, 0.0), DocVar::field("dist"));
        let first = WorkflowOp::geo_near(read_c(), geo.clone()).expect("first is fine");
        let above = WorkflowOp::limit(first, 10);
        assert_eq!(
            WorkflowOp::geo_near(above, geo),
            Err(PlanError::DuplicateGeoNear)
        );
    }

    #[test]
    fn test_fold_left_flattens() {
        let op = WorkflowOp::fold_left(
            WorkflowOp::fold_left(read_c(), vec![WorkflowOp::read("d")]),
            vec![WorkflowOp::read("e")],
        );
        assert_eq!(
            op,
            WorkflowOp::FoldLeft {
                head: Box::new(read_c()),
                tails: vec![WorkflowOp::read("d"), WorkflowOp::read("e")],
            }
        );
    }

    #[test]
    fn test_join_drops_structural_duplicates() {
        let op = WorkflowOp::join(vec![read_c(), WorkflowOp::read("d"), read_c()]);
        assert_eq!(
            op,
            WorkflowOp::Join {
                srcs: vec![read_c(), WorkflowOp::read("d")],
            }
        );
    }

    #[test]
    fn test_map_over_map_composes_functions() {
        let f = js::Func::new(
            vec!["key", "value"],
            vec![js::Stmt::Return(js::Expr::Arr(vec![
                js::Expr::ident("key"),
                js::Expr::ident("value"),
            ]))],
        );
        let op = WorkflowOp::map(WorkflowOp::map(read_c(), f.clone()), f);
        let WorkflowOp::Map { src, func } = op else {
            panic!("expected composed map");
        };
        assert_eq!(*src, read_c());
        assert!(func.to_string().contains(".apply(null, "));
    }

    #[test]
    fn test_coalesce_stability() {
        // Re-running a constructor over an already-coalesced op's parts is a
        // no-op.
        let op = WorkflowOp::limit(WorkflowOp::skip(read_c(), 3), 5);
        let WorkflowOp::Skip { src, count } = op.clone() else {
            panic!("expected skip on top");
        };
        assert_eq!(WorkflowOp::skip(*src, count), op);
    }
}
