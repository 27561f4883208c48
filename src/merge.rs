//! # Merge
//!
//! The binary combinator that joins two workflow graphs into one while
//! sharing their common source. `merge` returns the combined graph plus two
//! bases: the document-relative paths where the left and right plans' outputs
//! live inside the merged documents.
//!
//! Divergent branches are namespaced under the reserved labels `lEft` and
//! `rIght`. The dispatch below is ordered; the first matching case wins, and
//! `delegate` re-dispatches with swapped arguments and swapped bases. Any
//! residual pair falls through to a fold-left of the two namespaced
//! branches, so the table is total.

use serde_json::Value;
use tracing::trace;

use crate::error::PlanResult;
use crate::expr::{DocVar, Expression, GroupOp, Grouped};
use crate::op::WorkflowOp;
use crate::reshape::{FieldValue, Reshape};

/// Reserved label namespacing the left branch of a merge.
pub const LEFT_LABEL: &str = "lEft";

/// Reserved label namespacing the right branch of a merge.
pub const RIGHT_LABEL: &str = "rIght";

fn left_var() -> DocVar {
    DocVar::field(LEFT_LABEL)
}

fn right_var() -> DocVar {
    DocVar::field(RIGHT_LABEL)
}

/// Merge two workflow graphs.
///
/// Returns `((left_base, right_base), merged)`. Structurally equal inputs
/// produce identical outputs: fresh names come from a counter local to this
/// call.
pub fn merge(
    left: &WorkflowOp,
    right: &WorkflowOp,
) -> PlanResult<((DocVar, DocVar), WorkflowOp)> {
    Merger::default().merge(left, right)
}

/// Rebase an op's internal references by `base.concat(_)` and compute the
/// base its consumers see afterwards: ROOT when the op resets the document
/// shape (group, project), else `base` unchanged.
fn rewrite(op: WorkflowOp, base: &DocVar) -> (WorkflowOp, DocVar) {
    let rewritten = if base.is_root() {
        op
    } else {
        op.rewrite_refs(&|v| Some(base.concat(v)))
    };
    let new_base = match &rewritten {
        WorkflowOp::Group { .. } | WorkflowOp::Project { .. } => DocVar::root(),
        _ => base.clone(),
    };
    (rewritten, new_base)
}

fn rebase(base: &DocVar) -> impl Fn(&DocVar) -> Option<DocVar> + '_ {
    move |v| Some(base.concat(v))
}

#[derive(Default)]
struct Merger {
    fresh: usize,
}

impl Merger {
    fn fresh_name(&mut self) -> String {
        let name = format!("__tmp{}", self.fresh);
        self.fresh += 1;
        name
    }

    /// Re-dispatch with swapped arguments; swap the returned bases back.
    fn delegate(
        &mut self,
        left: &WorkflowOp,
        right: &WorkflowOp,
    ) -> PlanResult<((DocVar, DocVar), WorkflowOp)> {
        let ((rb, lb), merged) = self.merge(right, left)?;
        Ok(((lb, rb), merged))
    }

    /// Materialize the other branch through a group: merge the group's
    /// source with it, push its documents into a fresh array field, then
    /// unwind that field.
    fn group_through(
        &mut self,
        group_src: &WorkflowOp,
        grouped: &Grouped,
        by: &FieldValue,
        other: &WorkflowOp,
    ) -> PlanResult<((DocVar, DocVar), WorkflowOp)> {
        let ((lb, rb), src) = self.merge(group_src, other)?;
        let tmp = self.fresh_name();
        let mut fields: Vec<(String, GroupOp)> =
            grouped.clone().rewrite_refs(&rebase(&lb)).0;
        fields.push((
            tmp.clone(),
            GroupOp::Push(Box::new(Expression::Var(rb))),
        ));
        let by = by.clone().rewrite_refs(&rebase(&lb));
        let group = WorkflowOp::group(src, Grouped::new(fields), by);
        let merged = WorkflowOp::unwind(group, DocVar::field(&tmp));
        Ok(((DocVar::root(), DocVar::field(tmp)), merged))
    }

    /// Last resort: two disjoint branches folded together, each projecting
    /// itself under its namespace label.
    fn fallback(
        &mut self,
        left: &WorkflowOp,
        right: &WorkflowOp,
    ) -> PlanResult<((DocVar, DocVar), WorkflowOp)> {
        trace!("merge fell through to fold-left of disjoint branches");
        let head = WorkflowOp::project(
            left.clone(),
            Reshape::doc1(LEFT_LABEL, FieldValue::Expr(Expression::root())),
        );
        let tail = WorkflowOp::project(
            right.clone(),
            Reshape::doc1(RIGHT_LABEL, FieldValue::Expr(Expression::root())),
        );
        Ok((
            (left_var(), right_var()),
            WorkflowOp::fold_left(head, vec![tail]),
        ))
    }

    #[allow(clippy::too_many_lines)]
    fn merge(
        &mut self,
        left: &WorkflowOp,
        right: &WorkflowOp,
    ) -> PlanResult<((DocVar, DocVar), WorkflowOp)> {
        use WorkflowOp::*;

        // Identical plans share everything.
        if left == right {
            return Ok(((DocVar::root(), DocVar::root()), left.clone()));
        }

        match (left, right) {
            // Two literals become one literal document.
            (Pure(l), Pure(r)) => {
                let mut doc = serde_json::Map::new();
                doc.insert(LEFT_LABEL.to_string(), l.clone());
                doc.insert(RIGHT_LABEL.to_string(), r.clone());
                Ok((
                    (left_var(), right_var()),
                    WorkflowOp::pure(Value::Object(doc)),
                ))
            }

            // A literal rides along on the other branch as a projected field.
            (Pure(l), r) => {
                let shape = Reshape::doc(vec![
                    (
                        LEFT_LABEL.to_string(),
                        FieldValue::Expr(Expression::Literal(l.clone())),
                    ),
                    (RIGHT_LABEL.to_string(), FieldValue::Expr(Expression::root())),
                ]);
                Ok((
                    (left_var(), right_var()),
                    WorkflowOp::project(r.clone(), shape),
                ))
            }
            (_, Pure(_)) => self.delegate(left, right),

            // Geo-near must stay at the bottom of any pipeline chain, so the
            // other pipeline op is rebuilt on top of the recursive merge.
            (l @ GeoNear { .. }, r) if r.is_pipeline_op() => match r.src() {
                Some(rsrc) => {
                    let ((lb, rb), src) = self.merge(l, rsrc)?;
                    let (r0, rb0) = rewrite(r.clone(), &rb);
                    Ok(((lb, rb0), r0.reparent(src)?))
                }
                None => self.fallback(left, right),
            },
            (l, r @ GeoNear { .. }) if l.is_pipeline_op() => self.delegate(l, r),

            // A projection of the exact shared source needs no recursion.
            (Project { src, shape }, r) if **src == *r => {
                let combined = Reshape::doc(vec![
                    (
                        LEFT_LABEL.to_string(),
                        FieldValue::Nested(shape.clone()),
                    ),
                    (RIGHT_LABEL.to_string(), FieldValue::Expr(Expression::root())),
                ]);
                Ok((
                    (left_var(), right_var()),
                    WorkflowOp::project(r.clone(), combined),
                ))
            }
            (l, Project { src, .. }) if *l == **src => self.delegate(left, right),

            // Shape-preserving ops float above the merge of their source with
            // the other pipeline.
            (l, r) if l.is_shape_preserving() && r.is_pipeline_op() => match l.src() {
                Some(lsrc) => {
                    let ((lb, rb), src) = self.merge(lsrc, r)?;
                    let (l0, lb0) = rewrite(l.clone(), &lb);
                    Ok(((lb0, rb), l0.reparent(src)?))
                }
                None => self.fallback(left, right),
            },
            (l, r) if l.is_pipeline_op() && r.is_shape_preserving() => self.delegate(l, r),

            // Project against a bare source.
            (Project { src, shape }, r) if r.is_source() => {
                let ((lb, rb), merged_src) = self.merge(src, r)?;
                let combined = Reshape::doc(vec![
                    (
                        LEFT_LABEL.to_string(),
                        FieldValue::Nested(shape.clone().rewrite_refs(&rebase(&lb))),
                    ),
                    (
                        RIGHT_LABEL.to_string(),
                        FieldValue::Expr(Expression::Var(rb)),
                    ),
                ]);
                Ok((
                    (left_var(), right_var()),
                    WorkflowOp::project(merged_src, combined),
                ))
            }
            (l, Project { .. }) if l.is_source() => self.delegate(left, right),

            // An unwind reparents over the merge with a group, its path
            // rebased through the returned base.
            (Unwind { src, field }, r @ Group { .. }) => {
                let ((lb, rb), merged) = self.merge(src, r)?;
                let field0 = lb.concat(field);
                Ok(((lb, rb), WorkflowOp::unwind(merged, field0)))
            }
            (Group { .. }, Unwind { .. }) => self.delegate(left, right),

            // Two groups over the same key become one group with fresh output
            // names, regrouped under the namespace labels by a following
            // project. Group cannot produce nested structure directly.
            (
                Group {
                    src: lsrc,
                    grouped: lg,
                    by: lby,
                },
                Group {
                    src: rsrc,
                    grouped: rg,
                    by: rby,
                },
            ) if lby == rby => {
                let ((lb, rb), src) = self.merge(lsrc, rsrc)?;
                // The keys only fuse when they still agree after rebasing
                // through the recursively-determined bases. Textually equal
                // keys that land at different bases are not the same key;
                // materialize the right side through the left group instead.
                let by_l = lby.clone().rewrite_refs(&rebase(&lb));
                let by_r = rby.clone().rewrite_refs(&rebase(&rb));
                if by_l != by_r {
                    return self.group_through(lsrc, lg, lby, right);
                }
                let mut combined = Vec::with_capacity(lg.len() + rg.len());
                let mut left_fields = Vec::with_capacity(lg.len());
                let mut right_fields = Vec::with_capacity(rg.len());
                for (name, op) in lg.fields() {
                    let tmp = self.fresh_name();
                    combined.push((tmp.clone(), op.clone().rewrite_refs(&rebase(&lb))));
                    left_fields.push((
                        name.clone(),
                        FieldValue::Expr(Expression::field(tmp)),
                    ));
                }
                for (name, op) in rg.fields() {
                    let tmp = self.fresh_name();
                    combined.push((tmp.clone(), op.clone().rewrite_refs(&rebase(&rb))));
                    right_fields.push((
                        name.clone(),
                        FieldValue::Expr(Expression::field(tmp)),
                    ));
                }
                let group = WorkflowOp::group(src, Grouped::new(combined), by_l);
                let shape = Reshape::doc(vec![
                    (
                        LEFT_LABEL.to_string(),
                        FieldValue::Nested(Reshape::doc(left_fields)),
                    ),
                    (
                        RIGHT_LABEL.to_string(),
                        FieldValue::Nested(Reshape::doc(right_fields)),
                    ),
                ]);
                Ok((
                    (left_var(), right_var()),
                    WorkflowOp::project(group, shape),
                ))
            }

            // A group against a pipeline materializes the pipeline side
            // through the group: push its documents into a fresh array field,
            // then unwind that field. A bare read counts as the degenerate
            // pipeline here; anything else would lose the other branch's
            // documents to the group.
            (
                Group {
                    src: lsrc,
                    grouped,
                    by,
                },
                r,
            ) if r.is_pipeline_op() || r.is_source() => {
                self.group_through(lsrc, grouped, by, r)
            }
            (l, Group { .. }) if l.is_pipeline_op() || l.is_source() => {
                self.delegate(left, right)
            }

            // Two projections merge their reshapes when no leaf conflicts;
            // otherwise both shapes are namespaced.
            (
                Project {
                    src: lsrc,
                    shape: ls,
                },
                Project {
                    src: rsrc,
                    shape: rs,
                },
            ) => {
                let ((lb, rb), src) = self.merge(lsrc, rsrc)?;
                let ls0 = ls.clone().rewrite_refs(&rebase(&lb));
                let rs0 = rs.clone().rewrite_refs(&rebase(&rb));
                match ls0.merge(&rs0) {
                    Some(shape) => Ok((
                        (DocVar::root(), DocVar::root()),
                        WorkflowOp::project(src, shape),
                    )),
                    None => {
                        let shape = Reshape::doc(vec![
                            (LEFT_LABEL.to_string(), FieldValue::Nested(ls0)),
                            (RIGHT_LABEL.to_string(), FieldValue::Nested(rs0)),
                        ]);
                        Ok((
                            (left_var(), right_var()),
                            WorkflowOp::project(src, shape),
                        ))
                    }
                }
            }

            // Project against any other pipeline op.
            (Project { src: lsrc, shape }, r) if r.is_pipeline_op() => {
                let ((lb, rb), src) = self.merge(lsrc, r)?;
                let combined = Reshape::doc(vec![
                    (
                        LEFT_LABEL.to_string(),
                        FieldValue::Nested(shape.clone().rewrite_refs(&rebase(&lb))),
                    ),
                    (
                        RIGHT_LABEL.to_string(),
                        FieldValue::Expr(Expression::Var(rb)),
                    ),
                ]);
                Ok((
                    (left_var(), right_var()),
                    WorkflowOp::project(src, combined),
                ))
            }
            (l, Project { .. }) if l.is_pipeline_op() => self.delegate(left, right),

            // Redactions are order-sensitive but commutable here: sequence
            // both over the merged source.
            (
                Redact {
                    src: lsrc,
                    expr: le,
                },
                Redact {
                    src: rsrc,
                    expr: re,
                },
            ) => {
                let ((lb, rb), src) = self.merge(lsrc, rsrc)?;
                let le0 = le.clone().rewrite_refs(&rebase(&lb));
                let re0 = re.clone().rewrite_refs(&rebase(&rb));
                Ok((
                    (lb, rb),
                    WorkflowOp::redact(WorkflowOp::redact(src, le0), re0),
                ))
            }

            // Unwinds of the same rebased field collapse to one; different
            // fields sequence in order.
            (
                Unwind {
                    src: lsrc,
                    field: lf,
                },
                Unwind {
                    src: rsrc,
                    field: rf,
                },
            ) => {
                let ((lb, rb), src) = self.merge(lsrc, rsrc)?;
                let lf0 = lb.concat(lf);
                let rf0 = rb.concat(rf);
                if lf0 == rf0 {
                    Ok(((lb, rb), WorkflowOp::unwind(src, lf0)))
                } else {
                    Ok((
                        (lb, rb),
                        WorkflowOp::unwind(WorkflowOp::unwind(src, lf0), rf0),
                    ))
                }
            }

            (Unwind { src, field }, r @ Redact { .. }) => {
                let ((lb, rb), merged) = self.merge(src, r)?;
                Ok(((lb.clone(), rb), WorkflowOp::unwind(merged, lb.concat(field))))
            }
            (Redact { .. }, Unwind { .. }) => self.delegate(left, right),

            // The UDF boundary: a read cannot be pipelined with a map, so
            // both sides fold.
            (l @ Read(_), r @ Map { .. }) => self.fallback(l, r),
            (Map { .. }, Read(_)) => self.delegate(left, right),

            // A map rides under `lEft` while the projection contributes its
            // shape under `rIght`.
            (l @ Map { .. }, Project { src: rsrc, shape }) => {
                let ((lb, rb), src) = self.merge(l, rsrc)?;
                let combined = Reshape::doc(vec![
                    (
                        LEFT_LABEL.to_string(),
                        FieldValue::Expr(Expression::Var(lb)),
                    ),
                    (
                        RIGHT_LABEL.to_string(),
                        FieldValue::Nested(shape.clone().rewrite_refs(&rebase(&rb))),
                    ),
                ]);
                Ok((
                    (left_var(), right_var()),
                    WorkflowOp::project(src, combined),
                ))
            }
            (Project { .. }, Map { .. }) => self.delegate(left, right),

            // Default: recurse into the pipeline op's source and rebuild it
            // on top.
            (l, r) if r.is_pipeline_op() => match r.src() {
                Some(rsrc) => {
                    let ((lb, rb), src) = self.merge(l, rsrc)?;
                    let (r0, rb0) = rewrite(r.clone(), &rb);
                    Ok(((lb, rb0), r0.reparent(src)?))
                }
                None => self.fallback(left, right),
            },
            (l, r) if l.is_pipeline_op() => self.delegate(l, r),

            _ => self.fallback(left, right),
        }
    }
}
