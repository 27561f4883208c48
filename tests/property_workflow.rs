//! Property-based workflow tests (proptest).

use proptest::prelude::*;
use serde_json::json;

use docflow::{
    finish, merge, workflow, DocVar, Expression, FieldValue, GroupOp, Grouped, Reshape,
    Selector, SortDir, WorkflowOp,
};

/// Small random plans over a single shared collection. Leaves are reads of
/// `c`, so merge properties get the interesting shared-source paths.
fn arb_plan() -> impl Strategy<Value = WorkflowOp> {
    let leaf = Just(WorkflowOp::read("c"));
    leaf.prop_recursive(3, 12, 2, |inner| {
        prop_oneof![
            (inner.clone(), 0u64..32).prop_map(|(src, n)| WorkflowOp::limit(src, n)),
            (inner.clone(), 0u64..32).prop_map(|(src, n)| WorkflowOp::skip(src, n)),
            (inner.clone(), 0i64..8).prop_map(|(src, v)| {
                WorkflowOp::match_(src, Selector::eq("x", json!(v)))
            }),
            inner.clone().prop_map(|src| {
                WorkflowOp::sort(src, vec![(DocVar::field("k"), SortDir::Ascending)])
            }),
            (inner.clone(), "[a-d]{1,3}").prop_map(|(src, name)| {
                WorkflowOp::project(
                    src,
                    Reshape::doc1(name, FieldValue::Expr(Expression::field("x"))),
                )
            }),
            inner.clone().prop_map(|src| {
                WorkflowOp::group(
                    src,
                    Grouped::new(vec![(
                        "total".to_string(),
                        GroupOp::Sum(Box::new(Expression::field("a"))),
                    )]),
                    FieldValue::Expr(Expression::field("k")),
                )
            }),
            inner.prop_map(|src| WorkflowOp::unwind(src, DocVar::field("items"))),
        ]
    })
}

proptest! {
    #[test]
    fn prop_workflow_is_deterministic(plan in arb_plan()) {
        let first = workflow(plan.clone());
        let second = workflow(plan);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_finish_is_idempotent(plan in arb_plan()) {
        let once = finish(plan);
        let twice = finish(once.clone());
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn prop_merge_identity(plan in arb_plan()) {
        let ((lb, rb), merged) = merge(&plan, &plan).expect("self merge");
        prop_assert!(lb.is_root());
        prop_assert!(rb.is_root());
        prop_assert_eq!(merged, plan);
    }

    #[test]
    fn prop_merge_with_shared_source_commutes(plan in arb_plan()) {
        let source = WorkflowOp::read("c");
        let ((ab_l, ab_r), ab) = merge(&plan, &source).expect("plan/source");
        let ((ba_l, ba_r), ba) = merge(&source, &plan).expect("source/plan");
        prop_assert_eq!(ab_l, ba_r);
        prop_assert_eq!(ab_r, ba_l);
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn prop_merge_is_deterministic(a in arb_plan(), b in arb_plan()) {
        let first = merge(&a, &b).expect("first merge");
        let second = merge(&a, &b).expect("second merge");
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_limit_chain_takes_minimum(a in 0u64..1000, b in 0u64..1000) {
        let op = WorkflowOp::limit(WorkflowOp::limit(WorkflowOp::read("c"), a), b);
        prop_assert_eq!(
            op,
            WorkflowOp::Limit {
                src: Box::new(WorkflowOp::read("c")),
                count: a.min(b),
            }
        );
    }

    #[test]
    fn prop_skip_chain_adds(a in 0u64..1000, b in 0u64..1000) {
        let op = WorkflowOp::skip(WorkflowOp::skip(WorkflowOp::read("c"), a), b);
        prop_assert_eq!(
            op,
            WorkflowOp::Skip {
                src: Box::new(WorkflowOp::read("c")),
                count: a + b,
            }
        );
    }

    #[test]
    fn prop_reshape_rewrite_preserves_field_order(names in proptest::collection::vec("[a-z]{1,6}", 1..6)) {
        let mut seen = std::collections::HashSet::new();
        let fields: Vec<_> = names
            .into_iter()
            .filter(|n| seen.insert(n.clone()))
            .map(|n| (n, FieldValue::Expr(Expression::field("x"))))
            .collect();
        let shape = Reshape::doc(fields.clone());
        let order_before = shape.field_names();

        let base = DocVar::field("lEft");
        let rewritten = shape.rewrite_refs(&|v| Some(base.concat(v)));
        prop_assert_eq!(rewritten.field_names(), order_before);
    }

    #[test]
    fn prop_rewrite_refs_only_produces_images(plan in arb_plan(), prefix in "[a-z]{1,4}") {
        // After rebasing every reference under `prefix`, every reference in
        // the result starts with `prefix`.
        let base = DocVar::field(prefix);
        let rewritten = plan.rewrite_refs(&|v| Some(base.concat(v)));
        let mut refs = Vec::new();
        rewritten.collect_stage_refs(&mut refs);
        for r in refs {
            prop_assert!(r.starts_with(&base));
        }
    }
}
