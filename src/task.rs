//! # Workflow Tasks
//!
//! The output IR consumed by the execution layer. Each task is a
//! self-contained description: pipelines are ordered stage lists, map-reduce
//! bundles map/reduce/finalizer JS plus optional selection, input sort,
//! limit, and out-action.
//!
//! The reserved field `value` is the implicit carrier produced by map-reduce
//! stages; consumers of this IR must treat it (and the merge labels `lEft`
//! and `rIght`) as synthetic namespace labels.

use serde_json::{json, Value};

use crate::expr::DocVar;
use crate::js;
use crate::op::Collection;
use crate::stage::{PipelineStage, SortDir};

/// What a map-reduce job does with its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum OutAction {
    /// Replace the target contents
    Replace,
    /// Merge documents into the target, overwriting on key collision
    Merge,
    /// Reduce colliding documents into the accumulator
    Reduce,
}

impl OutAction {
    fn as_str(self) -> &'static str {
        match self {
            OutAction::Replace => "replace",
            OutAction::Merge => "merge",
            OutAction::Reduce => "reduce",
        }
    }
}

/// A map-reduce job description.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct MapReduce {
    pub map: js::Func,
    pub reduce: js::Func,
    pub finalizer: Option<js::Func>,
    /// Query applied before mapping
    pub selection: Option<crate::selector::Selector>,
    /// Sort applied to the mapper's input
    pub input_sort: Option<Vec<(DocVar, SortDir)>>,
    pub limit: Option<u64>,
    pub out: Option<OutAction>,
}

impl MapReduce {
    pub fn new(map: js::Func, reduce: js::Func) -> Self {
        MapReduce {
            map,
            reduce,
            finalizer: None,
            selection: None,
            input_sort: None,
            limit: None,
            out: None,
        }
    }

    /// The identity reducer. Keys emitted at most once reduce to themselves.
    pub fn identity_reduce() -> js::Func {
        js::Func::new(
            vec!["key", "values"],
            vec![js::Stmt::Return(js::Expr::Access(
                Box::new(js::Expr::ident("values")),
                Box::new(js::Expr::Lit(json!(0))),
            ))],
        )
    }

    pub fn to_json(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("map".to_string(), Value::String(self.map.to_string()));
        doc.insert("reduce".to_string(), Value::String(self.reduce.to_string()));
        if let Some(finalizer) = &self.finalizer {
            doc.insert("finalize".to_string(), Value::String(finalizer.to_string()));
        }
        if let Some(selection) = &self.selection {
            doc.insert("query".to_string(), selection.to_json());
        }
        if let Some(keys) = &self.input_sort {
            let mut sort = serde_json::Map::new();
            for (k, dir) in keys {
                let dir = match dir {
                    SortDir::Ascending => json!(1),
                    SortDir::Descending => json!(-1),
                };
                sort.insert(k.key(), dir);
            }
            doc.insert("sort".to_string(), Value::Object(sort));
        }
        if let Some(limit) = self.limit {
            doc.insert("limit".to_string(), json!(limit));
        }
        if let Some(out) = self.out {
            doc.insert("out".to_string(), Value::String(out.as_str().to_string()));
        }
        Value::Object(doc)
    }
}

/// A lowered, executable workflow: the leaves of execution.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum WorkflowTask {
    /// Literal result set
    Pure(Value),
    /// Plain collection scan
    Read(Collection),
    /// A native pipeline over a source task
    Pipeline {
        source: Box<WorkflowTask>,
        stages: Vec<PipelineStage>,
    },
    /// A map-reduce job over a source task
    MapReduce {
        source: Box<WorkflowTask>,
        spec: MapReduce,
    },
    /// Sequential accumulation: run the head, then reduce each tail into the
    /// accumulator
    FoldLeft {
        head: Box<WorkflowTask>,
        tails: Vec<WorkflowTask>,
    },
    /// Join of independently-crushed sources; semantics belong to the runtime
    Join { srcs: Vec<WorkflowTask> },
}

impl WorkflowTask {
    /// Node-type name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowTask::Pure(_) => "Pure",
            WorkflowTask::Read(_) => "Read",
            WorkflowTask::Pipeline { .. } => "Pipeline",
            WorkflowTask::MapReduce { .. } => "MapReduce",
            WorkflowTask::FoldLeft { .. } => "FoldLeft",
            WorkflowTask::Join { .. } => "Join",
        }
    }

    /// Pretty print the task tree for debugging.
    pub fn pretty_print(&self, indent: usize) -> String {
        let prefix = "  ".repeat(indent);
        match self {
            WorkflowTask::Pure(value) => format!("{}Pure({})", prefix, value),
            WorkflowTask::Read(coll) => format!("{}Read({})", prefix, coll),
            WorkflowTask::Pipeline { source, stages } => {
                let rendered: Vec<String> =
                    stages.iter().map(|s| s.to_json().to_string()).collect();
                format!(
                    "{}Pipeline([{}])\n{}",
                    prefix,
                    rendered.join(", "),
                    source.pretty_print(indent + 1)
                )
            }
            WorkflowTask::MapReduce { source, spec } => format!(
                "{}MapReduce({})\n{}",
                prefix,
                spec.to_json(),
                source.pretty_print(indent + 1)
            ),
            WorkflowTask::FoldLeft { head, tails } => {
                let mut out = format!("{}FoldLeft\n{}", prefix, head.pretty_print(indent + 1));
                for tail in tails {
                    out.push('\n');
                    out.push_str(&tail.pretty_print(indent + 1));
                }
                out
            }
            WorkflowTask::Join { srcs } => {
                let mut out = format!("{}Join", prefix);
                for src in srcs {
                    out.push('\n');
                    out.push_str(&src.pretty_print(indent + 1));
                }
                out
            }
        }
    }

    /// Render the task tree as a JSON document.
    pub fn to_json(&self) -> Value {
        match self {
            WorkflowTask::Pure(value) => json!({ "pure": value }),
            WorkflowTask::Read(coll) => json!({ "read": coll.name() }),
            WorkflowTask::Pipeline { source, stages } => {
                let stages: Vec<Value> = stages.iter().map(PipelineStage::to_json).collect();
                json!({ "pipeline": stages, "source": source.to_json() })
            }
            WorkflowTask::MapReduce { source, spec } => {
                json!({ "mapReduce": spec.to_json(), "source": source.to_json() })
            }
            WorkflowTask::FoldLeft { head, tails } => {
                let tails: Vec<Value> = tails.iter().map(WorkflowTask::to_json).collect();
                json!({ "foldLeft": { "head": head.to_json(), "tails": tails } })
            }
            WorkflowTask::Join { srcs } => {
                let srcs: Vec<Value> = srcs.iter().map(WorkflowTask::to_json).collect();
                json!({ "join": srcs })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_reduce_rendering() {
        assert_eq!(
            MapReduce::identity_reduce().to_string(),
            "function (key, values) { return values[0]; }"
        );
    }

    #[test]
    fn test_map_reduce_to_json_includes_out_action() {
        let mut spec = MapReduce::new(
            js::Func::new(vec![], vec![]),
            MapReduce::identity_reduce(),
        );
        spec.out = Some(OutAction::Reduce);
        let rendered = spec.to_json();
        assert_eq!(rendered["out"], json!("reduce"));
    }

    #[test]
    fn test_task_kind_names() {
        let task = WorkflowTask::Read(Collection::new("c"));
        assert_eq!(task.kind(), "Read");
    }
}
