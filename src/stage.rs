//! # Pipeline Stages
//!
//! Per-stage value objects for the native aggregation runtime. Each stage is
//! a pure description: project, match, redact, limit, skip, unwind, sort,
//! group, geo-near. Stages rewrite their embedded references with
//! `rewrite_refs` and render to the native JSON stage syntax with `to_json`.

use serde_json::{json, Value};

use crate::expr::{DocVar, Expression, Grouped};
use crate::reshape::{FieldValue, Reshape};
use crate::selector::Selector;

/// Sort direction for one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum SortDir {
    Ascending,
    Descending,
}

impl SortDir {
    fn to_json(self) -> Value {
        match self {
            SortDir::Ascending => json!(1),
            SortDir::Descending => json!(-1),
        }
    }
}

/// Geo-near stage description.
///
/// Geo-near must be the first stage after the source, which is why the op
/// layer hoists it below every other pipeline op at construction time.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GeoNear {
    /// Query point coordinates
    pub near: (f64, f64),
    /// Output field receiving the computed distance
    pub distance_field: DocVar,
    pub limit: Option<u64>,
    pub max_distance: Option<f64>,
    /// Additional selector applied to candidate documents
    pub query: Option<Selector>,
    pub spherical: bool,
    pub distance_multiplier: Option<f64>,
    /// Output field receiving the matched location
    pub include_locs: Option<DocVar>,
    pub unique_docs: bool,
}

impl GeoNear {
    pub fn new(near: (f64, f64), distance_field: DocVar) -> Self {
        GeoNear {
            near,
            distance_field,
            limit: None,
            max_distance: None,
            query: None,
            spherical: false,
            distance_multiplier: None,
            include_locs: None,
            unique_docs: true,
        }
    }

    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> GeoNear {
        let GeoNear {
            near,
            distance_field,
            limit,
            max_distance,
            query,
            spherical,
            distance_multiplier,
            include_locs,
            unique_docs,
        } = self;
        GeoNear {
            near,
            distance_field: f(&distance_field).unwrap_or(distance_field),
            limit,
            max_distance,
            query: query.map(|q| q.rewrite_refs(f)),
            spherical,
            distance_multiplier,
            include_locs: include_locs.map(|locs| f(&locs).unwrap_or(locs)),
            unique_docs,
        }
    }

    pub fn collect_refs(&self, acc: &mut Vec<DocVar>) {
        acc.push(self.distance_field.clone());
        if let Some(query) = &self.query {
            query.collect_refs(acc);
        }
        if let Some(locs) = &self.include_locs {
            acc.push(locs.clone());
        }
    }

    pub fn to_json(&self) -> Value {
        let mut doc = serde_json::Map::new();
        doc.insert("near".to_string(), json!([self.near.0, self.near.1]));
        doc.insert(
            "distanceField".to_string(),
            Value::String(self.distance_field.key()),
        );
        if let Some(limit) = self.limit {
            doc.insert("limit".to_string(), json!(limit));
        }
        if let Some(max) = self.max_distance {
            doc.insert("maxDistance".to_string(), json!(max));
        }
        if let Some(query) = &self.query {
            doc.insert("query".to_string(), query.to_json());
        }
        doc.insert("spherical".to_string(), json!(self.spherical));
        if let Some(mult) = self.distance_multiplier {
            doc.insert("distanceMultiplier".to_string(), json!(mult));
        }
        if let Some(locs) = &self.include_locs {
            doc.insert("includeLocs".to_string(), Value::String(locs.key()));
        }
        doc.insert("uniqueDocs".to_string(), json!(self.unique_docs));
        Value::Object(doc)
    }
}

/// One native aggregation stage.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum PipelineStage {
    Project(Reshape),
    Match(Selector),
    Redact(Expression),
    Limit(u64),
    Skip(u64),
    Unwind(DocVar),
    /// Non-empty list of sort keys
    Sort(Vec<(DocVar, SortDir)>),
    Group { grouped: Grouped, by: FieldValue },
    GeoNear(GeoNear),
}

impl PipelineStage {
    /// Apply a partial field-path substitution to every embedded reference.
    /// The stage kind is always preserved.
    pub fn rewrite_refs(self, f: &impl Fn(&DocVar) -> Option<DocVar>) -> PipelineStage {
        match self {
            PipelineStage::Project(shape) => PipelineStage::Project(shape.rewrite_refs(f)),
            PipelineStage::Match(sel) => PipelineStage::Match(sel.rewrite_refs(f)),
            PipelineStage::Redact(expr) => PipelineStage::Redact(expr.rewrite_refs(f)),
            PipelineStage::Limit(n) => PipelineStage::Limit(n),
            PipelineStage::Skip(n) => PipelineStage::Skip(n),
            PipelineStage::Unwind(field) => {
                PipelineStage::Unwind(f(&field).unwrap_or(field))
            }
            PipelineStage::Sort(keys) => PipelineStage::Sort(
                keys.into_iter()
                    .map(|(k, dir)| (f(&k).unwrap_or(k), dir))
                    .collect(),
            ),
            PipelineStage::Group { grouped, by } => PipelineStage::Group {
                grouped: grouped.rewrite_refs(f),
                by: by.rewrite_refs(f),
            },
            PipelineStage::GeoNear(geo) => PipelineStage::GeoNear(geo.rewrite_refs(f)),
        }
    }

    /// Collect every embedded reference into `acc`.
    pub fn collect_refs(&self, acc: &mut Vec<DocVar>) {
        match self {
            PipelineStage::Project(shape) => shape.collect_refs(acc),
            PipelineStage::Match(sel) => sel.collect_refs(acc),
            PipelineStage::Redact(expr) => expr.collect_refs(acc),
            PipelineStage::Limit(_) | PipelineStage::Skip(_) => {}
            PipelineStage::Unwind(field) => acc.push(field.clone()),
            PipelineStage::Sort(keys) => {
                for (k, _) in keys {
                    acc.push(k.clone());
                }
            }
            PipelineStage::Group { grouped, by } => {
                grouped.collect_refs(acc);
                by.collect_refs(acc);
            }
            PipelineStage::GeoNear(geo) => geo.collect_refs(acc),
        }
    }

    /// Render in native stage syntax.
    pub fn to_json(&self) -> Value {
        match self {
            PipelineStage::Project(shape) => json!({ "$project": shape.to_json() }),
            PipelineStage::Match(sel) => json!({ "$match": sel.to_json() }),
            PipelineStage::Redact(expr) => json!({ "$redact": expr.to_json() }),
            PipelineStage::Limit(n) => json!({ "$limit": n }),
            PipelineStage::Skip(n) => json!({ "$skip": n }),
            PipelineStage::Unwind(field) => json!({ "$unwind": field.to_string() }),
            PipelineStage::Sort(keys) => {
                let mut doc = serde_json::Map::new();
                for (k, dir) in keys {
                    doc.insert(k.key(), dir.to_json());
                }
                json!({ "$sort": Value::Object(doc) })
            }
            PipelineStage::Group { grouped, by } => {
                let mut doc = serde_json::Map::new();
                doc.insert("_id".to_string(), by.to_json());
                if let Value::Object(fields) = grouped.to_json() {
                    for (name, value) in fields {
                        doc.insert(name, value);
                    }
                }
                json!({ "$group": Value::Object(doc) })
            }
            PipelineStage::GeoNear(geo) => json!({ "$geoNear": geo.to_json() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::GroupOp;

    #[test]
    fn test_match_stage_rendering() {
        let stage = PipelineStage::Match(Selector::eq("x", json!(1)));
        assert_eq!(stage.to_json(), json!({ "$match": { "x": 1 } }));
    }

    #[test]
    fn test_sort_stage_preserves_key_order() {
        let stage = PipelineStage::Sort(vec![
            (DocVar::field("z"), SortDir::Descending),
            (DocVar::field("a"), SortDir::Ascending),
        ]);
        let rendered = serde_json::to_string(&stage.to_json()).expect("serializable");
        assert_eq!(rendered, r#"{"$sort":{"z":-1,"a":1}}"#);
    }

    #[test]
    fn test_group_stage_rendering() {
        let stage = PipelineStage::Group {
            grouped: Grouped::new(vec![(
                "total".to_string(),
                GroupOp::Sum(Box::new(Expression::field("amount"))),
            )]),
            by: FieldValue::Expr(Expression::field("city")),
        };
        assert_eq!(
            stage.to_json(),
            json!({ "$group": { "_id": "$city", "total": { "$sum": "$amount" } } })
        );
    }

    #[test]
    fn test_stage_rewrite_preserves_kind() {
        let base = DocVar::field("lEft");
        let stage = PipelineStage::Unwind(DocVar::field("items"));
        let rewritten = stage.rewrite_refs(&|v| Some(base.concat(v)));
        assert_eq!(
            rewritten,
            PipelineStage::Unwind(DocVar::field("lEft").child("items"))
        );
    }

    #[test]
    fn test_geo_near_rendering_includes_optionals() {
        let mut geo = GeoNear::new((1.5, 2.5), DocVar::field("dist"));
        geo.limit = Some(50);
        geo.query = Some(Selector::eq("kind", json!("cafe")));
        let rendered = PipelineStage::GeoNear(geo).to_json();
        assert_eq!(
            rendered,
            json!({ "$geoNear": {
                "near": [1.5, 2.5],
                "distanceField": "dist",
                "limit": 50,
                "query": { "kind": "cafe" },
                "spherical": false,
                "uniqueDocs": true,
            } })
        );
    }
}
