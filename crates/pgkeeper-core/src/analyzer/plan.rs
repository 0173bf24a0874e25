//! EXPLAIN (FORMAT JSON) parsing and plan heuristics.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A sequential scan returning more rows than this is worth an index.
pub const SEQ_SCAN_ROWS_WARN: f64 = 1000.0;
/// Actual/estimated row ratio above this (or below its inverse) means stale statistics.
pub const ROW_ESTIMATE_RATIO_WARN: f64 = 10.0;
/// Execution time above this many milliseconds is reported as slow.
pub const SLOW_EXECUTION_MS: f64 = 100.0;
/// More nested loops than this usually means a missing join index.
pub const NESTED_LOOPS_WARN: u32 = 3;

/// One node of the plan tree, as emitted by `EXPLAIN (FORMAT JSON)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExplainPlanNode {
    #[serde(rename = "Node Type")]
    pub node_type: String,
    #[serde(rename = "Relation Name", default, skip_serializing_if = "Option::is_none")]
    pub relation_name: Option<String>,
    #[serde(rename = "Index Name", default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(rename = "Startup Cost", default)]
    pub startup_cost: f64,
    #[serde(rename = "Total Cost", default)]
    pub total_cost: f64,
    #[serde(rename = "Plan Rows", default)]
    pub plan_rows: f64,
    #[serde(rename = "Plan Width", default)]
    pub plan_width: i64,
    #[serde(rename = "Actual Startup Time", default)]
    pub actual_startup_time: f64,
    #[serde(rename = "Actual Total Time", default)]
    pub actual_total_time: f64,
    #[serde(rename = "Actual Rows", default)]
    pub actual_rows: f64,
    #[serde(rename = "Actual Loops", default)]
    pub actual_loops: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(rename = "Index Cond", default, skip_serializing_if = "Option::is_none")]
    pub index_cond: Option<String>,
    #[serde(rename = "Plans", default, skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<ExplainPlanNode>,
}

/// Top-level object of the `QUERY PLAN` array.
#[derive(Debug, Deserialize)]
struct ExplainOutput {
    #[serde(rename = "Plan")]
    plan: ExplainPlanNode,
    #[serde(rename = "Planning Time", default)]
    planning_time: f64,
    #[serde(rename = "Execution Time", default)]
    execution_time: f64,
}

/// Aggregate metrics over the whole plan tree.
///
/// Row counts are summed over every node, so joins are over-counted; treat
/// them as a rough magnitude, not a physical row count.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlanMetrics {
    pub planning_time_ms: f64,
    pub execution_time_ms: f64,
    /// Highest `Total Cost` of any node.
    pub total_cost: f64,
    pub actual_rows: f64,
    pub estimated_rows: f64,
    pub seq_scans: u32,
    pub index_scans: u32,
    pub sorts: u32,
    pub hash_joins: u32,
    pub nested_loops: u32,
}

/// A parsed execution plan.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExplainPlan {
    pub query: String,
    pub metrics: PlanMetrics,
    pub warnings: Vec<String>,
    pub plan: ExplainPlanNode,
}

impl ExplainPlan {
    /// Parses the `QUERY PLAN` column of `EXPLAIN (..., FORMAT JSON)`.
    ///
    /// The server returns an array holding a single object; some drivers hand
    /// the column back as text, so a JSON string is accepted too.
    pub fn from_json(query: &str, json: &serde_json::Value) -> Result<Self, Error> {
        let parsed;
        let json = match json {
            serde_json::Value::String(s) => {
                parsed = serde_json::from_str::<serde_json::Value>(s)
                    .map_err(|e| Error::PlanParse(e.to_string()))?;
                &parsed
            }
            other => other,
        };

        let first = match json {
            serde_json::Value::Array(items) => items
                .first()
                .ok_or_else(|| Error::PlanParse("empty plan array".to_string()))?,
            serde_json::Value::Object(_) => json,
            _ => return Err(Error::PlanParse("expected array".to_string())),
        };

        let output: ExplainOutput =
            serde_json::from_value(first.clone()).map_err(|e| Error::PlanParse(e.to_string()))?;

        Ok(Self::from_tree(
            query,
            output.plan,
            output.planning_time,
            output.execution_time,
        ))
    }

    /// Builds metrics and warnings for an already parsed tree.
    pub fn from_tree(
        query: &str,
        plan: ExplainPlanNode,
        planning_time_ms: f64,
        execution_time_ms: f64,
    ) -> Self {
        let mut metrics = PlanMetrics {
            planning_time_ms,
            execution_time_ms,
            ..Default::default()
        };
        walk(&plan, &mut metrics);
        let warnings = warnings_for(&metrics);
        Self {
            query: query.to_string(),
            metrics,
            warnings,
            plan,
        }
    }

    /// Relations read by a sequential scan anywhere in the tree.
    pub fn seq_scanned_relations(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_seq_scans(&self.plan, &mut out);
        out
    }
}

fn walk(node: &ExplainPlanNode, m: &mut PlanMetrics) {
    let t = node.node_type.as_str();
    if t.contains("Seq Scan") {
        m.seq_scans += 1;
    }
    if t.contains("Index") {
        m.index_scans += 1;
    }
    if t.contains("Sort") {
        m.sorts += 1;
    }
    if t.contains("Hash Join") {
        m.hash_joins += 1;
    }
    if t.contains("Nested Loop") {
        m.nested_loops += 1;
    }

    if node.total_cost > m.total_cost {
        m.total_cost = node.total_cost;
    }
    m.actual_rows += node.actual_rows;
    m.estimated_rows += node.plan_rows;

    for child in &node.plans {
        walk(child, m);
    }
}

fn collect_seq_scans<'a>(node: &'a ExplainPlanNode, out: &mut Vec<&'a str>) {
    if node.node_type.contains("Seq Scan")
        && let Some(rel) = node.relation_name.as_deref()
    {
        out.push(rel);
    }
    for child in &node.plans {
        collect_seq_scans(child, out);
    }
}

/// Heuristic warnings for a set of plan metrics.
pub fn warnings_for(m: &PlanMetrics) -> Vec<String> {
    let mut warnings = Vec::new();

    if m.seq_scans > 0 && m.actual_rows > SEQ_SCAN_ROWS_WARN {
        warnings.push(format!(
            "sequential scan returned {} rows, consider an index",
            m.actual_rows
        ));
    }

    if m.estimated_rows > 0.0 {
        let ratio = m.actual_rows / m.estimated_rows;
        if ratio > ROW_ESTIMATE_RATIO_WARN || ratio < 1.0 / ROW_ESTIMATE_RATIO_WARN {
            warnings.push(format!(
                "row estimation off by {:.2}x, run ANALYZE",
                ratio
            ));
        }
    }

    if m.execution_time_ms > SLOW_EXECUTION_MS {
        warnings.push(format!(
            "slow execution time: {:.2} ms",
            m.execution_time_ms
        ));
    }

    if m.nested_loops > NESTED_LOOPS_WARN {
        warnings.push(format!(
            "multiple nested loops ({}) may indicate missing indexes",
            m.nested_loops
        ));
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(node_type: &str, cost: f64, plan_rows: f64, actual_rows: f64) -> ExplainPlanNode {
        ExplainPlanNode {
            node_type: node_type.to_string(),
            total_cost: cost,
            plan_rows,
            actual_rows,
            ..Default::default()
        }
    }

    #[test]
    fn parses_server_output_and_counts_node_types() {
        let raw = json!([{
            "Plan": {
                "Node Type": "Hash Join",
                "Total Cost": 250.5,
                "Plan Rows": 100,
                "Actual Rows": 90,
                "Plans": [
                    {
                        "Node Type": "Seq Scan",
                        "Relation Name": "orders",
                        "Total Cost": 120.0,
                        "Plan Rows": 1000,
                        "Actual Rows": 1000,
                        "Filter": "(status = 'paid'::text)"
                    },
                    {
                        "Node Type": "Hash",
                        "Total Cost": 80.0,
                        "Plan Rows": 50,
                        "Actual Rows": 50,
                        "Plans": [{
                            "Node Type": "Index Scan",
                            "Relation Name": "customers",
                            "Index Name": "customers_pkey",
                            "Total Cost": 79.0,
                            "Plan Rows": 50,
                            "Actual Rows": 50
                        }]
                    }
                ]
            },
            "Planning Time": 0.4,
            "Execution Time": 12.5
        }]);

        let plan = ExplainPlan::from_json("SELECT 1", &raw).unwrap();
        let m = &plan.metrics;
        assert_eq!(m.total_cost, 250.5);
        assert_eq!(m.seq_scans, 1);
        assert_eq!(m.index_scans, 1);
        assert_eq!(m.hash_joins, 1);
        assert_eq!(m.actual_rows, 90.0 + 1000.0 + 50.0 + 50.0);
        assert_eq!(m.estimated_rows, 100.0 + 1000.0 + 50.0 + 50.0);
        assert_eq!(m.planning_time_ms, 0.4);
        assert_eq!(m.execution_time_ms, 12.5);
        assert_eq!(plan.seq_scanned_relations(), vec!["orders"]);
        assert_eq!(
            plan.plan.plans[0].filter.as_deref(),
            Some("(status = 'paid'::text)")
        );
    }

    #[test]
    fn accepts_plan_as_json_text() {
        let raw = serde_json::Value::String(
            r#"[{"Plan": {"Node Type": "Result", "Total Cost": 0.01}, "Execution Time": 0.02}]"#
                .to_string(),
        );
        let plan = ExplainPlan::from_json("SELECT 1", &raw).unwrap();
        assert_eq!(plan.plan.node_type, "Result");
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn rejects_empty_and_malformed_output() {
        assert!(matches!(
            ExplainPlan::from_json("q", &json!([])),
            Err(Error::PlanParse(_))
        ));
        assert!(matches!(
            ExplainPlan::from_json("q", &json!(42)),
            Err(Error::PlanParse(_))
        ));
        assert!(matches!(
            ExplainPlan::from_json("q", &json!([{"Planning Time": 1.0}])),
            Err(Error::PlanParse(_))
        ));
    }

    #[test]
    fn seq_scan_over_many_rows_warns_with_row_count() {
        let plan = ExplainPlan::from_tree("q", node("Seq Scan", 10.0, 5000.0, 5000.0), 0.1, 1.0);
        assert_eq!(plan.metrics.seq_scans, 1);
        assert!(
            plan.warnings
                .iter()
                .any(|w| w.contains("sequential scan") && w.contains("5000"))
        );
    }

    #[test]
    fn small_seq_scan_does_not_warn() {
        let plan = ExplainPlan::from_tree("q", node("Seq Scan", 10.0, 1000.0, 1000.0), 0.1, 1.0);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn row_misestimate_warns_in_both_directions() {
        let under = ExplainPlan::from_tree("q", node("Index Scan", 1.0, 10.0, 1000.0), 0.0, 1.0);
        assert!(under.warnings.iter().any(|w| w.contains("row estimation off by 100.00x")));

        let over = ExplainPlan::from_tree("q", node("Index Scan", 1.0, 1000.0, 10.0), 0.0, 1.0);
        assert!(over.warnings.iter().any(|w| w.contains("row estimation off by 0.01x")));

        let fine = ExplainPlan::from_tree("q", node("Index Scan", 1.0, 100.0, 500.0), 0.0, 1.0);
        assert!(fine.warnings.is_empty());
    }

    #[test]
    fn zero_estimate_skips_ratio_check() {
        let plan = ExplainPlan::from_tree("q", node("Result", 0.0, 0.0, 50.0), 0.0, 1.0);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn slow_execution_warns_with_duration() {
        let plan = ExplainPlan::from_tree("q", node("Result", 0.0, 1.0, 1.0), 0.0, 150.0);
        assert!(
            plan.warnings
                .iter()
                .any(|w| w.contains("slow execution time") && w.contains("150"))
        );
    }

    #[test]
    fn more_than_three_nested_loops_warns() {
        let mut root = node("Nested Loop", 1.0, 1.0, 1.0);
        let mut cur = &mut root;
        for _ in 0..3 {
            cur.plans.push(node("Nested Loop", 1.0, 1.0, 1.0));
            cur = &mut cur.plans[0];
        }
        let plan = ExplainPlan::from_tree("q", root, 0.0, 1.0);
        assert_eq!(plan.metrics.nested_loops, 4);
        assert!(plan.warnings.iter().any(|w| w.contains("nested loops (4)")));
    }

    #[test]
    fn total_cost_is_maximum_not_sum() {
        let mut root = node("Sort", 40.0, 1.0, 1.0);
        root.plans.push(node("Seq Scan", 90.0, 1.0, 1.0));
        let plan = ExplainPlan::from_tree("q", root, 0.0, 1.0);
        assert_eq!(plan.metrics.total_cost, 90.0);
        assert_eq!(plan.metrics.sorts, 1);
    }
}
