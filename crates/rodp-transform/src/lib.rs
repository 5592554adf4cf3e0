//! Quality-checked incremental transform core.
//!
//! Every function here takes and returns plain data: staging tables in, fixed tables,
//! fact rows, aggregates, and reports out. Nothing reads configuration or touches storage.

pub mod incremental;
pub mod join;
pub mod metrics;
pub mod quality;

pub use incremental::{
    decide_mode, filter_since_watermark, merge_category_metrics, merge_daily_revenue,
    merge_top_items, MergePolicy, ModeDecision, RunMode,
};
pub use join::{
    audit_relationships, join_order_data, parse_order_date, JoinDiagnostics, JoinOutput,
    RelationshipAudit,
};
pub use metrics::{
    calculate_category_metrics, calculate_daily_revenue_by_category, compute_aggregates,
    identify_top_selling_items, verify_totals, Aggregates, MetricsError, TotalsReport,
};
pub use quality::{
    apply_fixes, run_quality_checks, FixOptions, FixOutcome, OrphanFixScope, QualityReport,
};

pub const CRATE_NAME: &str = "rodp-transform";

/// Upper bound on examples carried in reports and logs.
pub const SAMPLE_LIMIT: usize = 10;
