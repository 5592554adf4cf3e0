//! Serialized record of one pipeline run.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rodp_adapters::SourceLoadReport;
use rodp_storage::WriteMode;
use rodp_transform::quality::FixSummary;
use rodp_transform::{JoinDiagnostics, MergePolicy, RelationshipAudit, RunMode};
use serde::Serialize;
use uuid::Uuid;

pub const NO_NEW_DATA_MESSAGE: &str = "No new data to process";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub message: Option<String>,
    pub error: Option<String>,
    pub reports_dir: Option<String>,
    pub stages: StageReports,
}

impl RunSummary {
    pub fn started(run_id: Uuid, mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Success,
            mode,
            started_at,
            finished_at: started_at,
            duration_secs: 0.0,
            message: None,
            error: None,
            reports_dir: None,
            stages: StageReports::default(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReports {
    pub ingestion: Option<IngestionStage>,
    pub quality_check: Option<QualityStage>,
    pub transformation: Option<TransformationStage>,
    pub loading: Option<LoadingStage>,
    pub export: Option<ExportStage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionStage {
    pub duration_secs: f64,
    pub requested_mode: RunMode,
    pub degraded_to_full: bool,
    pub watermark: Option<NaiveDate>,
    pub sources: BTreeMap<String, SourceLoadReport>,
    pub staging_rows_written: BTreeMap<String, usize>,
    /// Rows handed to the next stage, after watermark filtering.
    pub rows: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityStage {
    pub duration_secs: f64,
    pub issues_found: usize,
    pub fixes_applied: bool,
    pub fix_summary: Option<FixSummary>,
    pub relationships: RelationshipAudit,
    pub rows_after_fixes: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformationStage {
    pub duration_secs: f64,
    pub complete_orders: usize,
    pub daily_revenue: usize,
    pub top_items: usize,
    pub category_metrics: usize,
    pub join: JoinDiagnostics,
    pub join_error: Option<String>,
    pub totals_column: Option<String>,
    pub totals_compared: usize,
    pub total_discrepancies: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableWrite {
    pub mode: WriteMode,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadingStage {
    pub duration_secs: f64,
    /// Set for incremental runs.
    pub merge_policy: Option<MergePolicy>,
    pub tables: BTreeMap<String, TableWrite>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportStage {
    pub duration_secs: f64,
    pub csv_files: Vec<String>,
    pub parquet_manifest: Option<String>,
}
