//! Run reports, parquet snapshots with a hashed manifest, and the daily markdown digest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use rodp_core::{
    CategoryMetrics, CompleteOrderLine, DailyRevenueByCategory, TopSellingItem,
    CATEGORY_METRICS_TABLE, COMPLETE_ORDERS_TABLE, DAILY_REVENUE_TABLE, TOP_SELLING_ITEMS_TABLE,
};
use rodp_transform::QualityReport;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::summary::RunSummary;

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const QUALITY_REPORT_FILE: &str = "quality_report.json";

/// The four output tables of a run, as exported.
#[derive(Debug, Clone, Copy)]
pub struct OutputTables<'a> {
    pub complete_orders: &'a [CompleteOrderLine],
    pub daily_revenue: &'a [DailyRevenueByCategory],
    pub top_items: &'a [TopSellingItem],
    pub category_metrics: &'a [CategoryMetrics],
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `run_summary.json` (and `quality_report.json` when present) under `run_dir`.
pub async fn write_run_report(
    run_dir: &Path,
    summary: &RunSummary,
    quality: Option<&QualityReport>,
) -> Result<PathBuf> {
    fs::create_dir_all(run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let summary_path = run_dir.join(RUN_SUMMARY_FILE);
    fs::write(&summary_path, bytes)
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    if let Some(quality) = quality {
        let bytes = serde_json::to_vec_pretty(quality).context("serializing quality report")?;
        let path = run_dir.join(QUALITY_REPORT_FILE);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }
    info!(path = %summary_path.display(), "wrote run summary");
    Ok(summary_path)
}

/// Writes one parquet file per output table into `<run_dir>/snapshots` plus `manifest.json`.
pub async fn export_parquet_snapshots(run_dir: &Path, tables: OutputTables<'_>) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let complete_path = snapshot_dir.join(format!("{COMPLETE_ORDERS_TABLE}.parquet"));
    let daily_path = snapshot_dir.join(format!("{DAILY_REVENUE_TABLE}.parquet"));
    let top_path = snapshot_dir.join(format!("{TOP_SELLING_ITEMS_TABLE}.parquet"));
    let metrics_path = snapshot_dir.join(format!("{CATEGORY_METRICS_TABLE}.parquet"));

    write_complete_orders_parquet(&complete_path, tables.complete_orders)?;
    write_daily_revenue_parquet(&daily_path, tables.daily_revenue)?;
    write_top_items_parquet(&top_path, tables.top_items)?;
    write_category_metrics_parquet(&metrics_path, tables.category_metrics)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry(COMPLETE_ORDERS_TABLE, run_dir, &complete_path)?,
            manifest_entry(DAILY_REVENUE_TABLE, run_dir, &daily_path)?,
            manifest_entry(TOP_SELLING_ITEMS_TABLE, run_dir, &top_path)?,
            manifest_entry(CATEGORY_METRICS_TABLE, run_dir, &metrics_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(path = %manifest_path.display(), "exported parquet snapshots");
    Ok(manifest_path)
}

/// Renders the most recent `runs` run summaries under `reports_dir` as markdown.
pub fn report_daily_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join(RUN_SUMMARY_FILE).exists())
        .map(|entry| {
            let path = entry.path().join(RUN_SUMMARY_FILE);
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok((entry.path(), value))
        })
        .collect::<Result<Vec<_>>>()?;
    dirs.sort_by(|a, b| {
        let started = |v: &serde_json::Value| {
            v.get("started_at")
                .and_then(|s| s.as_str())
                .map(str::to_string)
        };
        started(&b.1).cmp(&started(&a.1))
    });

    let mut lines = vec!["# Restaurant Order Pipeline Report".to_string(), String::new()];
    for (dir, summary) in dirs.into_iter().take(runs.max(1)) {
        let field = |name: &str| {
            summary
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string()
        };
        let transformation = summary.pointer("/stages/transformation");
        let count = |name: &str| {
            transformation
                .and_then(|t| t.get(name))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };

        lines.push(format!("## Run `{}`", field("run_id")));
        lines.push(format!("- status: {}", field("status")));
        lines.push(format!("- mode: {}", field("mode")));
        lines.push(format!("- started: {}", field("started_at")));
        if let Some(message) = summary.get("message").and_then(|v| v.as_str()) {
            lines.push(format!("- message: {message}"));
        }
        if let Some(error) = summary.get("error").and_then(|v| v.as_str()) {
            lines.push(format!("- error: {error}"));
        }
        if transformation.is_some() {
            lines.push(format!("- complete orders: {}", count("complete_orders")));
            lines.push(format!("- daily revenue rows: {}", count("daily_revenue")));
            lines.push(format!("- top items: {}", count("top_items")));
            lines.push(format!("- categories: {}", count("category_metrics")));
            lines.push(format!("- total discrepancies: {}", count("total_discrepancies")));
        }
        if let Some(issues) = summary
            .pointer("/stages/quality_check/issues_found")
            .and_then(|v| v.as_u64())
        {
            lines.push(format!("- quality issues: {issues}"));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_complete_orders_parquet(path: &Path, rows: &[CompleteOrderLine]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("order_id", DataType::Int64, false),
        ArrowField::new("customer_id", DataType::Utf8, true),
        ArrowField::new("order_date", DataType::Utf8, false),
        ArrowField::new("item_id", DataType::Utf8, false),
        ArrowField::new("item_name", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("quantity", DataType::Int64, false),
        ArrowField::new("unit_price", DataType::Float64, false),
        ArrowField::new("item_revenue", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(rows.iter().map(|r| r.order_id).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.customer_id.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.order_date.format("%Y-%m-%d").to_string())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r.item_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.item_name.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| r.category.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.quantity).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.unit_price).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.item_revenue).collect::<Vec<_>>())),
        ],
    )
    .context("building complete orders record batch")?;
    write_parquet(path, batch)
}

fn write_daily_revenue_parquet(path: &Path, rows: &[DailyRevenueByCategory]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("total_revenue", DataType::Float64, false),
        ArrowField::new("order_count", DataType::Int64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|r| r.date.format("%Y-%m-%d").to_string())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r.category.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.total_revenue).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.order_count).collect::<Vec<_>>())),
        ],
    )
    .context("building daily revenue record batch")?;
    write_parquet(path, batch)
}

fn write_top_items_parquet(path: &Path, rows: &[TopSellingItem]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("item_id", DataType::Utf8, false),
        ArrowField::new("item_name", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("total_quantity_sold", DataType::Int64, false),
        ArrowField::new("total_revenue", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r.item_id.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r.item_name.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r.category.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.total_quantity_sold).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.total_revenue).collect::<Vec<_>>())),
        ],
    )
    .context("building top items record batch")?;
    write_parquet(path, batch)
}

fn write_category_metrics_parquet(path: &Path, rows: &[CategoryMetrics]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("order_count", DataType::Int64, false),
        ArrowField::new("total_revenue", DataType::Float64, false),
        ArrowField::new("total_items_sold", DataType::Int64, false),
        ArrowField::new("unique_items_count", DataType::Int64, false),
        ArrowField::new("avg_revenue_per_order", DataType::Float64, false),
        ArrowField::new("avg_items_per_order", DataType::Float64, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                rows.iter().map(|r| Some(r.category.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.order_count).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.total_revenue).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.total_items_sold).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.unique_items_count).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.avg_revenue_per_order).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.avg_items_per_order).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building category metrics record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn daily() -> Vec<DailyRevenueByCategory> {
        vec![DailyRevenueByCategory {
            date: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            category: "Food".into(),
            total_revenue: 20.0,
            order_count: 1,
        }]
    }

    #[tokio::test]
    async fn parquet_manifest_hashes_every_table() {
        let dir = tempfile::tempdir().unwrap();
        let daily = daily();
        let tables = OutputTables {
            complete_orders: &[],
            daily_revenue: &daily,
            top_items: &[],
            category_metrics: &[],
        };
        let manifest_path = export_parquet_snapshots(dir.path(), tables).await.unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 4);
        for file in files {
            assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
            assert!(file["bytes"].as_u64().unwrap() > 0);
            assert!(file["path"].as_str().unwrap().starts_with("snapshots"));
        }
    }

    #[test]
    fn markdown_report_lists_newest_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        for (name, started) in [("a", "2024-01-01T00:00:00Z"), ("b", "2024-01-02T00:00:00Z")] {
            let run_dir = dir.path().join(name);
            std::fs::create_dir_all(&run_dir).unwrap();
            let summary = serde_json::json!({
                "run_id": name,
                "status": "success",
                "mode": "full",
                "started_at": started,
                "message": null,
                "error": null,
                "stages": { "transformation": { "complete_orders": 2, "total_discrepancies": 0 } }
            });
            std::fs::write(run_dir.join(RUN_SUMMARY_FILE), summary.to_string()).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("stray")).unwrap();

        let markdown = report_daily_markdown(5, dir.path()).unwrap();
        let newest = markdown.find("## Run `b`").unwrap();
        let oldest = markdown.find("## Run `a`").unwrap();
        assert!(newest < oldest);
        assert!(markdown.contains("- complete orders: 2"));

        let only_one = report_daily_markdown(1, dir.path()).unwrap();
        assert!(!only_one.contains("## Run `a`"));
    }
}
