//! Staged pipeline runner: ingestion, quality, transformation, loading, and export.

pub mod config;
pub mod report;
pub mod summary;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rodp_adapters::{
    export_csv, load_staging, CsvDirectorySource, HeuristicColumnLocator, StagingSource,
};
use rodp_core::{
    CategoryMetrics, CompleteOrderLine, DailyRevenueByCategory, Entity, StagingData, TopSellingItem,
    CATEGORY_METRICS_TABLE, COMPLETE_ORDERS_TABLE, DAILY_REVENUE_TABLE, TOP_SELLING_ITEMS_TABLE,
};
use rodp_storage::{DatabaseConfig, PgWarehouse, Warehouse, WriteMode};
use rodp_transform::{
    apply_fixes, audit_relationships, compute_aggregates, decide_mode, filter_since_watermark,
    join_order_data, merge_category_metrics, merge_daily_revenue, merge_top_items,
    run_quality_checks, verify_totals, FixOptions, ModeDecision, QualityReport, RunMode,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::{PipelineConfig, PipelineOptions, RunOverrides};
use crate::report::{export_parquet_snapshots, write_run_report, OutputTables};
use crate::summary::{
    ExportStage, IngestionStage, LoadingStage, QualityStage, RunStatus, RunSummary, TableWrite,
    TransformationStage, NO_NEW_DATA_MESSAGE,
};

pub use crate::config::DEFAULT_CONFIG_PATH;

pub const CRATE_NAME: &str = "rodp-pipeline";

/// Output rows of one run as they were persisted.
#[derive(Debug, Clone, Default)]
struct RunOutputs {
    complete_orders: Vec<CompleteOrderLine>,
    daily_revenue: Vec<DailyRevenueByCategory>,
    top_items: Vec<TopSellingItem>,
    category_metrics: Vec<CategoryMetrics>,
}

impl RunOutputs {
    fn tables(&self) -> OutputTables<'_> {
        OutputTables {
            complete_orders: &self.complete_orders,
            daily_revenue: &self.daily_revenue,
            top_items: &self.top_items,
            category_metrics: &self.category_metrics,
        }
    }
}

pub struct PipelineRunner {
    config: PipelineConfig,
    warehouse: Arc<dyn Warehouse>,
    source: Arc<dyn StagingSource>,
}

impl PipelineRunner {
    /// Reads sources from the configured input directory.
    pub fn new(config: PipelineConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        let source =
            CsvDirectorySource::new(config.paths.input_dir.clone(), config.sources.clone());
        Self {
            config,
            warehouse,
            source: Arc::new(source),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn StagingSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs every stage once. Failures are recorded in the returned summary, never raised.
    pub async fn run(&self, overrides: &RunOverrides) -> RunSummary {
        let options = overrides.applied_to(&self.config.pipeline);
        let run = RunHandle::start(&self.config, &options);
        let mut summary = run.summary();
        let mut quality = None;

        info!(
            parent: &run.span,
            source = %self.source.describe(),
            warehouse = %self.warehouse.describe(),
            "starting pipeline run"
        );
        let outcome = self
            .execute(&options, &run.dir, &mut summary, &mut quality)
            .instrument(run.span.clone())
            .await;

        run.finish(summary, outcome, quality.as_ref()).await
    }

    async fn execute(
        &self,
        options: &PipelineOptions,
        run_dir: &Path,
        summary: &mut RunSummary,
        quality: &mut Option<QualityReport>,
    ) -> Result<()> {
        let Some(staging) = self
            .ingest(summary)
            .instrument(info_span!("ingestion"))
            .await
            .context("ingestion stage")?
        else {
            info!("{NO_NEW_DATA_MESSAGE}");
            summary.message = Some(NO_NEW_DATA_MESSAGE.to_string());
            return Ok(());
        };

        let staging = if options.quality_check {
            self.check_quality(staging, options, summary, quality)
        } else {
            info!("quality checks disabled");
            staging
        };

        let fresh = self.transform(&staging, summary).context("transformation stage")?;

        let outputs = self
            .load(fresh, options, summary)
            .instrument(info_span!("loading"))
            .await
            .context("loading stage")?;

        if options.export_csv || options.export_parquet {
            self.export(&outputs, options, run_dir, summary)
                .instrument(info_span!("export"))
                .await
                .context("export stage")?;
        }
        Ok(())
    }

    /// Returns `None` when an incremental run finds nothing past the watermark.
    async fn ingest(&self, summary: &mut RunSummary) -> Result<Option<StagingData>> {
        let clock = Instant::now();
        let requested = summary.mode;
        let loaded = load_staging(self.source.as_ref())?;

        let mut staging_rows_written = BTreeMap::new();
        for entity in Entity::ALL {
            let written = self
                .warehouse
                .replace_staging(entity, loaded.data.get(entity))
                .await
                .with_context(|| format!("reloading {}", entity.staging_table()))?;
            staging_rows_written.insert(entity.table_name().to_string(), written);
        }

        let watermark = match requested {
            RunMode::Incremental => self.warehouse.watermark().await.context("reading watermark")?,
            RunMode::Full => None,
        };
        let decision = decide_mode(requested, watermark);
        summary.mode = decision.mode();

        let staging = match decision {
            ModeDecision::Incremental { watermark } => {
                filter_since_watermark(&loaded.data, watermark)
            }
            ModeDecision::Full { .. } => Some(loaded.data),
        };

        summary.stages.ingestion = Some(IngestionStage {
            duration_secs: clock.elapsed().as_secs_f64(),
            requested_mode: requested,
            degraded_to_full: matches!(decision, ModeDecision::Full { degraded: true }),
            watermark: decision.watermark(),
            sources: loaded.reports,
            staging_rows_written,
            rows: staging.as_ref().map(StagingData::row_counts).unwrap_or_default(),
        });
        Ok(staging)
    }

    fn check_quality(
        &self,
        staging: StagingData,
        options: &PipelineOptions,
        summary: &mut RunSummary,
        quality: &mut Option<QualityReport>,
    ) -> StagingData {
        let _span = info_span!("quality_check").entered();
        let clock = Instant::now();

        let relationships = audit_relationships(&staging);
        if relationships.has_issues() {
            warn!("relationship audit found inconsistencies");
        }
        let report = run_quality_checks(&staging);

        let (staging, fix_summary) = if report.has_missing_values() {
            let outcome = apply_fixes(
                &staging,
                &report,
                &FixOptions {
                    orphan_scope: options.orphan_fix_scope,
                },
            );
            (outcome.data, Some(outcome.summary))
        } else {
            info!("no missing values; skipping fixes");
            (staging, None)
        };

        summary.stages.quality_check = Some(QualityStage {
            duration_secs: clock.elapsed().as_secs_f64(),
            issues_found: report.total_issues(),
            fixes_applied: fix_summary.is_some(),
            fix_summary,
            relationships,
            rows_after_fixes: staging.row_counts(),
        });
        *quality = Some(report);
        staging
    }

    fn transform(&self, staging: &StagingData, summary: &mut RunSummary) -> Result<RunOutputs> {
        let _span = info_span!("transformation").entered();
        let clock = Instant::now();

        let joined = join_order_data(staging);
        if let Some(err) = &joined.error {
            warn!(error = %err, "join produced no rows");
        }
        let aggregates = compute_aggregates(&joined.lines).context("computing aggregates")?;
        let totals = verify_totals(&staging.orders, &staging.order_items, &HeuristicColumnLocator);

        summary.stages.transformation = Some(TransformationStage {
            duration_secs: clock.elapsed().as_secs_f64(),
            complete_orders: joined.lines.len(),
            daily_revenue: aggregates.daily_revenue.len(),
            top_items: aggregates.top_items.len(),
            category_metrics: aggregates.category_metrics.len(),
            join: joined.diagnostics,
            join_error: joined.error,
            totals_column: totals.column_used.clone(),
            totals_compared: totals.comparisons.len(),
            total_discrepancies: totals.discrepancy_count(),
        });

        Ok(RunOutputs {
            complete_orders: joined.lines,
            daily_revenue: aggregates.daily_revenue,
            top_items: aggregates.top_items,
            category_metrics: aggregates.category_metrics,
        })
    }

    /// Persists `fresh` and returns the rows the targets now hold for this run's keys.
    async fn load(
        &self,
        fresh: RunOutputs,
        options: &PipelineOptions,
        summary: &mut RunSummary,
    ) -> Result<RunOutputs> {
        let clock = Instant::now();
        let warehouse = &self.warehouse;
        let mut tables = BTreeMap::new();

        let (outputs, merge_policy) = match summary.mode {
            RunMode::Full => {
                let mode = WriteMode::Replace;
                let rows = warehouse.write_complete_orders(&fresh.complete_orders, mode).await?;
                tables.insert(COMPLETE_ORDERS_TABLE.to_string(), TableWrite { mode, rows });
                let rows = warehouse.write_daily_revenue(&fresh.daily_revenue, mode).await?;
                tables.insert(DAILY_REVENUE_TABLE.to_string(), TableWrite { mode, rows });
                let rows = warehouse.write_top_items(&fresh.top_items, mode).await?;
                tables.insert(TOP_SELLING_ITEMS_TABLE.to_string(), TableWrite { mode, rows });
                let rows = warehouse.write_category_metrics(&fresh.category_metrics, mode).await?;
                tables.insert(CATEGORY_METRICS_TABLE.to_string(), TableWrite { mode, rows });
                (fresh, None)
            }
            RunMode::Incremental => {
                let policy = options.merge_policy;
                info!(?policy, "merging with persisted aggregates");

                let mode = WriteMode::Append;
                let rows = warehouse.write_complete_orders(&fresh.complete_orders, mode).await?;
                tables.insert(COMPLETE_ORDERS_TABLE.to_string(), TableWrite { mode, rows });

                let existing_daily = warehouse.load_daily_revenue().await?;
                let existing_top = warehouse.load_top_items().await?;
                let existing_metrics = warehouse.load_category_metrics().await?;

                let daily_revenue =
                    merge_daily_revenue(&existing_daily, &fresh.daily_revenue, policy);
                let top_items = merge_top_items(&existing_top, &fresh.top_items);
                let category_metrics = merge_category_metrics(
                    &existing_metrics,
                    &fresh.category_metrics,
                    policy,
                    &top_items,
                )
                .context("merging category metrics")?;

                let mode = WriteMode::Upsert;
                let rows = warehouse.write_daily_revenue(&daily_revenue, mode).await?;
                tables.insert(DAILY_REVENUE_TABLE.to_string(), TableWrite { mode, rows });
                let rows = warehouse.write_top_items(&top_items, mode).await?;
                tables.insert(TOP_SELLING_ITEMS_TABLE.to_string(), TableWrite { mode, rows });
                let rows = warehouse.write_category_metrics(&category_metrics, mode).await?;
                tables.insert(CATEGORY_METRICS_TABLE.to_string(), TableWrite { mode, rows });

                let outputs = RunOutputs {
                    complete_orders: fresh.complete_orders,
                    daily_revenue,
                    top_items,
                    category_metrics,
                };
                (outputs, Some(policy))
            }
        };

        summary.stages.loading = Some(LoadingStage {
            duration_secs: clock.elapsed().as_secs_f64(),
            merge_policy,
            tables,
        });
        Ok(outputs)
    }

    async fn export(
        &self,
        outputs: &RunOutputs,
        options: &PipelineOptions,
        run_dir: &Path,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let clock = Instant::now();
        let mut stage = ExportStage::default();

        if options.export_csv {
            let dir = &self.config.paths.output_dir;
            let top_items = match options.top_items_limit.filter(|n| *n > 0) {
                Some(limit) => &outputs.top_items[..limit.min(outputs.top_items.len())],
                None => &outputs.top_items[..],
            };
            let written: Vec<Option<PathBuf>> = vec![
                export_csv(dir, COMPLETE_ORDERS_TABLE, &outputs.complete_orders)?,
                export_csv(dir, DAILY_REVENUE_TABLE, &outputs.daily_revenue)?,
                export_csv(dir, TOP_SELLING_ITEMS_TABLE, top_items)?,
                export_csv(dir, CATEGORY_METRICS_TABLE, &outputs.category_metrics)?,
            ];
            stage.csv_files = written
                .into_iter()
                .flatten()
                .map(|path| path.display().to_string())
                .collect();
        }

        if options.export_parquet {
            let manifest = export_parquet_snapshots(run_dir, outputs.tables()).await?;
            stage.parquet_manifest = Some(manifest.display().to_string());
        }

        stage.duration_secs = clock.elapsed().as_secs_f64();
        summary.stages.export = Some(stage);
        Ok(())
    }
}

/// Identity, clock and report directory of one run, from start to its written summary.
struct RunHandle {
    run_id: Uuid,
    requested: RunMode,
    started_at: DateTime<Utc>,
    clock: Instant,
    dir: PathBuf,
    span: Span,
}

impl RunHandle {
    fn start(config: &PipelineConfig, options: &PipelineOptions) -> Self {
        let requested = if options.incremental {
            RunMode::Incremental
        } else {
            RunMode::Full
        };
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            requested,
            started_at: Utc::now(),
            clock: Instant::now(),
            dir: config.paths.reports_dir.join(run_id.to_string()),
            span: info_span!("pipeline_run", %run_id, mode = ?requested),
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary::started(self.run_id, self.requested, self.started_at)
    }

    /// Records `outcome`, writes the run report and returns the final summary.
    async fn finish(
        self,
        mut summary: RunSummary,
        outcome: Result<()>,
        quality: Option<&QualityReport>,
    ) -> RunSummary {
        let span = &self.span;
        if let Err(err) = outcome {
            let message = format!("{err:#}");
            error!(parent: span, error = %message, "pipeline run failed");
            summary.status = RunStatus::Failed;
            summary.error = Some(message);
        }
        summary.finished_at = Utc::now();
        summary.duration_secs = self.clock.elapsed().as_secs_f64();
        summary.reports_dir = Some(self.dir.display().to_string());

        if let Err(err) = write_run_report(&self.dir, &summary, quality).await {
            warn!(parent: span, error = %format!("{err:#}"), "could not write run report");
        }
        info!(
            parent: span,
            status = ?summary.status,
            duration_secs = summary.duration_secs,
            "pipeline run finished"
        );
        summary
    }
}

/// Connects to Postgres and applies pending migrations.
pub async fn connect_warehouse(database: &DatabaseConfig) -> Result<PgWarehouse> {
    let warehouse = PgWarehouse::connect(database)
        .await
        .context("connecting to warehouse")?;
    warehouse.migrate().await.context("applying migrations")?;
    Ok(warehouse)
}

/// Runs once against the configured Postgres warehouse.
///
/// When the warehouse cannot be reached the run still ends with a failed summary,
/// written to the reports directory like any other run.
pub async fn run_with_postgres(config: PipelineConfig, overrides: &RunOverrides) -> RunSummary {
    match connect_warehouse(&config.database).await {
        Ok(warehouse) => {
            PipelineRunner::new(config, Arc::new(warehouse))
                .run(overrides)
                .await
        }
        Err(err) => {
            let options = overrides.applied_to(&config.pipeline);
            let run = RunHandle::start(&config, &options);
            let summary = run.summary();
            run.finish(summary, Err(err), None).await
        }
    }
}

/// Builds a scheduler with one job per configured cron expression, or `None` when disabled.
pub async fn maybe_build_scheduler(runner: Arc<PipelineRunner>) -> Result<Option<JobScheduler>> {
    let scheduler = &runner.config().scheduler;
    if !scheduler.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &scheduler.crons {
        let runner = Arc::clone(&runner);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                info!("scheduled pipeline run triggered");
                let summary = runner.run(&RunOverrides::default()).await;
                if !summary.succeeded() {
                    warn!(run_id = %summary.run_id, "scheduled pipeline run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "registered pipeline job");
    }
    Ok(Some(sched))
}
