//! Ingestion boundary: source readers, declared schema mapping, and CSV export.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rodp_core::{
    normalize_column_names, Column, ColumnLocator, ColumnRename, ColumnType, Entity, StagingData,
    Table, Value,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "rodp-adapters";

/// Cell contents treated as missing on read.
const NA_TOKENS: &[&str] = &["", "NA", "N/A", "n/a", "NaN", "nan", "NULL", "null", "#N/A"];

/// Substring candidates for a drifted total-amount header, most specific first.
const TOTAL_AMOUNT_CANDIDATES: &[&str] = &[
    "total_amount",
    "total amount",
    "totalamount",
    "total",
    "amount",
    "price",
];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source file for {entity} not found: {path}")]
    MissingSource { entity: Entity, path: PathBuf },
    #[error("reading {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to load required staging tables: {}", .0.join(", "))]
    Incomplete(Vec<String>),
}

/// File names of the three sources, relative to the input directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceFiles {
    pub orders: String,
    pub order_items: String,
    pub menu_items: String,
}

impl Default for SourceFiles {
    fn default() -> Self {
        Self {
            orders: "orders.csv".to_string(),
            order_items: "order_item.csv".to_string(),
            menu_items: "menu_items.csv".to_string(),
        }
    }
}

impl SourceFiles {
    pub fn file_for(&self, entity: Entity) -> &str {
        match entity {
            Entity::Orders => &self.orders,
            Entity::OrderItems => &self.order_items,
            Entity::MenuItems => &self.menu_items,
        }
    }
}

/// Result of reading one source into canonical shape.
#[derive(Debug, Clone)]
pub struct SourceLoad {
    pub table: Table,
    pub renamed_columns: Vec<ColumnRename>,
    pub coercion_failures: usize,
    pub missing_values: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceLoadReport {
    pub rows: usize,
    pub renamed_columns: Vec<ColumnRename>,
    pub coercion_failures: usize,
    pub missing_values: usize,
}

impl From<&SourceLoad> for SourceLoadReport {
    fn from(load: &SourceLoad) -> Self {
        Self {
            rows: load.table.len(),
            renamed_columns: load.renamed_columns.clone(),
            coercion_failures: load.coercion_failures,
            missing_values: load.missing_values,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedStaging {
    pub data: StagingData,
    pub reports: BTreeMap<String, SourceLoadReport>,
}

/// A provider of raw staging rows for each entity.
pub trait StagingSource: Send + Sync {
    fn describe(&self) -> String;

    fn load(&self, entity: Entity) -> Result<SourceLoad, IngestError>;
}

/// Reads the three sources as delimited files from one directory.
#[derive(Debug, Clone)]
pub struct CsvDirectorySource {
    input_dir: PathBuf,
    files: SourceFiles,
    locator: HeuristicColumnLocator,
}

impl CsvDirectorySource {
    pub fn new(input_dir: impl Into<PathBuf>, files: SourceFiles) -> Self {
        Self {
            input_dir: input_dir.into(),
            files,
            locator: HeuristicColumnLocator,
        }
    }

    pub fn path_for(&self, entity: Entity) -> PathBuf {
        self.input_dir.join(self.files.file_for(entity))
    }
}

impl StagingSource for CsvDirectorySource {
    fn describe(&self) -> String {
        format!("csv:{}", self.input_dir.display())
    }

    fn load(&self, entity: Entity) -> Result<SourceLoad, IngestError> {
        let path = self.path_for(entity);
        if !path.exists() {
            return Err(IngestError::MissingSource { entity, path });
        }
        let file = File::open(&path).map_err(|err| IngestError::Csv {
            path: path.clone(),
            source: err.into(),
        })?;
        let load = read_csv_table(file, entity, &self.locator).map_err(|source| {
            IngestError::Csv {
                path: path.clone(),
                source,
            }
        })?;
        info!(
            table = entity.table_name(),
            rows = load.table.len(),
            path = %path.display(),
            "loaded source file"
        );
        if load.missing_values > 0 {
            warn!(
                table = entity.table_name(),
                missing = load.missing_values,
                "found missing values in {}",
                path.display()
            );
        }
        Ok(load)
    }
}

/// Loads all three staging tables, failing only after every source has been attempted.
pub fn load_staging(source: &dyn StagingSource) -> Result<LoadedStaging, IngestError> {
    let mut data = StagingData::default();
    let mut reports = BTreeMap::new();
    let mut failed = Vec::new();

    for entity in Entity::ALL {
        match source.load(entity) {
            Ok(load) => {
                reports.insert(entity.table_name().to_string(), SourceLoadReport::from(&load));
                *data.get_mut(entity) = load.table;
            }
            Err(err) => {
                warn!(table = entity.table_name(), error = %err, "skipping staging table");
                failed.push(entity.table_name().to_string());
            }
        }
    }

    if !failed.is_empty() {
        return Err(IngestError::Incomplete(failed));
    }
    Ok(LoadedStaging { data, reports })
}

/// Parses a delimited source and maps it onto the entity's canonical column set.
pub fn read_csv_table<R: Read>(
    reader: R,
    entity: Entity,
    locator: &dyn ColumnLocator,
) -> Result<SourceLoad, csv::Error> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers = rdr
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect::<Vec<_>>();
    let (columns, renamed_columns) = map_columns(entity, &headers, locator);

    let mut table = Table::new(columns.clone());
    let mut coercion_failures = 0usize;
    let mut missing_values = 0usize;

    for record in rdr.records() {
        let record = record?;
        let mut row = Vec::with_capacity(columns.len());
        for (index, column) in columns.iter().enumerate() {
            let (value, failed) = coerce_cell(record.get(index).unwrap_or(""), column.kind);
            if failed {
                coercion_failures += 1;
            }
            if value.is_null() {
                missing_values += 1;
            }
            row.push(value);
        }
        table.push_row(row);
    }

    Ok(SourceLoad {
        table,
        renamed_columns,
        coercion_failures,
        missing_values,
    })
}

/// Declared schema mapping: trim, canonical/synonym match, then the locator for absent columns.
pub fn map_columns(
    entity: Entity,
    headers: &[String],
    locator: &dyn ColumnLocator,
) -> (Vec<Column>, Vec<ColumnRename>) {
    let mut staging = Table::new(
        headers
            .iter()
            .map(|h| Column::new(h.trim(), ColumnType::Text))
            .collect(),
    );
    let mut renames = normalize_column_names(entity, &mut staging);

    for (canonical, _) in entity.declared_columns() {
        if staging.has_column(canonical) {
            continue;
        }
        let names = staging.column_names();
        let Some(index) = locator.locate(&names, canonical) else {
            continue;
        };
        let from = names[index].to_string();
        if entity.declared_type(&from).is_some() {
            continue;
        }
        staging.rename_column(index, *canonical);
        renames.push(ColumnRename {
            table: entity.table_name().to_string(),
            from,
            to: canonical.to_string(),
        });
    }

    for rename in &renames {
        info!(
            table = entity.table_name(),
            from = %rename.from,
            to = %rename.to,
            "mapped source column"
        );
    }

    let columns = staging
        .columns()
        .iter()
        .map(|c| {
            let kind = entity.declared_type(&c.name).unwrap_or(ColumnType::Text);
            Column::new(c.name.clone(), kind)
        })
        .collect();
    (columns, renames)
}

/// Coerces one raw cell. The flag reports a non-empty value that could not be typed.
pub fn coerce_cell(raw: &str, kind: ColumnType) -> (Value, bool) {
    let trimmed = raw.trim();
    if NA_TOKENS.contains(&trimmed) {
        return (Value::Null, false);
    }
    match kind {
        ColumnType::Integer => {
            if let Ok(v) = trimmed.parse::<i64>() {
                return (Value::Int(v), false);
            }
            match trimmed.parse::<f64>() {
                Ok(v) if v.is_finite() && v.fract() == 0.0 => (Value::Int(v as i64), false),
                _ => (Value::Null, true),
            }
        }
        ColumnType::Float => match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => (Value::Float(v), false),
            _ => (Value::Null, true),
        },
        ColumnType::Text | ColumnType::Date => (Value::text(raw), false),
    }
}

/// Fallback locator for drifted headers: exact match across all columns, then substring
/// match against a fixed candidate list.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicColumnLocator;

impl HeuristicColumnLocator {
    fn candidates(canonical: &str) -> &'static [&'static str] {
        match canonical {
            "total_amount" => TOTAL_AMOUNT_CANDIDATES,
            _ => &[],
        }
    }
}

impl ColumnLocator for HeuristicColumnLocator {
    fn locate(&self, columns: &[&str], canonical: &str) -> Option<usize> {
        let lowered = columns
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();

        if let Some(index) = lowered.iter().position(|c| c == canonical) {
            return Some(index);
        }
        Self::candidates(canonical).iter().find_map(|candidate| {
            lowered.iter().position(|c| c.contains(candidate))
        })
    }
}

/// Writes `rows` to `<dir>/<table_name>.csv`. Empty tables are skipped.
pub fn export_csv<T: Serialize>(
    dir: &Path,
    table_name: &str,
    rows: &[T],
) -> anyhow::Result<Option<PathBuf>> {
    if rows.is_empty() {
        warn!(table = table_name, "no rows to export");
        return Ok(None);
    }
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{table_name}.csv"));
    let mut wtr = csv::Writer::from_path(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    for row in rows {
        wtr.serialize(row)
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    wtr.flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    info!(table = table_name, rows = rows.len(), path = %path.display(), "exported csv");
    Ok(Some(path))
}
