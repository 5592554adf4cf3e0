//! Data-quality detection and deterministic auto-fixes over the staging tables.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rodp_core::{
    normalize_column_names, sentinel_date, ColumnRename, ColumnType, Entity, KeyValue,
    StagingData, Table, Value, SENTINEL_TEXT,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SAMPLE_LIMIT;

const RANGE_EXAMPLE_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    /// value >= 0, fixed by taking the absolute value
    NonNegative,
    /// value > 0, fixed by coercing to 1
    Positive,
}

#[derive(Debug, Clone, Copy)]
struct RangeRule {
    entity: Entity,
    column: &'static str,
    bound: Bound,
}

const RANGE_RULES: &[RangeRule] = &[
    RangeRule {
        entity: Entity::Orders,
        column: "total_amount",
        bound: Bound::NonNegative,
    },
    RangeRule {
        entity: Entity::OrderItems,
        column: "quantity",
        bound: Bound::Positive,
    },
    RangeRule {
        entity: Entity::OrderItems,
        column: "unit_price",
        bound: Bound::NonNegative,
    },
];

#[derive(Debug, Clone, Copy)]
struct ForeignKey {
    table: Entity,
    key: &'static str,
    ref_table: Entity,
    ref_key: &'static str,
}

impl ForeignKey {
    fn label(&self) -> String {
        format!(
            "{}.{} -> {}.{}",
            self.table, self.key, self.ref_table, self.ref_key
        )
    }
}

const FOREIGN_KEYS: &[ForeignKey] = &[
    ForeignKey {
        table: Entity::OrderItems,
        key: "order_id",
        ref_table: Entity::Orders,
        ref_key: "order_id",
    },
    ForeignKey {
        table: Entity::OrderItems,
        key: "item_id",
        ref_table: Entity::MenuItems,
        ref_key: "item_id",
    },
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MissingValues {
    pub total_missing: usize,
    pub missing_columns: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateKeys {
    pub duplicate_count: usize,
    pub duplicate_keys: Vec<Vec<KeyValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RangeViolations {
    pub invalid_count: usize,
    pub invalid_examples: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrphanedKeys {
    pub orphaned_count: usize,
    pub orphaned_examples: Vec<KeyValue>,
    /// Full orphan set handed to the fixer; reports only carry the capped examples.
    #[serde(skip)]
    pub orphaned_values: BTreeSet<KeyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub missing_values: BTreeMap<String, MissingValues>,
    pub duplicate_keys: BTreeMap<String, DuplicateKeys>,
    pub value_ranges: BTreeMap<String, BTreeMap<String, RangeViolations>>,
    pub referential_integrity: BTreeMap<String, OrphanedKeys>,
}

impl QualityReport {
    pub fn total_issues(&self) -> usize {
        let missing: usize = self.missing_values.values().map(|m| m.total_missing).sum();
        let duplicates: usize = self.duplicate_keys.values().map(|d| d.duplicate_count).sum();
        let ranges: usize = self
            .value_ranges
            .values()
            .flat_map(|cols| cols.values())
            .map(|r| r.invalid_count)
            .sum();
        let orphans: usize = self
            .referential_integrity
            .values()
            .map(|o| o.orphaned_count)
            .sum();
        missing + duplicates + ranges + orphans
    }

    /// The signal that gates the fix pass.
    pub fn has_missing_values(&self) -> bool {
        self.missing_values.values().any(|m| m.total_missing > 0)
    }
}

/// Which orphaned foreign-key values the fix pass removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanFixScope {
    /// Every orphaned value found by detection.
    #[default]
    Full,
    /// Only the capped sample carried in the report.
    Sampled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOptions {
    pub orphan_scope: OrphanFixScope,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FixSummary {
    pub values_filled: usize,
    pub duplicates_removed: usize,
    pub values_corrected: usize,
    pub orphaned_rows_removed: usize,
    pub renamed_columns: Vec<ColumnRename>,
}

#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub data: StagingData,
    pub summary: FixSummary,
}

pub fn run_quality_checks(data: &StagingData) -> QualityReport {
    info!("running data quality checks");
    let report = QualityReport {
        missing_values: check_missing_values(data),
        duplicate_keys: check_duplicate_keys(data),
        value_ranges: check_value_ranges(data),
        referential_integrity: check_referential_integrity(data),
    };

    let total = report.total_issues();
    if total > 0 {
        warn!(issues = total, "found data quality issues");
    } else {
        info!("all data quality checks passed");
    }
    report
}

pub fn check_missing_values(data: &StagingData) -> BTreeMap<String, MissingValues> {
    let mut results = BTreeMap::new();
    for entity in Entity::ALL {
        let table = data.get(entity);
        let mut result = MissingValues::default();
        for (index, column) in table.columns().iter().enumerate() {
            let missing = table.column_values(index).filter(|v| v.is_null()).count();
            if missing > 0 {
                result.missing_columns.insert(column.name.clone(), missing);
                result.total_missing += missing;
            }
        }
        if result.total_missing > 0 {
            warn!(
                table = entity.table_name(),
                missing = result.total_missing,
                "table has missing values"
            );
            for (column, count) in &result.missing_columns {
                warn!(
                    table = entity.table_name(),
                    column = %column,
                    missing = count,
                    "missing values in column"
                );
            }
        }
        results.insert(entity.table_name().to_string(), result);
    }
    results
}

pub fn check_duplicate_keys(data: &StagingData) -> BTreeMap<String, DuplicateKeys> {
    let mut results = BTreeMap::new();
    for entity in Entity::ALL {
        let table = data.get(entity);
        let result = match key_indices(table, entity.primary_key()) {
            None => DuplicateKeys {
                error: Some(format!(
                    "not all primary key columns {:?} exist in table",
                    entity.primary_key()
                )),
                ..Default::default()
            },
            Some(indices) => {
                let keys = table
                    .rows()
                    .iter()
                    .map(|row| row_key(row, &indices))
                    .collect::<Vec<_>>();
                let mut counts: HashMap<&Vec<KeyValue>, usize> = HashMap::new();
                for key in &keys {
                    *counts.entry(key).or_default() += 1;
                }

                let mut duplicate_count = 0usize;
                let mut sampled = HashSet::new();
                let mut duplicate_keys = Vec::new();
                for key in &keys {
                    if counts[key] > 1 {
                        duplicate_count += 1;
                        if duplicate_keys.len() < SAMPLE_LIMIT && sampled.insert(key) {
                            duplicate_keys.push(key.clone());
                        }
                    }
                }
                if duplicate_count > 0 {
                    warn!(
                        table = entity.table_name(),
                        duplicates = duplicate_count,
                        "table has duplicate primary keys"
                    );
                }
                DuplicateKeys {
                    duplicate_count,
                    duplicate_keys,
                    error: None,
                }
            }
        };
        results.insert(entity.table_name().to_string(), result);
    }
    results
}

pub fn check_value_ranges(
    data: &StagingData,
) -> BTreeMap<String, BTreeMap<String, RangeViolations>> {
    let mut results: BTreeMap<String, BTreeMap<String, RangeViolations>> = BTreeMap::new();
    for rule in RANGE_RULES {
        let table = data.get(rule.entity);
        let result = match table.column_index(rule.column) {
            None => RangeViolations {
                error: Some(format!("column '{}' not found in table", rule.column)),
                ..Default::default()
            },
            Some(index) => {
                let invalid = table
                    .column_values(index)
                    .filter(|v| violates(v, rule.bound))
                    .collect::<Vec<_>>();
                if !invalid.is_empty() {
                    warn!(
                        table = rule.entity.table_name(),
                        column = rule.column,
                        invalid = invalid.len(),
                        "table has out-of-range values"
                    );
                }
                RangeViolations {
                    invalid_count: invalid.len(),
                    invalid_examples: invalid
                        .into_iter()
                        .take(RANGE_EXAMPLE_LIMIT)
                        .cloned()
                        .collect(),
                    error: None,
                }
            }
        };
        results
            .entry(rule.entity.table_name().to_string())
            .or_default()
            .insert(rule.column.to_string(), result);
    }
    results
}

pub fn check_referential_integrity(data: &StagingData) -> BTreeMap<String, OrphanedKeys> {
    let mut results = BTreeMap::new();
    for fk in FOREIGN_KEYS {
        let dependent = data.get(fk.table);
        let referenced = data.get(fk.ref_table);
        let result = match (dependent.column_index(fk.key), referenced.column_index(fk.ref_key)) {
            (Some(dep_index), Some(ref_index)) => {
                let referenced_keys = distinct_keys(referenced, ref_index);
                let orphaned_values = distinct_keys(dependent, dep_index)
                    .into_iter()
                    .filter(|k| !referenced_keys.contains(k))
                    .collect::<BTreeSet<_>>();
                if !orphaned_values.is_empty() {
                    warn!(
                        relationship = %fk.label(),
                        orphaned = orphaned_values.len(),
                        "referential integrity issue"
                    );
                }
                OrphanedKeys {
                    orphaned_count: orphaned_values.len(),
                    orphaned_examples: orphaned_values.iter().take(SAMPLE_LIMIT).cloned().collect(),
                    orphaned_values,
                    error: None,
                }
            }
            _ => OrphanedKeys {
                error: Some("missing table or column".to_string()),
                ..Default::default()
            },
        };
        results.insert(fk.label(), result);
    }
    results
}

/// Applies every fix class in order: missing values, duplicate keys, value ranges,
/// orphaned foreign keys, then column-name normalization. The input is left untouched.
pub fn apply_fixes(data: &StagingData, report: &QualityReport, options: &FixOptions) -> FixOutcome {
    info!("applying data quality fixes");
    let mut fixed = data.clone();
    let mut summary = FixSummary::default();

    for (table_name, result) in &report.missing_values {
        let Some(entity) = Entity::from_table_name(table_name) else {
            continue;
        };
        if result.total_missing == 0 {
            continue;
        }
        info!(table = %table_name, missing = result.total_missing, "filling missing values");
        let table = fixed.get_mut(entity);
        for column in result.missing_columns.keys() {
            summary.values_filled += fill_missing(table, column);
        }
    }

    for (table_name, result) in &report.duplicate_keys {
        let Some(entity) = Entity::from_table_name(table_name) else {
            continue;
        };
        if result.duplicate_count == 0 {
            continue;
        }
        let removed = drop_duplicate_keys(fixed.get_mut(entity), entity.primary_key());
        info!(table = %table_name, removed, "removed duplicate keys");
        summary.duplicates_removed += removed;
    }

    for rule in RANGE_RULES {
        let flagged = report
            .value_ranges
            .get(rule.entity.table_name())
            .and_then(|cols| cols.get(rule.column))
            .map(|r| r.invalid_count)
            .unwrap_or(0);
        if flagged == 0 {
            continue;
        }
        let corrected = correct_range(fixed.get_mut(rule.entity), rule);
        info!(
            table = rule.entity.table_name(),
            column = rule.column,
            corrected,
            "fixed invalid values"
        );
        summary.values_corrected += corrected;
    }

    for fk in FOREIGN_KEYS {
        let Some(result) = report.referential_integrity.get(&fk.label()) else {
            continue;
        };
        if result.orphaned_count == 0 {
            continue;
        }
        let orphans: BTreeSet<KeyValue> = match options.orphan_scope {
            OrphanFixScope::Full => result.orphaned_values.clone(),
            OrphanFixScope::Sampled => result.orphaned_examples.iter().cloned().collect(),
        };
        let table = fixed.get_mut(fk.table);
        let Some(index) = table.column_index(fk.key) else {
            continue;
        };
        let before = table.len();
        table.retain_rows(|row| !orphans.contains(&row[index].key()));
        let removed = before - table.len();
        info!(
            relationship = %fk.label(),
            removed,
            scope = ?options.orphan_scope,
            "filtered out orphaned foreign keys"
        );
        summary.orphaned_rows_removed += removed;
    }

    for entity in Entity::ALL {
        let renames = normalize_column_names(entity, fixed.get_mut(entity));
        if !renames.is_empty() {
            info!(
                table = entity.table_name(),
                renamed = renames.len(),
                "standardized column names"
            );
        }
        summary.renamed_columns.extend(renames);
    }

    for entity in Entity::ALL {
        let before = data.get(entity).len();
        let after = fixed.get(entity).len();
        if before != after {
            info!(
                table = entity.table_name(),
                removed = before.saturating_sub(after),
                "rows removed by fixes"
            );
        }
    }

    FixOutcome {
        data: fixed,
        summary,
    }
}

fn fill_missing(table: &mut Table, column: &str) -> usize {
    let Some(index) = table.column_index(column) else {
        return 0;
    };
    let fill = match table.columns()[index].kind {
        ColumnType::Integer => Value::Int(0),
        ColumnType::Float => Value::Float(0.0),
        ColumnType::Date => Value::Date(sentinel_date()),
        ColumnType::Text => Value::text(SENTINEL_TEXT),
    };
    let mut filled = 0;
    for row in table.rows_mut() {
        if row[index].is_null() {
            row[index] = fill.clone();
            filled += 1;
        }
    }
    filled
}

/// Keeps the first occurrence of each key in input order.
fn drop_duplicate_keys(table: &mut Table, key_columns: &[&str]) -> usize {
    let Some(indices) = key_indices(table, key_columns) else {
        return 0;
    };
    let before = table.len();
    let mut seen = HashSet::new();
    table.retain_rows(|row| seen.insert(row_key(row, &indices)));
    before - table.len()
}

fn correct_range(table: &mut Table, rule: &RangeRule) -> usize {
    let Some(index) = table.column_index(rule.column) else {
        return 0;
    };
    let mut corrected = 0;
    for row in table.rows_mut() {
        if !violates(&row[index], rule.bound) {
            continue;
        }
        let replacement = match (rule.bound, &row[index]) {
            (Bound::Positive, Value::Float(_)) => Value::Float(1.0),
            (Bound::Positive, _) => Value::Int(1),
            (Bound::NonNegative, Value::Int(v)) => Value::Int(v.saturating_abs()),
            (Bound::NonNegative, other) => match other.as_f64() {
                Some(v) => Value::Float(v.abs()),
                None => continue,
            },
        };
        row[index] = replacement;
        corrected += 1;
    }
    corrected
}

// Nulls are reported by the missing-values check, not here.
fn violates(value: &Value, bound: Bound) -> bool {
    match value.as_f64() {
        Some(v) => match bound {
            Bound::NonNegative => v < 0.0,
            Bound::Positive => v <= 0.0,
        },
        None => false,
    }
}

fn key_indices(table: &Table, columns: &[&str]) -> Option<Vec<usize>> {
    columns.iter().map(|c| table.column_index(c)).collect()
}

fn row_key(row: &[Value], indices: &[usize]) -> Vec<KeyValue> {
    indices.iter().map(|i| row[*i].key()).collect()
}

fn distinct_keys(table: &Table, index: usize) -> BTreeSet<KeyValue> {
    table
        .column_values(index)
        .map(Value::key)
        .filter(|k| !k.is_null())
        .collect()
}
