//! Reconciles orders, order items and menu items into denormalized order lines.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime};
use rodp_core::{sentinel_date, CompleteOrderLine, KeyValue, StagingData, Table, Value};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::SAMPLE_LIMIT;

const ISO_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];
const ISO_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];
/// Retried in order once the ISO forms fail.
const FALLBACK_DATE_FORMATS: &[&str] =
    &["%d/%m/%Y", "%m/%d/%Y", "%Y-%m-%d", "%d-%m-%Y", "%m-%d-%Y"];

const ORDER_COLUMNS: &[&str] = &["order_id", "order_date"];
const ITEM_COLUMNS: &[&str] = &["order_id", "item_id", "quantity", "unit_price"];
const MENU_COLUMNS: &[&str] = &["item_id", "item_name", "category"];

#[derive(Debug, Error)]
enum JoinError {
    #[error("required column '{column}' missing from {table}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },
}

/// Row counts the join dropped, repaired or collapsed.
///
/// Order items with a null quantity or unit price are excluded from the joined lines
/// and only counted in `rows_missing_measures`. They are not kept as lines without
/// revenue, so every persisted line carries both measures.
///
/// When the orders or the menu repeat a key, the first row for that key is joined and
/// the later ones are counted in `duplicate_orders` / `duplicate_menu_items`. Each
/// order item therefore yields at most one line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinDiagnostics {
    pub orders_without_items: usize,
    pub items_without_order: usize,
    pub items_without_menu_item: usize,
    pub dates_recovered: usize,
    pub dates_defaulted: usize,
    pub rows_missing_measures: usize,
    pub duplicate_orders: usize,
    pub duplicate_menu_items: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinOutput {
    pub lines: Vec<CompleteOrderLine>,
    pub diagnostics: JoinDiagnostics,
    /// Set when the join could not run; `lines` is then empty.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DateSource {
    Parsed,
    Recovered,
    Defaulted,
}

/// Parses an order date, trying ISO forms first and then the fallback format list.
pub fn parse_order_date(value: &Value) -> Option<NaiveDate> {
    match resolve_date(value) {
        (date, DateSource::Parsed | DateSource::Recovered) => Some(date),
        (_, DateSource::Defaulted) => None,
    }
}

fn resolve_date(value: &Value) -> (NaiveDate, DateSource) {
    let raw = match value {
        Value::Date(date) => return (*date, DateSource::Parsed),
        Value::Text(raw) => raw.trim(),
        _ => return (sentinel_date(), DateSource::Defaulted),
    };

    let iso = ISO_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            ISO_DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        });
    if let Some(date) = iso {
        return (date, DateSource::Parsed);
    }

    FALLBACK_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .map(|date| (date, DateSource::Recovered))
        .unwrap_or((sentinel_date(), DateSource::Defaulted))
}

struct Indices {
    order_id: usize,
    customer_id: Option<usize>,
    order_date: usize,
    item_order_id: usize,
    item_id: usize,
    quantity: usize,
    unit_price: usize,
    menu_item_id: usize,
    item_name: usize,
    category: usize,
}

fn require(
    table: &Table,
    name: &'static str,
    columns: &[&'static str],
) -> Result<Vec<usize>, JoinError> {
    columns
        .iter()
        .map(|column| {
            table
                .column_index(column)
                .ok_or(JoinError::MissingColumn {
                    table: name,
                    column: *column,
                })
        })
        .collect()
}

fn locate(orders: &Table, items: &Table, menu: &Table) -> Result<Indices, JoinError> {
    let o = require(orders, "orders", ORDER_COLUMNS)?;
    let i = require(items, "order_items", ITEM_COLUMNS)?;
    let m = require(menu, "menu_items", MENU_COLUMNS)?;
    Ok(Indices {
        order_id: o[0],
        customer_id: orders.column_index("customer_id"),
        order_date: o[1],
        item_order_id: i[0],
        item_id: i[1],
        quantity: i[2],
        unit_price: i[3],
        menu_item_id: m[0],
        item_name: m[1],
        category: m[2],
    })
}

/// Inner-joins order items to orders on `order_id` and then to the menu on `item_id`.
///
/// Never fails: a missing required column is logged and yields an empty output.
pub fn join_order_data(data: &StagingData) -> JoinOutput {
    info!("joining orders, order_items and menu_items");
    let mut orders = data.orders.clone();
    let mut items = data.order_items.clone();
    let mut menu = data.menu_items.clone();
    orders.trim_column_names();
    items.trim_column_names();
    menu.trim_column_names();

    match join_tables(&orders, &items, &menu) {
        Ok(output) => output,
        Err(err) => {
            error!(error = %err, "error joining data");
            JoinOutput {
                error: Some(err.to_string()),
                ..Default::default()
            }
        }
    }
}

fn join_tables(orders: &Table, items: &Table, menu: &Table) -> Result<JoinOutput, JoinError> {
    let idx = locate(orders, items, menu)?;
    let mut diagnostics = JoinDiagnostics::default();

    let mut dates = Vec::with_capacity(orders.len());
    for row in orders.rows() {
        let (date, source) = resolve_date(&row[idx.order_date]);
        match source {
            DateSource::Recovered => diagnostics.dates_recovered += 1,
            DateSource::Defaulted => diagnostics.dates_defaulted += 1,
            DateSource::Parsed => {}
        }
        dates.push(date);
    }
    if diagnostics.dates_recovered + diagnostics.dates_defaulted > 0 {
        warn!(
            recovered = diagnostics.dates_recovered,
            defaulted = diagnostics.dates_defaulted,
            "orders with non-ISO dates"
        );
    }

    let mut orders_by_id: HashMap<i64, usize> = HashMap::new();
    for (position, row) in orders.rows().iter().enumerate() {
        if let Some(id) = row[idx.order_id].as_i64() {
            match orders_by_id.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(position);
                }
                Entry::Occupied(_) => diagnostics.duplicate_orders += 1,
            }
        }
    }
    let mut menu_by_id: HashMap<String, usize> = HashMap::new();
    for (position, row) in menu.rows().iter().enumerate() {
        if let Some(id) = row[idx.menu_item_id].to_text() {
            match menu_by_id.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(position);
                }
                Entry::Occupied(_) => diagnostics.duplicate_menu_items += 1,
            }
        }
    }

    let mut lines = Vec::new();
    let mut ordered_ids = HashSet::new();
    for row in items.rows() {
        let order_id = row[idx.item_order_id].as_i64();
        if let Some(id) = order_id {
            ordered_ids.insert(id);
        }
        let Some((order_id, &order_row)) =
            order_id.and_then(|id| orders_by_id.get(&id).map(|position| (id, position)))
        else {
            diagnostics.items_without_order += 1;
            continue;
        };
        let Some((item_id, &menu_row)) = row[idx.item_id]
            .to_text()
            .and_then(|id| menu_by_id.get(&id).map(|position| (id, position)))
        else {
            diagnostics.items_without_menu_item += 1;
            continue;
        };
        let (Some(quantity), Some(unit_price)) =
            (row[idx.quantity].as_i64(), row[idx.unit_price].as_f64())
        else {
            diagnostics.rows_missing_measures += 1;
            continue;
        };

        let order = &orders.rows()[order_row];
        let menu_item = &menu.rows()[menu_row];
        lines.push(CompleteOrderLine {
            order_id,
            customer_id: idx.customer_id.and_then(|c| order[c].to_text()),
            order_date: dates[order_row],
            item_id,
            item_name: menu_item[idx.item_name].to_text(),
            category: menu_item[idx.category].to_text(),
            quantity,
            unit_price,
            item_revenue: quantity as f64 * unit_price,
        });
    }

    diagnostics.orders_without_items = orders_by_id
        .keys()
        .filter(|id| !ordered_ids.contains(*id))
        .count();
    if diagnostics.orders_without_items > 0 {
        warn!(count = diagnostics.orders_without_items, "orders with no items");
    }
    if diagnostics.items_without_order > 0 {
        warn!(
            count = diagnostics.items_without_order,
            "order items with no corresponding order"
        );
    }
    if diagnostics.items_without_menu_item > 0 {
        warn!(
            count = diagnostics.items_without_menu_item,
            "order items with unknown menu items"
        );
    }
    if diagnostics.rows_missing_measures > 0 {
        warn!(
            count = diagnostics.rows_missing_measures,
            "order items without quantity or unit price"
        );
    }
    if diagnostics.duplicate_orders + diagnostics.duplicate_menu_items > 0 {
        warn!(
            orders = diagnostics.duplicate_orders,
            menu_items = diagnostics.duplicate_menu_items,
            "repeated keys joined on their first row"
        );
    }
    info!(rows = lines.len(), "joined data");

    Ok(JoinOutput {
        lines,
        diagnostics,
        error: None,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeySample {
    pub count: usize,
    pub examples: Vec<KeyValue>,
}

impl KeySample {
    fn from_set(keys: BTreeSet<KeyValue>) -> Self {
        Self {
            count: keys.len(),
            examples: keys.into_iter().take(SAMPLE_LIMIT).collect(),
        }
    }
}

/// Set differences over the raw key columns, independent of the join output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelationshipAudit {
    pub orphaned_items: KeySample,
    pub unknown_items: KeySample,
    pub orders_with_no_items: KeySample,
    pub unused_menu_items: KeySample,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelationshipAudit {
    pub fn has_issues(&self) -> bool {
        self.orphaned_items.count
            + self.unknown_items.count
            + self.orders_with_no_items.count
            + self.unused_menu_items.count
            > 0
    }
}

pub fn audit_relationships(data: &StagingData) -> RelationshipAudit {
    let keys = |table: &Table, column: &str| -> Option<BTreeSet<KeyValue>> {
        let index = table.column_index(column)?;
        Some(
            table
                .column_values(index)
                .map(Value::key)
                .filter(|k| !k.is_null())
                .collect(),
        )
    };

    let sets = (
        keys(&data.orders, "order_id"),
        keys(&data.order_items, "order_id"),
        keys(&data.order_items, "item_id"),
        keys(&data.menu_items, "item_id"),
    );
    let (Some(order_ids), Some(item_order_ids), Some(item_ids), Some(menu_ids)) = sets else {
        let message = "missing key column for relationship audit".to_string();
        error!(error = %message, "error checking relationships");
        return RelationshipAudit {
            error: Some(message),
            ..Default::default()
        };
    };

    let difference = |left: &BTreeSet<KeyValue>, right: &BTreeSet<KeyValue>| {
        KeySample::from_set(left.difference(right).cloned().collect())
    };
    let audit = RelationshipAudit {
        orphaned_items: difference(&item_order_ids, &order_ids),
        unknown_items: difference(&item_ids, &menu_ids),
        orders_with_no_items: difference(&order_ids, &item_order_ids),
        unused_menu_items: difference(&menu_ids, &item_ids),
        error: None,
    };
    if audit.has_issues() {
        warn!(
            orphaned_items = audit.orphaned_items.count,
            unknown_items = audit.unknown_items.count,
            orders_with_no_items = audit.orders_with_no_items.count,
            unused_menu_items = audit.unused_menu_items.count,
            "relationship audit found unmatched keys"
        );
    }
    audit
}
