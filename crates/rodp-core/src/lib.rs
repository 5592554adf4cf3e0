//! Core domain model for the restaurant order pipeline: staging tables, fact rows, aggregates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rodp-core";

pub const COMPLETE_ORDERS_TABLE: &str = "complete_orders";
pub const DAILY_REVENUE_TABLE: &str = "daily_revenue_by_category";
pub const TOP_SELLING_ITEMS_TABLE: &str = "top_selling_items";
pub const CATEGORY_METRICS_TABLE: &str = "category_metrics";

/// Placeholder substituted for missing text values.
pub const SENTINEL_TEXT: &str = "Unknown";

/// Placeholder substituted for missing or unrecoverable dates (2000-01-01).
pub fn sentinel_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

/// The three staging entities read from source files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Orders,
    OrderItems,
    MenuItems,
}

impl Entity {
    pub const ALL: [Entity; 3] = [Entity::Orders, Entity::OrderItems, Entity::MenuItems];

    pub fn table_name(self) -> &'static str {
        match self {
            Entity::Orders => "orders",
            Entity::OrderItems => "order_items",
            Entity::MenuItems => "menu_items",
        }
    }

    pub fn from_table_name(name: &str) -> Option<Entity> {
        Entity::ALL.into_iter().find(|e| e.table_name() == name)
    }

    pub fn staging_table(self) -> &'static str {
        match self {
            Entity::Orders => "staging_orders",
            Entity::OrderItems => "staging_order_items",
            Entity::MenuItems => "staging_menu_items",
        }
    }

    /// Primary key used by the duplicate-key check.
    pub fn primary_key(self) -> &'static [&'static str] {
        match self {
            Entity::Orders => &["order_id"],
            Entity::OrderItems => &["order_id", "item_id"],
            Entity::MenuItems => &["item_id"],
        }
    }

    /// Canonical column set and declared types for this entity.
    pub fn declared_columns(self) -> &'static [(&'static str, ColumnType)] {
        match self {
            Entity::Orders => &[
                ("order_id", ColumnType::Integer),
                ("customer_id", ColumnType::Text),
                ("order_date", ColumnType::Text),
                ("total_amount", ColumnType::Float),
            ],
            Entity::OrderItems => &[
                ("order_id", ColumnType::Integer),
                ("item_id", ColumnType::Text),
                ("quantity", ColumnType::Integer),
                ("unit_price", ColumnType::Float),
            ],
            Entity::MenuItems => &[
                ("item_id", ColumnType::Text),
                ("item_name", ColumnType::Text),
                ("category", ColumnType::Text),
                ("description", ColumnType::Text),
            ],
        }
    }

    /// Known drifted spellings (lowercase) mapped to their canonical column.
    pub fn column_synonyms(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Entity::Orders => &[
                ("orderid", "order_id"),
                ("order id", "order_id"),
                ("customerid", "customer_id"),
                ("customer id", "customer_id"),
                ("orderdate", "order_date"),
                ("order date", "order_date"),
                ("totalamount", "total_amount"),
                ("total amount", "total_amount"),
                ("total", "total_amount"),
                ("amount", "total_amount"),
            ],
            Entity::OrderItems => &[
                ("orderid", "order_id"),
                ("order id", "order_id"),
                ("itemid", "item_id"),
                ("item id", "item_id"),
                ("unitprice", "unit_price"),
                ("unit price", "unit_price"),
                ("price", "unit_price"),
            ],
            Entity::MenuItems => &[
                ("itemid", "item_id"),
                ("item id", "item_id"),
                ("itemname", "item_name"),
                ("item name", "item_name"),
                ("name", "item_name"),
            ],
        }
    }

    pub fn declared_type(self, column: &str) -> Option<ColumnType> {
        self.declared_columns()
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, kind)| *kind)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Date,
}

/// A single cell of a staging table. Malformed input is carried as `Null`, never rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(v) => v.is_nan(),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) if !v.is_nan() => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Display form of any non-null value.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Float(v) if v.is_nan() => None,
            Value::Float(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
        }
    }

    /// Hashable identity used for keys, set differences, and grouping.
    pub fn key(&self) -> KeyValue {
        match self {
            Value::Null => KeyValue::Null,
            Value::Int(v) => KeyValue::Int(*v),
            Value::Float(v) if v.is_nan() => KeyValue::Null,
            Value::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                KeyValue::Int(*v as i64)
            }
            Value::Float(v) => KeyValue::Text(v.to_string()),
            Value::Text(s) => KeyValue::Text(s.clone()),
            Value::Date(d) => KeyValue::Text(d.format("%Y-%m-%d").to_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Key identity of a cell. Integral floats collapse onto integers so `1` and `1.0` join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Null,
    Int(i64),
    Text(String),
}

impl KeyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Null => f.write_str("null"),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Column-named table of loosely typed rows, the in-memory form of a staging table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Empty table with the declared canonical shape of `entity`.
    pub fn for_entity(entity: Entity) -> Self {
        Self::new(
            entity
                .declared_columns()
                .iter()
                .map(|(name, kind)| Column::new(*name, *kind))
                .collect(),
        )
    }

    /// Builds a table, padding short rows with nulls and truncating long ones.
    pub fn with_rows(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn rename_column(&mut self, index: usize, name: impl Into<String>) {
        if let Some(column) = self.columns.get_mut(index) {
            column.name = name.into();
        }
    }

    /// Strips surrounding whitespace from every column name.
    pub fn trim_column_names(&mut self) {
        for column in &mut self.columns {
            let trimmed = column.name.trim();
            if trimmed.len() != column.name.len() {
                column.name = trimmed.to_string();
            }
        }
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [Vec<Value>] {
        &mut self.rows
    }

    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[Value]) -> bool) {
        self.rows.retain(|row| keep(row));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |row| &row[index])
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[index])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    pub table: String,
    pub from: String,
    pub to: String,
}

/// Renames drifted column spellings to their canonical names using the entity's synonym table.
///
/// A column is only renamed when its canonical target is not already present, so a
/// table carrying both `total` and `total_amount` keeps both untouched.
pub fn normalize_column_names(entity: Entity, table: &mut Table) -> Vec<ColumnRename> {
    let mut renames = Vec::new();
    for index in 0..table.columns.len() {
        let current = table.columns[index].name.clone();
        let lower = current.trim().to_ascii_lowercase();
        let target = if entity.declared_type(&lower).is_some() {
            Some(lower.clone())
        } else {
            entity
                .column_synonyms()
                .iter()
                .find(|(alias, _)| *alias == lower)
                .map(|(_, canonical)| canonical.to_string())
        };
        let Some(target) = target else {
            continue;
        };
        if target == current || table.has_column(&target) {
            continue;
        }
        table.columns[index].name = target.clone();
        renames.push(ColumnRename {
            table: entity.table_name().to_string(),
            from: current,
            to: target,
        });
    }
    renames
}

/// The three staging tables of one run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StagingData {
    pub orders: Table,
    pub order_items: Table,
    pub menu_items: Table,
}

impl StagingData {
    pub fn get(&self, entity: Entity) -> &Table {
        match entity {
            Entity::Orders => &self.orders,
            Entity::OrderItems => &self.order_items,
            Entity::MenuItems => &self.menu_items,
        }
    }

    pub fn get_mut(&mut self, entity: Entity) -> &mut Table {
        match entity {
            Entity::Orders => &mut self.orders,
            Entity::OrderItems => &mut self.order_items,
            Entity::MenuItems => &mut self.menu_items,
        }
    }

    pub fn row_counts(&self) -> BTreeMap<String, usize> {
        Entity::ALL
            .iter()
            .map(|e| (e.table_name().to_string(), self.get(*e).len()))
            .collect()
    }
}

/// Locates a canonical column among the column names of a table.
pub trait ColumnLocator: Send + Sync {
    fn locate(&self, columns: &[&str], canonical: &str) -> Option<usize>;
}

/// Case-insensitive exact-name locator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactColumnLocator;

impl ColumnLocator for ExactColumnLocator {
    fn locate(&self, columns: &[&str], canonical: &str) -> Option<usize> {
        columns
            .iter()
            .position(|c| c.trim().eq_ignore_ascii_case(canonical))
    }
}

/// One order line joined to its order and menu metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteOrderLine {
    pub order_id: i64,
    pub customer_id: Option<String>,
    pub order_date: NaiveDate,
    pub item_id: String,
    pub item_name: Option<String>,
    pub category: Option<String>,
    pub quantity: i64,
    pub unit_price: f64,
    pub item_revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRevenueByCategory {
    pub date: NaiveDate,
    pub category: String,
    pub total_revenue: f64,
    pub order_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopSellingItem {
    pub item_id: String,
    pub item_name: String,
    pub category: String,
    pub total_quantity_sold: i64,
    pub total_revenue: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetrics {
    pub category: String,
    pub order_count: i64,
    pub total_revenue: f64,
    pub total_items_sold: i64,
    pub unique_items_count: i64,
    pub avg_revenue_per_order: f64,
    pub avg_items_per_order: f64,
}
