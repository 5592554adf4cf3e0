//! Aggregates over joined order lines, plus the order-total cross-check.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use rodp_core::{
    CategoryMetrics, ColumnLocator, CompleteOrderLine, DailyRevenueByCategory, Table,
    TopSellingItem,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Absolute difference tolerated between a stated and a computed order total.
pub const TOTAL_TOLERANCE: f64 = 0.01;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetricsError {
    #[error("category '{category}' has no orders; per-order averages are undefined")]
    ZeroOrderCount { category: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregates {
    pub daily_revenue: Vec<DailyRevenueByCategory>,
    pub top_items: Vec<TopSellingItem>,
    pub category_metrics: Vec<CategoryMetrics>,
}

/// Computes all three aggregates. Top items are returned untruncated.
pub fn compute_aggregates(lines: &[CompleteOrderLine]) -> Result<Aggregates, MetricsError> {
    Ok(Aggregates {
        daily_revenue: calculate_daily_revenue_by_category(lines),
        top_items: identify_top_selling_items(lines, None),
        category_metrics: calculate_category_metrics(lines)?,
    })
}

pub fn calculate_daily_revenue_by_category(
    lines: &[CompleteOrderLine],
) -> Vec<DailyRevenueByCategory> {
    info!("calculating daily revenue by category");
    let mut groups: BTreeMap<(NaiveDate, &str), (f64, BTreeSet<i64>)> = BTreeMap::new();
    for line in lines {
        let Some(category) = line.category.as_deref() else {
            continue;
        };
        let entry = groups.entry((line.order_date, category)).or_default();
        entry.0 += line.item_revenue;
        entry.1.insert(line.order_id);
    }

    let daily = groups
        .into_iter()
        .map(|((date, category), (total_revenue, orders))| DailyRevenueByCategory {
            date,
            category: category.to_string(),
            total_revenue,
            order_count: orders.len() as i64,
        })
        .collect::<Vec<_>>();
    info!(rows = daily.len(), "calculated daily revenue by category");
    daily
}

/// Ranks items by quantity sold, descending. `top_n` of `None` or `Some(0)` keeps every item.
///
/// Lines are grouped by `item_id` alone; the name and category of the last line seen win,
/// as they do when top items are merged across runs.
pub fn identify_top_selling_items(
    lines: &[CompleteOrderLine],
    top_n: Option<usize>,
) -> Vec<TopSellingItem> {
    info!("identifying top selling items");
    let mut groups: BTreeMap<&str, TopSellingItem> = BTreeMap::new();
    for line in lines {
        let (Some(name), Some(category)) = (line.item_name.as_deref(), line.category.as_deref())
        else {
            continue;
        };
        let item = groups
            .entry(line.item_id.as_str())
            .or_insert_with(|| TopSellingItem {
                item_id: line.item_id.clone(),
                item_name: String::new(),
                category: String::new(),
                total_quantity_sold: 0,
                total_revenue: 0.0,
            });
        name.clone_into(&mut item.item_name);
        category.clone_into(&mut item.category);
        item.total_quantity_sold += line.quantity;
        item.total_revenue += line.item_revenue;
    }

    let mut items = groups.into_values().collect::<Vec<_>>();
    sort_top_items(&mut items);
    if let Some(n) = top_n.filter(|n| *n > 0) {
        items.truncate(n);
    }
    info!(items = items.len(), "identified top selling items");
    items
}

pub(crate) fn sort_top_items(items: &mut [TopSellingItem]) {
    items.sort_by(|a, b| b.total_quantity_sold.cmp(&a.total_quantity_sold));
}

pub fn calculate_category_metrics(
    lines: &[CompleteOrderLine],
) -> Result<Vec<CategoryMetrics>, MetricsError> {
    info!("calculating category metrics");

    #[derive(Default)]
    struct Totals<'a> {
        orders: BTreeSet<i64>,
        items: BTreeSet<&'a str>,
        revenue: f64,
        quantity: i64,
    }

    let mut groups: BTreeMap<&str, Totals<'_>> = BTreeMap::new();
    for line in lines {
        let Some(category) = line.category.as_deref() else {
            continue;
        };
        let totals = groups.entry(category).or_default();
        totals.orders.insert(line.order_id);
        totals.items.insert(line.item_id.as_str());
        totals.revenue += line.item_revenue;
        totals.quantity += line.quantity;
    }

    let mut metrics = groups
        .into_iter()
        .map(|(category, totals)| {
            category_metrics_from_totals(
                category,
                totals.orders.len() as i64,
                totals.revenue,
                totals.quantity,
                totals.items.len() as i64,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    sort_category_metrics(&mut metrics);
    info!(categories = metrics.len(), "calculated category metrics");
    Ok(metrics)
}

/// Builds a metrics row and derives the per-order averages.
pub fn category_metrics_from_totals(
    category: &str,
    order_count: i64,
    total_revenue: f64,
    total_items_sold: i64,
    unique_items_count: i64,
) -> Result<CategoryMetrics, MetricsError> {
    if order_count <= 0 {
        return Err(MetricsError::ZeroOrderCount {
            category: category.to_string(),
        });
    }
    Ok(CategoryMetrics {
        category: category.to_string(),
        order_count,
        total_revenue,
        total_items_sold,
        unique_items_count,
        avg_revenue_per_order: total_revenue / order_count as f64,
        avg_items_per_order: total_items_sold as f64 / order_count as f64,
    })
}

pub(crate) fn sort_category_metrics(metrics: &mut [CategoryMetrics]) {
    metrics.sort_by(|a, b| b.total_revenue.total_cmp(&a.total_revenue));
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TotalComparison {
    pub order_id: i64,
    pub total_amount: f64,
    pub calculated_total: f64,
    pub difference: f64,
}

impl TotalComparison {
    pub fn matches(&self) -> bool {
        self.difference <= TOTAL_TOLERANCE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TotalsReport {
    /// Orders column holding the stated total, when one could be located.
    pub column_used: Option<String>,
    pub comparisons: Vec<TotalComparison>,
}

impl TotalsReport {
    pub fn discrepancies(&self) -> impl Iterator<Item = &TotalComparison> + '_ {
        self.comparisons.iter().filter(|c| !c.matches())
    }

    pub fn discrepancy_count(&self) -> usize {
        self.discrepancies().count()
    }
}

/// Compares each order's stated total with the sum of its line amounts.
///
/// The stated-total column is found through `locator`; when none is found the report is
/// empty. Orders with no items, or with no stated total, are not compared.
pub fn verify_totals(orders: &Table, items: &Table, locator: &dyn ColumnLocator) -> TotalsReport {
    info!("verifying order total amounts");
    let names = orders.column_names();
    let Some(total_index) = locator.locate(&names, "total_amount") else {
        warn!(columns = ?names, "could not find a total amount column in orders data");
        return TotalsReport::default();
    };
    let column_used = names[total_index].trim().to_string();
    info!(column = %column_used, "using column for total amount verification");

    let columns = (
        orders.column_index("order_id"),
        items.column_index("order_id"),
        items.column_index("quantity"),
        items.column_index("unit_price"),
    );
    let (Some(order_id), Some(item_order_id), Some(quantity), Some(unit_price)) = columns else {
        warn!("order or item key columns missing; skipping total verification");
        return TotalsReport {
            column_used: Some(column_used),
            comparisons: Vec::new(),
        };
    };

    let mut calculated: HashMap<i64, f64> = HashMap::new();
    for row in items.rows() {
        let Some(id) = row[item_order_id].as_i64() else {
            continue;
        };
        let amount = match (row[quantity].as_f64(), row[unit_price].as_f64()) {
            (Some(q), Some(p)) => q * p,
            _ => 0.0,
        };
        *calculated.entry(id).or_default() += amount;
    }

    let comparisons = orders
        .rows()
        .iter()
        .filter_map(|row| {
            let id = row[order_id].as_i64()?;
            let total_amount = row[total_index].as_f64()?;
            let calculated_total = *calculated.get(&id)?;
            Some(TotalComparison {
                order_id: id,
                total_amount,
                calculated_total,
                difference: (total_amount - calculated_total).abs(),
            })
        })
        .collect::<Vec<_>>();

    let report = TotalsReport {
        column_used: Some(column_used),
        comparisons,
    };
    let mismatched = report.discrepancy_count();
    if mismatched > 0 {
        warn!(orders = mismatched, "orders with total amount discrepancies");
    } else {
        info!("all order total amounts match calculated totals");
    }
    report
}
