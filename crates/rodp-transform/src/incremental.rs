//! Run-mode selection, watermark filtering, and merging fresh aggregates into persisted ones.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::NaiveDate;
use rodp_core::{
    CategoryMetrics, DailyRevenueByCategory, KeyValue, StagingData, TopSellingItem,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::join::parse_order_date;
use crate::metrics::{
    category_metrics_from_totals, sort_category_metrics, sort_top_items, MetricsError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Full,
    Incremental,
}

/// How fresh daily-revenue and category-metrics rows combine with persisted rows of the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The fresh row overwrites the persisted one.
    #[default]
    ReplaceByKey,
    /// Persisted and fresh measures are summed and averages recomputed.
    Reaggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeDecision {
    /// `degraded` is set when incremental was requested but no watermark exists.
    Full { degraded: bool },
    Incremental { watermark: NaiveDate },
}

impl ModeDecision {
    pub fn mode(&self) -> RunMode {
        match self {
            ModeDecision::Full { .. } => RunMode::Full,
            ModeDecision::Incremental { .. } => RunMode::Incremental,
        }
    }

    pub fn watermark(&self) -> Option<NaiveDate> {
        match self {
            ModeDecision::Full { .. } => None,
            ModeDecision::Incremental { watermark } => Some(*watermark),
        }
    }
}

pub fn decide_mode(requested: RunMode, watermark: Option<NaiveDate>) -> ModeDecision {
    match (requested, watermark) {
        (RunMode::Full, _) => ModeDecision::Full { degraded: false },
        (RunMode::Incremental, Some(watermark)) => {
            info!(%watermark, "running incremental load");
            ModeDecision::Incremental { watermark }
        }
        (RunMode::Incremental, None) => {
            info!("no previous data found, performing full load instead");
            ModeDecision::Full { degraded: true }
        }
    }
}

/// Keeps orders dated strictly after `watermark` and the items belonging to them.
///
/// Menu items pass through untouched. Orders whose date cannot be parsed are excluded.
/// Returns `None` when no order survives, which callers report as "no new data".
pub fn filter_since_watermark(data: &StagingData, watermark: NaiveDate) -> Option<StagingData> {
    let (Some(date_index), Some(order_index)) = (
        data.orders.column_index("order_date"),
        data.orders.column_index("order_id"),
    ) else {
        warn!("orders table has no order_date or order_id column; nothing to filter");
        return None;
    };

    let mut filtered = data.clone();
    filtered
        .orders
        .retain_rows(|row| parse_order_date(&row[date_index]).is_some_and(|d| d > watermark));
    if filtered.orders.is_empty() {
        info!(%watermark, "no new orders since last run");
        return None;
    }

    let new_orders: HashSet<KeyValue> = filtered
        .orders
        .column_values(order_index)
        .map(|v| v.key())
        .filter(|k| !k.is_null())
        .collect();
    match filtered.order_items.column_index("order_id") {
        Some(item_order_index) => filtered
            .order_items
            .retain_rows(|row| new_orders.contains(&row[item_order_index].key())),
        None => filtered.order_items.retain_rows(|_| false),
    }

    info!(
        orders = filtered.orders.len(),
        order_items = filtered.order_items.len(),
        %watermark,
        "filtered staging data to new orders"
    );
    Some(filtered)
}

pub fn merge_daily_revenue(
    existing: &[DailyRevenueByCategory],
    fresh: &[DailyRevenueByCategory],
    policy: MergePolicy,
) -> Vec<DailyRevenueByCategory> {
    let mut merged: BTreeMap<(NaiveDate, String), DailyRevenueByCategory> = existing
        .iter()
        .map(|row| ((row.date, row.category.clone()), row.clone()))
        .collect();

    for row in fresh {
        let key = (row.date, row.category.clone());
        match (policy, merged.get_mut(&key)) {
            (MergePolicy::Reaggregate, Some(current)) => {
                current.total_revenue += row.total_revenue;
                current.order_count += row.order_count;
            }
            _ => {
                merged.insert(key, row.clone());
            }
        }
    }
    merged.into_values().collect()
}

/// Re-aggregates top items by `item_id`, summing measures across runs.
///
/// The newest name and category win when they differ between runs.
pub fn merge_top_items(
    existing: &[TopSellingItem],
    fresh: &[TopSellingItem],
) -> Vec<TopSellingItem> {
    let mut merged: BTreeMap<&str, TopSellingItem> = BTreeMap::new();
    for item in existing.iter().chain(fresh) {
        match merged.get_mut(item.item_id.as_str()) {
            Some(current) => {
                current.item_name.clone_from(&item.item_name);
                current.category.clone_from(&item.category);
                current.total_quantity_sold += item.total_quantity_sold;
                current.total_revenue += item.total_revenue;
            }
            None => {
                merged.insert(item.item_id.as_str(), item.clone());
            }
        }
    }
    let mut items = merged.into_values().collect::<Vec<_>>();
    sort_top_items(&mut items);
    items
}

/// Merges category metrics under `policy`.
///
/// With [`MergePolicy::Reaggregate`] the distinct-item count comes from `item_catalog`
/// (the merged top items), since distinct counts cannot be summed across runs.
pub fn merge_category_metrics(
    existing: &[CategoryMetrics],
    fresh: &[CategoryMetrics],
    policy: MergePolicy,
    item_catalog: &[TopSellingItem],
) -> Result<Vec<CategoryMetrics>, MetricsError> {
    let mut merged: BTreeMap<String, CategoryMetrics> = existing
        .iter()
        .map(|row| (row.category.clone(), row.clone()))
        .collect();

    let mut catalog: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for item in item_catalog {
        catalog
            .entry(item.category.as_str())
            .or_default()
            .insert(item.item_id.as_str());
    }

    for row in fresh {
        let combined = match (policy, merged.get(&row.category)) {
            (MergePolicy::Reaggregate, Some(current)) => {
                let known = catalog.get(row.category.as_str()).map_or(0, |ids| ids.len() as i64);
                category_metrics_from_totals(
                    &row.category,
                    current.order_count + row.order_count,
                    current.total_revenue + row.total_revenue,
                    current.total_items_sold + row.total_items_sold,
                    known
                        .max(current.unique_items_count)
                        .max(row.unique_items_count),
                )?
            }
            _ => row.clone(),
        };
        merged.insert(row.category.clone(), combined);
    }

    let mut metrics = merged.into_values().collect::<Vec<_>>();
    sort_category_metrics(&mut metrics);
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::compute_aggregates;
    use rodp_core::{CompleteOrderLine, Entity, Table, Value};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn line(
        order_id: i64,
        day: u32,
        item: &str,
        category: &str,
        qty: i64,
        price: f64,
    ) -> CompleteOrderLine {
        CompleteOrderLine {
            order_id,
            customer_id: None,
            order_date: date(day),
            item_id: item.into(),
            item_name: Some(format!("{item} name")),
            category: Some(category.into()),
            quantity: qty,
            unit_price: price,
            item_revenue: qty as f64 * price,
        }
    }

    fn history() -> Vec<CompleteOrderLine> {
        vec![
            line(1, 1, "I1", "Food", 2, 10.0),
            line(1, 1, "I2", "Drink", 1, 3.0),
            line(2, 2, "I1", "Food", 1, 10.0),
            line(3, 3, "I3", "Food", 4, 2.5),
            line(4, 4, "I2", "Drink", 2, 3.0),
            line(4, 4, "I4", "Dessert", 1, 6.0),
            line(5, 5, "I1", "Food", 3, 10.0),
        ]
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 0.01
    }

    #[test]
    fn incremental_without_watermark_degrades_to_full() {
        assert_eq!(
            decide_mode(RunMode::Incremental, None),
            ModeDecision::Full { degraded: true }
        );
        assert_eq!(decide_mode(RunMode::Full, Some(date(3))).mode(), RunMode::Full);
        let decision = decide_mode(RunMode::Incremental, Some(date(3)));
        assert_eq!(decision.watermark(), Some(date(3)));
    }

    fn staging() -> StagingData {
        let orders = Table::with_rows(
            Table::for_entity(Entity::Orders).columns().to_vec(),
            vec![
                vec![1i64.into(), "C1".into(), "2024-01-01".into(), 1.0.into()],
                vec![2i64.into(), "C1".into(), "2024-01-03".into(), 1.0.into()],
                vec![3i64.into(), "C2".into(), "bad".into(), 1.0.into()],
            ],
        );
        let items = Table::with_rows(
            Table::for_entity(Entity::OrderItems).columns().to_vec(),
            vec![
                vec![1i64.into(), "I1".into(), 1i64.into(), 1.0.into()],
                vec![2i64.into(), "I1".into(), 1i64.into(), 1.0.into()],
                vec![3i64.into(), "I1".into(), 1i64.into(), 1.0.into()],
            ],
        );
        let menu = Table::with_rows(
            Table::for_entity(Entity::MenuItems).columns().to_vec(),
            vec![vec!["I1".into(), "Burger".into(), "Food".into(), Value::Null]],
        );
        StagingData {
            orders,
            order_items: items,
            menu_items: menu,
        }
    }

    #[test]
    fn watermark_filter_keeps_newer_orders_and_their_items() {
        let filtered = filter_since_watermark(&staging(), date(2)).unwrap();
        assert_eq!(filtered.orders.len(), 1);
        assert_eq!(filtered.orders.value(0, "order_id"), Some(&Value::Int(2)));
        assert_eq!(filtered.order_items.len(), 1);
        assert_eq!(filtered.menu_items.len(), 1);
    }

    #[test]
    fn watermark_filter_reports_no_new_data() {
        assert!(filter_since_watermark(&staging(), date(3)).is_none());
        assert!(filter_since_watermark(&StagingData::default(), date(3)).is_none());
    }

    #[test]
    fn top_items_merge_sums_by_item() {
        let existing = vec![TopSellingItem {
            item_id: "I1".into(),
            item_name: "Burger".into(),
            category: "Food".into(),
            total_quantity_sold: 2,
            total_revenue: 20.0,
        }];
        let fresh = vec![
            TopSellingItem {
                item_id: "I2".into(),
                item_name: "Soda".into(),
                category: "Drink".into(),
                total_quantity_sold: 4,
                total_revenue: 8.0,
            },
            TopSellingItem {
                item_id: "I1".into(),
                item_name: "Cheeseburger".into(),
                category: "Food".into(),
                total_quantity_sold: 3,
                total_revenue: 30.0,
            },
        ];
        let merged = merge_top_items(&existing, &fresh);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].item_id, "I1");
        assert_eq!(merged[0].item_name, "Cheeseburger");
        assert_eq!(merged[0].total_quantity_sold, 5);
        assert_eq!(merged[0].total_revenue, 50.0);
    }

    #[test]
    fn replace_by_key_overwrites_existing_rows() {
        let existing = vec![DailyRevenueByCategory {
            date: date(1),
            category: "Food".into(),
            total_revenue: 5.0,
            order_count: 1,
        }];
        let fresh = vec![DailyRevenueByCategory {
            date: date(1),
            category: "Food".into(),
            total_revenue: 7.0,
            order_count: 2,
        }];
        let replaced = merge_daily_revenue(&existing, &fresh, MergePolicy::ReplaceByKey);
        assert_eq!(replaced, fresh);
        let summed = merge_daily_revenue(&existing, &fresh, MergePolicy::Reaggregate);
        assert_eq!(summed[0].total_revenue, 12.0);
        assert_eq!(summed[0].order_count, 3);
    }

    #[test]
    fn split_runs_match_a_full_run() {
        let lines = history();
        let full = compute_aggregates(&lines).unwrap();

        let (before, after): (Vec<_>, Vec<_>) =
            lines.into_iter().partition(|l| l.order_date <= date(3));
        let first = compute_aggregates(&before).unwrap();
        let second = compute_aggregates(&after).unwrap();

        let top = merge_top_items(&first.top_items, &second.top_items);
        assert_eq!(top.len(), full.top_items.len());
        for item in &full.top_items {
            let merged = top.iter().find(|t| t.item_id == item.item_id).unwrap();
            assert_eq!(merged.total_quantity_sold, item.total_quantity_sold);
            assert!(close(merged.total_revenue, item.total_revenue));
        }

        for policy in [MergePolicy::ReplaceByKey, MergePolicy::Reaggregate] {
            let daily = merge_daily_revenue(&first.daily_revenue, &second.daily_revenue, policy);
            assert_eq!(daily.len(), full.daily_revenue.len());
            for (merged, expected) in daily.iter().zip(&full.daily_revenue) {
                assert_eq!((merged.date, &merged.category), (expected.date, &expected.category));
                assert!(close(merged.total_revenue, expected.total_revenue));
                assert_eq!(merged.order_count, expected.order_count);
            }
        }

        let metrics = merge_category_metrics(
            &first.category_metrics,
            &second.category_metrics,
            MergePolicy::Reaggregate,
            &top,
        )
        .unwrap();
        assert_eq!(metrics.len(), full.category_metrics.len());
        for expected in &full.category_metrics {
            let merged = metrics.iter().find(|m| m.category == expected.category).unwrap();
            assert_eq!(merged.order_count, expected.order_count);
            assert_eq!(merged.total_items_sold, expected.total_items_sold);
            assert_eq!(merged.unique_items_count, expected.unique_items_count);
            assert!(close(merged.total_revenue, expected.total_revenue));
            assert!(close(merged.avg_revenue_per_order, expected.avg_revenue_per_order));
            assert!(close(merged.avg_items_per_order, expected.avg_items_per_order));
        }
    }

    #[test]
    fn repeated_incremental_merges_stay_consistent() {
        let lines = history();
        let full = compute_aggregates(&lines).unwrap();

        let mut daily = Vec::new();
        let mut top = Vec::new();
        let mut metrics = Vec::new();
        for day in 1..=5 {
            let slice = lines
                .iter()
                .filter(|l| l.order_date == date(day))
                .cloned()
                .collect::<Vec<_>>();
            let fresh = compute_aggregates(&slice).unwrap();
            daily = merge_daily_revenue(&daily, &fresh.daily_revenue, MergePolicy::Reaggregate);
            top = merge_top_items(&top, &fresh.top_items);
            metrics = merge_category_metrics(
                &metrics,
                &fresh.category_metrics,
                MergePolicy::Reaggregate,
                &top,
            )
            .unwrap();
        }

        assert_eq!(daily.len(), full.daily_revenue.len());
        let food = metrics.iter().find(|m| m.category == "Food").unwrap();
        let expected = full.category_metrics.iter().find(|m| m.category == "Food").unwrap();
        assert_eq!(food.order_count, expected.order_count);
        assert_eq!(food.unique_items_count, expected.unique_items_count);
        assert!(close(food.avg_revenue_per_order, expected.avg_revenue_per_order));
    }

    #[test]
    fn replace_policy_keeps_only_fresh_category_rows() {
        let lines = history();
        let (before, after): (Vec<_>, Vec<_>) =
            lines.into_iter().partition(|l| l.order_date <= date(3));
        let first = compute_aggregates(&before).unwrap();
        let second = compute_aggregates(&after).unwrap();
        let merged = merge_category_metrics(
            &first.category_metrics,
            &second.category_metrics,
            MergePolicy::ReplaceByKey,
            &[],
        )
        .unwrap();
        let food = merged.iter().find(|m| m.category == "Food").unwrap();
        let fresh_food = second.category_metrics.iter().find(|m| m.category == "Food").unwrap();
        assert_eq!(food, fresh_food);
    }
}
