//! Filter and sort projections over reconciled rows.
//!
//! Never mutates its input; returns references in the projected order.

use std::cmp::Ordering;

use crate::models::{AuditRow, LootRow};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Number(f64),
    /// ISO-ish date or timestamp; compared on its `YYYY-MM-DD` prefix.
    Date(&'a str),
    Missing,
}

impl<'a> FieldValue<'a> {
    pub fn text(v: Option<&'a str>) -> Self {
        match v {
            Some(s) if !s.trim().is_empty() => FieldValue::Text(s),
            _ => FieldValue::Missing,
        }
    }

    pub fn number(v: Option<f64>) -> Self {
        v.map(FieldValue::Number).unwrap_or(FieldValue::Missing)
    }

    pub fn date(v: Option<&'a str>) -> Self {
        match v {
            Some(s) if !s.trim().is_empty() => FieldValue::Date(s),
            _ => FieldValue::Missing,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) | FieldValue::Date(s) => Some(s.to_string()),
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Missing => None,
        }
    }
}

/// Anything a `Query` can filter and sort by named field.
pub trait Queryable {
    fn field(&self, name: &str) -> FieldValue<'_>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Field the text filter applies to.
    pub filter_field: Option<String>,
    pub filter: Option<String>,
    pub sort: Option<SortKey>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: &str, text: &str) -> Self {
        self.filter_field = Some(field.to_string());
        self.filter = Some(text.to_string());
        self
    }

    pub fn sort_by(mut self, field: &str, descending: bool) -> Self {
        self.sort = Some(SortKey {
            field: field.to_string(),
            descending,
        });
        self
    }

    pub fn apply<'a, T: Queryable>(&self, rows: &'a [T]) -> Vec<&'a T> {
        let needle = self
            .filter
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut out: Vec<&'a T> = match (&needle, &self.filter_field) {
            (Some(needle), Some(field)) => rows
                .iter()
                .filter(|r| {
                    r.field(field)
                        .as_text()
                        .map(|t| t.to_lowercase().contains(needle.as_str()))
                        .unwrap_or(false)
                })
                .collect(),
            _ => rows.iter().collect(),
        };

        if let Some(sort) = &self.sort {
            // sort_by is stable, so equal keys keep input order
            out.sort_by(|a, b| {
                let ord = compare_fields(&a.field(&sort.field), &b.field(&sort.field));
                if sort.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        out
    }
}

/// Ascending order with missing values last.
pub fn compare_fields(a: &FieldValue<'_>, b: &FieldValue<'_>) -> Ordering {
    match (a, b) {
        (FieldValue::Missing, FieldValue::Missing) => Ordering::Equal,
        (FieldValue::Missing, _) => Ordering::Greater,
        (_, FieldValue::Missing) => Ordering::Less,
        (FieldValue::Number(x), FieldValue::Number(y)) => x.total_cmp(y),
        (FieldValue::Date(x), FieldValue::Date(y)) => date_prefix(x).cmp(date_prefix(y)),
        (FieldValue::Text(x), FieldValue::Text(y)) => x
            .to_lowercase()
            .cmp(&y.to_lowercase())
            .then_with(|| x.cmp(y)),
        // mixed kinds only happen with sloppy field impls; compare as text
        (x, y) => x.as_text().cmp(&y.as_text()),
    }
}

/// `2024-03-01T20:15:00Z` → `2024-03-01`.
pub fn date_prefix(s: &str) -> &str {
    let s = s.trim();
    let end = s.find(|c: char| c == 'T' || c == ' ').unwrap_or(s.len()).min(10);
    s.get(..end).unwrap_or(s)
}

impl Queryable for LootRow {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "id" => FieldValue::Number(self.id as f64),
            "item" | "item_name" => FieldValue::text(Some(self.item_name.as_str())),
            "character" | "character_name" => FieldValue::text(self.character_name.as_deref()),
            "assigned" | "assigned_character_name" => {
                FieldValue::text(self.assigned_character_name.as_deref())
            }
            "cost" => FieldValue::number(self.cost),
            "raid_id" => FieldValue::number(self.raid_id.map(|r| r as f64)),
            _ => FieldValue::Missing,
        }
    }
}

impl Queryable for AuditRow {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "id" => FieldValue::Number(self.id as f64),
            "date" | "created_at" => FieldValue::date(self.created_at.as_deref()),
            "actor" | "actor_display_name" => FieldValue::text(self.actor_display_name.as_deref()),
            "action" => FieldValue::text(Some(self.action.as_str())),
            "target_type" => FieldValue::text(self.target_type.as_deref()),
            _ => FieldValue::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn loot(id: i64, item: &str, cost: Option<f64>) -> LootRow {
        LootRow {
            id,
            raid_id: Some(1),
            event_id: None,
            item_name: item.to_string(),
            char_id: None,
            character_name: Some("Aldric".into()),
            cost,
            assigned_char_id: None,
            assigned_character_name: None,
        }
    }

    fn ids(rows: &[&LootRow]) -> Vec<i64> {
        rows.iter().map(|r| r.id).collect()
    }

    fn sample() -> Vec<LootRow> {
        vec![
            loot(3, "Mithril Helm", Some(30.0)),
            loot(2, "bone chips", None),
            loot(1, "Amulet", Some(5.0)),
            loot(4, "mithril greaves", Some(30.0)),
        ]
    }

    #[test]
    fn test_empty_query_keeps_input_order() {
        let rows = sample();
        assert_eq!(ids(&Query::new().apply(&rows)), vec![3, 2, 1, 4]);
        assert_eq!(ids(&Query::new().filter("item", "  ").apply(&rows)), vec![3, 2, 1, 4]);
    }

    #[test]
    fn test_filter_is_case_insensitive_substring() {
        let rows = sample();
        let hits = Query::new().filter("item", "mithril").apply(&rows);
        assert_eq!(ids(&hits), vec![3, 4]);
        assert_eq!(hits[0].item_name, "Mithril Helm");
    }

    #[test]
    fn test_numeric_sort_missing_last_and_stable() {
        let rows = sample();
        let asc = Query::new().sort_by("cost", false).apply(&rows);
        assert_eq!(ids(&asc), vec![1, 3, 4, 2]);

        let desc = Query::new().sort_by("cost", true).apply(&rows);
        assert_eq!(ids(&desc), vec![2, 3, 4, 1]);
    }

    #[test]
    fn test_text_sort_case_folded() {
        let rows = sample();
        let sorted = Query::new().sort_by("item", false).apply(&rows);
        assert_eq!(ids(&sorted), vec![1, 2, 4, 3]);
    }

    #[test]
    fn test_date_prefix() {
        assert_eq!(date_prefix("2024-03-01T20:15:00Z"), "2024-03-01");
        assert_eq!(date_prefix("2024-03-01 20:15"), "2024-03-01");
        assert_eq!(date_prefix("2024-03-01"), "2024-03-01");
        assert_eq!(
            compare_fields(&FieldValue::Date("2024-03-01T23:00"), &FieldValue::Date("2024-03-01")),
            Ordering::Equal
        );
    }

    #[test]
    fn test_cost_sort_with_nan_text_costs() {
        // enough rows to leave the small-sort path
        let rows: Vec<LootRow> = (1..=64)
            .map(|i| {
                let cost = if i % 7 == 0 { json!("NaN") } else { json!((i * 37) % 50) };
                serde_json::from_value(json!({
                    "id": i,
                    "raid_id": 1,
                    "item_name": format!("Item {}", i),
                    "cost": cost
                }))
                .unwrap()
            })
            .collect();

        let sorted = Query::new().sort_by("cost", false).apply(&rows);
        assert_eq!(sorted.len(), 64);
        let costs: Vec<Option<f64>> = sorted.iter().map(|r| r.cost).collect();
        let known = costs.iter().take_while(|c| c.is_some()).count();
        assert_eq!(known, 64 - 9);
        assert!(costs[known..].iter().all(Option::is_none));
        assert!(costs[..known].windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_number_compare_is_total() {
        let nan = FieldValue::Number(f64::NAN);
        let one = FieldValue::Number(1.0);
        assert_eq!(compare_fields(&nan, &nan), Ordering::Equal);
        assert_eq!(compare_fields(&one, &nan), compare_fields(&nan, &one).reverse());
    }

    #[test]
    fn test_input_is_not_mutated() {
        let rows = sample();
        let before = rows.clone();
        let _ = Query::new().sort_by("item", true).apply(&rows);
        assert_eq!(rows, before);
    }
}
