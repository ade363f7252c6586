//! Splits a snapshot of dated items into "next upcoming" and "recent past".
//!
//! Pure and synchronous: the same `(items, now)` always gives the same
//! `Timeline`, whatever order the snapshot arrived in.
use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::model::DatedItem;

/// How many past items the timeline keeps.
pub const RECENT_PAST_LIMIT: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    /// Earliest item dated at or after `now`.
    pub next: Option<DatedItem>,
    /// Latest items dated before `now`, newest first.
    pub recent_past: Vec<DatedItem>,
}

fn earliest_first(a: &DatedItem, b: &DatedItem) -> Ordering {
    a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id))
}

fn latest_first(a: &DatedItem, b: &DatedItem) -> Ordering {
    b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id))
}

/// Partition a snapshot around `now`.
///
/// An item dated exactly `now` counts as upcoming. Ties on date are broken
/// by ascending id, both for `next` and inside `recent_past`.
pub fn partition(items: &[DatedItem], now: DateTime<Utc>) -> Timeline {
    let next = items
        .iter()
        .filter(|item| item.date >= now)
        .min_by(|a, b| earliest_first(a, b))
        .cloned();

    let mut past: Vec<&DatedItem> = items.iter().filter(|item| item.date < now).collect();
    past.sort_by(|a, b| latest_first(a, b));
    past.truncate(RECENT_PAST_LIMIT);

    Timeline {
        next,
        recent_past: past.into_iter().cloned().collect(),
    }
}

/// Calendar view: items grouped by their UTC day, earliest first within a day.
pub fn calendar_marks(items: &[DatedItem]) -> BTreeMap<NaiveDate, Vec<DatedItem>> {
    let mut marks: BTreeMap<NaiveDate, Vec<DatedItem>> = BTreeMap::new();
    for item in items {
        marks
            .entry(item.date.date_naive())
            .or_default()
            .push(item.clone());
    }
    for day in marks.values_mut() {
        day.sort_by(earliest_first);
    }
    marks
}

/// Items falling on `day` (UTC), earliest first.
pub fn items_on(items: &[DatedItem], day: NaiveDate) -> Vec<DatedItem> {
    let mut found: Vec<DatedItem> = items
        .iter()
        .filter(|item| item.date.date_naive() == day)
        .cloned()
        .collect();
    found.sort_by(earliest_first);
    found
}
