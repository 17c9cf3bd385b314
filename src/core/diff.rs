// Two-year enrollment comparison for one municipality.
use serde::Serialize;

use crate::core::error::Error;
use crate::core::index::NameIndex;
use crate::core::query::{fetch_all, lookup_key};
use crate::core::record::Sex;
use crate::core::store::RecordStore;

/// Percentage reported when enrollment grows from a zero base. It is a marker,
/// not a real percentage.
pub const ZERO_BASE_GROWTH_PCT: f64 = 100.0;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiffQuery {
    pub name: String,
    pub year_from: u16,
    pub year_to: u16,
    pub sex: Option<Sex>,
}

impl DiffQuery {
    pub fn new(name: impl Into<String>, year_from: u16, year_to: u16) -> Self {
        Self {
            name: name.into(),
            year_from,
            year_to,
            sex: None,
        }
    }

    pub fn with_sex(mut self, sex: Option<Sex>) -> Self {
        self.sex = sex;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiffReport {
    pub year_from: u16,
    pub qty_from: f64,
    pub year_to: u16,
    pub qty_to: f64,
    pub difference: f64,
    pub variation_pct: f64,
}

/// Sums quantities for both years (duplicates included) and reports the change.
pub fn difference(
    store: &RecordStore,
    index: &NameIndex,
    query: &DiffQuery,
) -> Result<DiffReport, Error> {
    let key = lookup_key(index, &query.name)?;

    let mut qty_from = 0.0;
    let mut qty_to = 0.0;
    let mut matched = 0usize;
    for record in fetch_all(store, index, &key) {
        let record = record?;
        if query.sex.is_some_and(|sex| record.sex != sex) {
            continue;
        }
        // Not an else-branch: when both years are equal a record counts on both sides.
        if record.year == query.year_from {
            qty_from += record.quantity;
            matched += 1;
        }
        if record.year == query.year_to {
            qty_to += record.quantity;
            matched += 1;
        }
    }
    tracing::debug!(key = %key, matched, "difference");

    let difference = qty_to - qty_from;
    Ok(DiffReport {
        year_from: query.year_from,
        qty_from,
        year_to: query.year_to,
        qty_to,
        difference,
        variation_pct: variation_pct(qty_from, difference),
    })
}

pub fn variation_pct(qty_from: f64, difference: f64) -> f64 {
    if qty_from > 0.0 {
        difference / qty_from * 100.0
    } else if difference > 0.0 {
        ZERO_BASE_GROWTH_PCT
    } else {
        0.0
    }
}
