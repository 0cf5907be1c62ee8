use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use tracing::debug;

use crate::contract::GlobexCode;
use crate::data::DailyRow;
use crate::feature::DailyRecord;

/// Daily rows of one date ordered by descending open interest. Ties keep
/// their input order.
#[derive(Debug, Clone)]
pub struct DatedRows {
    pub date: NaiveDate,
    pub rows: Vec<DailyRow>,
}

/// Groups rows by calendar date (ascending) and ranks each group by open
/// interest.
pub fn group_by_date(rows: Vec<DailyRow>) -> Vec<DatedRows> {
    let mut grouped: BTreeMap<NaiveDate, Vec<DailyRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.date).or_default().push(row);
    }
    grouped
        .into_iter()
        .map(|(date, mut rows)| {
            rows.sort_by(|a, b| b.open_interest.cmp(&a.open_interest));
            DatedRows { date, rows }
        })
        .collect()
}

/// Continuous series for one stream: which contract was selected on each
/// date and the resulting daily closes.
#[derive(Debug, Clone, Default)]
pub struct RollResult {
    pub front: BTreeMap<NaiveDate, GlobexCode>,
    pub daily_records: Vec<DailyRecord>,
}

impl RollResult {
    pub fn contract_on(&self, date: NaiveDate) -> Option<&GlobexCode> {
        self.front.get(&date)
    }
}

/// Selects the `f_number`-th most open contract per date (1 = front).
/// Dates with fewer contracts than that are skipped.
pub fn roll(grouped: &[DatedRows], f_number: usize) -> RollResult {
    let index = f_number.saturating_sub(1);
    let mut result = RollResult::default();
    for dated in grouped {
        let Some(row) = dated.rows.get(index) else {
            debug!(date = %dated.date, f_number, "Unable to determine stream record");
            continue;
        };
        result.front.insert(dated.date, row.contract.clone());
        result.daily_records.push(DailyRecord {
            date: dated.date,
            close: row.close.to_f64().unwrap_or(f64::NAN),
        });
    }
    result
}
