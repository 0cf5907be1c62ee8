use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Mon..Fri.
pub const DAYS_PER_WEEK: usize = 5;

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .with_context(|| format!("Invalid date '{raw}'. Expected YYYY-MM-DD"))
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
        .with_context(|| format!("Invalid timestamp '{raw}'. Expected YYYY-MM-DD HH:MM"))
}

/// Parses a time of day of the form `HH:00` into an hour.
pub fn parse_hour_of_day(raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    let (hours, minutes) = trimmed
        .split_once(':')
        .with_context(|| format!("Invalid time of day '{raw}'. Expected HH:00"))?;
    let hour: u32 = hours
        .parse()
        .with_context(|| format!("Invalid time of day '{raw}'. Expected HH:00"))?;
    if minutes != "00" || hours.len() != 2 || hour > 23 {
        anyhow::bail!("Invalid time of day '{raw}'. Expected HH:00");
    }
    Ok(hour)
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn format_timestamp(timestamp: NaiveDateTime) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_hour_of_day(hour: u32) -> String {
    format!("{hour:02}:00")
}

pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(0, 0, 0).unwrap_or_default()
}

/// Shift `timestamp` by `offset_hours` and then step whole days in the same
/// direction until the result no longer falls on a weekend. The hour of day
/// is preserved while skipping. Exchange holidays are not considered.
pub fn business_hours_adjust(timestamp: NaiveDateTime, offset_hours: i64) -> NaiveDateTime {
    let mut adjusted = timestamp + Duration::hours(offset_hours);
    if offset_hours == 0 {
        return adjusted;
    }
    let step = Duration::hours(24 * offset_hours.signum());
    while is_weekend(adjusted.weekday()) {
        adjusted += step;
    }
    adjusted
}

pub fn is_weekend(weekday: Weekday) -> bool {
    matches!(weekday, Weekday::Sat | Weekday::Sun)
}

/// Index into Mon..Fri buckets, `None` for weekend timestamps.
pub fn weekday_index(timestamp: NaiveDateTime) -> Option<usize> {
    let index = timestamp.weekday().num_days_from_monday() as usize;
    (index < DAYS_PER_WEEK).then_some(index)
}

pub fn weekday_from_index(index: usize) -> Option<Weekday> {
    match index {
        0 => Some(Weekday::Mon),
        1 => Some(Weekday::Tue),
        2 => Some(Weekday::Wed),
        3 => Some(Weekday::Thu),
        4 => Some(Weekday::Fri),
        _ => None,
    }
}

pub fn hour_of_day(timestamp: NaiveDateTime) -> u32 {
    timestamp.hour()
}

/// Whole calendar months from `(year, month)` pairs, used as a dense index.
pub fn month_ordinal(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

/// Same calendar day `years` earlier, clamped to Feb 28 for leap days.
pub fn years_before(date: NaiveDate, years: i32) -> NaiveDate {
    let year = date.year() - years;
    NaiveDate::from_ymd_opt(year, date.month(), date.day())
        .or_else(|| NaiveDate::from_ymd_opt(year, date.month(), 28))
        .unwrap_or(date)
}

/// Serde adapters for the textual formats used in YAML files.
pub mod serde_format {
    use chrono::{NaiveDate, NaiveDateTime};
    use serde::{Deserialize, Deserializer, Serializer};

    pub mod date {
        use super::*;

        pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(&date.format(crate::calendar::DATE_FORMAT))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDate, D::Error> {
            let raw = String::deserialize(deserializer)?;
            crate::calendar::parse_date(&raw).map_err(serde::de::Error::custom)
        }
    }

    pub mod optional_date {
        use super::*;

        pub fn serialize<S: Serializer>(
            date: &Option<NaiveDate>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match date {
                Some(date) => serializer.collect_str(&date.format(crate::calendar::DATE_FORMAT)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDate>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| crate::calendar::parse_date(&value))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod date_list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(dates: &[NaiveDate], serializer: S) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(dates.len()))?;
            for date in dates {
                seq.serialize_element(&crate::calendar::format_date(*date))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<NaiveDate>, D::Error> {
            let raw = Vec::<String>::deserialize(deserializer)?;
            raw.iter()
                .map(|value| crate::calendar::parse_date(value))
                .collect::<anyhow::Result<Vec<_>>>()
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod timestamp_list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(
            timestamps: &[NaiveDateTime],
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(timestamps.len()))?;
            for timestamp in timestamps {
                seq.serialize_element(&crate::calendar::format_timestamp(*timestamp))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<NaiveDateTime>, D::Error> {
            let raw = Vec::<String>::deserialize(deserializer)?;
            raw.iter()
                .map(|value| crate::calendar::parse_timestamp(value))
                .collect::<anyhow::Result<Vec<_>>>()
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod hour_of_day {
        use super::*;

        pub fn serialize<S: Serializer>(hour: &u32, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&crate::calendar::format_hour_of_day(*hour))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
            let raw = String::deserialize(deserializer)?;
            crate::calendar::parse_hour_of_day(&raw).map_err(serde::de::Error::custom)
        }
    }

    pub mod optional_hour_of_day {
        use super::*;

        pub fn serialize<S: Serializer>(hour: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
            match hour {
                Some(hour) => serializer.serialize_str(&crate::calendar::format_hour_of_day(*hour)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u32>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| crate::calendar::parse_hour_of_day(&value))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod hour_list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(hours: &[u32], serializer: S) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(hours.len()))?;
            for hour in hours {
                seq.serialize_element(&crate::calendar::format_hour_of_day(*hour))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u32>, D::Error> {
            let raw = Vec::<String>::deserialize(deserializer)?;
            raw.iter()
                .map(|value| crate::calendar::parse_hour_of_day(value))
                .collect::<anyhow::Result<Vec<_>>>()
                .map_err(serde::de::Error::custom)
        }
    }
}
