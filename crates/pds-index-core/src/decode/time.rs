//! Time-column detection and text → timestamp conversion.
//!
//! Archives are not consistent about timestamp formatting across decades of
//! deliveries, so conversion is tiered. Each tier reports an explicit
//! outcome and the next one is tried only when the previous failed:
//!
//! 1. infer one format from the first value and apply it to the column,
//! 2. try every known calendar format per value,
//! 3. day-of-year `YYYY-DDD[Thh[:mm[:ss[.ffffff]]]]` with partial precision.
//!
//! Placeholders (`UNK`, `N/A`, `NULL`, `NONE`) and empty values are missing.
//! Values are UTC whether or not they carry a `Z`.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray, TimestampMicrosecondArray};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

/// Timezone attached to converted columns.
pub const UTC: &str = "UTC";

const PLACEHOLDERS: [&str; 4] = ["UNK", "N/A", "NULL", "NONE"];

/// Whether a column name denotes a calendar time.
///
/// Names containing `TIME` qualify, except counts and local/dwell times,
/// which hold clock readings or durations.
pub fn is_time_column(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.contains("TIME")
        && !upper.contains("COUNT")
        && !upper.contains("LOCAL_TIME")
        && !upper.contains("DWELL_TIME")
}

/// Whether `value` is a known missing-value placeholder.
pub fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || PLACEHOLDERS.iter().any(|p| v.eq_ignore_ascii_case(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Rfc3339,
    DateTime(&'static str),
    Date(&'static str),
}

const FORMATS: &[Format] = &[
    Format::DateTime("%Y-%m-%dT%H:%M:%S%.f"),
    Format::DateTime("%Y-%jT%H:%M:%S%.f"),
    Format::Rfc3339,
    Format::DateTime("%Y-%m-%d %H:%M:%S%.f"),
    Format::DateTime("%Y-%m-%dT%H:%M"),
    Format::DateTime("%Y/%m/%d %H:%M:%S%.f"),
    Format::Date("%Y-%m-%d"),
    Format::Date("%Y/%m/%d"),
    Format::Date("%Y-%j"),
];

fn strip_zulu(value: &str) -> &str {
    value
        .strip_suffix('Z')
        .or_else(|| value.strip_suffix('z'))
        .unwrap_or(value)
}

fn parse_with(format: Format, value: &str) -> Option<i64> {
    match format {
        Format::Rfc3339 => DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| dt.timestamp_micros()),
        Format::DateTime(f) => NaiveDateTime::parse_from_str(strip_zulu(value), f)
            .ok()
            .map(|dt| dt.and_utc().timestamp_micros()),
        Format::Date(f) => NaiveDate::parse_from_str(strip_zulu(value), f)
            .ok()
            .map(|d| d.and_time(NaiveTime::MIN).and_utc().timestamp_micros()),
    }
}

fn parse_any(value: &str) -> Option<i64> {
    FORMATS.iter().find_map(|f| parse_with(*f, value))
}

/// Parse `YYYY-DDD[Thh[:mm[:ss[.frac]]]][Z]`, allowing missing trailing
/// components.
pub fn parse_day_of_year(value: &str) -> Option<i64> {
    let value = strip_zulu(value.trim());
    let (date, time) = match value.split_once(['T', 't']) {
        Some((d, t)) => (d, Some(t)),
        None => (value, None),
    };

    let (year, doy) = date.split_once('-')?;
    if year.len() != 4 || doy.is_empty() || doy.len() > 3 {
        return None;
    }
    let year: i32 = year.parse().ok()?;
    let doy: u32 = doy.parse().ok()?;
    let date = NaiveDate::from_yo_opt(year, doy)?;

    let mut hms = [0u32; 3];
    let mut micros = 0u32;
    if let Some(time) = time.filter(|t| !t.is_empty()) {
        let (clock, frac) = match time.split_once('.') {
            Some((c, f)) => (c, Some(f)),
            None => (time, None),
        };
        let parts: Vec<&str> = clock.split(':').collect();
        if parts.len() > 3 || parts.iter().any(|p| p.is_empty() || p.len() > 2) {
            return None;
        }
        for (slot, part) in hms.iter_mut().zip(&parts) {
            *slot = part.parse().ok()?;
        }
        if let Some(frac) = frac {
            if parts.len() != 3 || frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let digits: String = frac.chars().chain(std::iter::repeat('0')).take(6).collect();
            micros = digits.parse().ok()?;
        }
    }

    let time = NaiveTime::from_hms_micro_opt(hms[0], hms[1], hms[2], micros)?;
    Some(date.and_time(time).and_utc().timestamp_micros())
}

/// Which tier converted a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeTier {
    /// One format inferred from the first value.
    SingleFormat,
    /// Per-value format search.
    MixedFormat,
    /// Day-of-year fallback.
    DayOfYear,
}

/// Outcome of converting one text column.
#[derive(Debug)]
pub enum TimeConversion {
    /// Converted column and the tier that succeeded.
    Converted(ArrayRef, TimeTier),
    /// No tier could parse every value; the first offending value is kept
    /// for diagnostics.
    Failed {
        /// First value no tier accepted.
        sample: String,
    },
}

fn run_tier(values: &[Option<&str>], parse: impl Fn(&str) -> Option<i64>) -> Result<Vec<Option<i64>>, String> {
    values
        .iter()
        .map(|v| match v {
            None => Ok(None),
            Some(s) => parse(s).map(Some).ok_or_else(|| (*s).to_string()),
        })
        .collect()
}

fn to_array(values: Vec<Option<i64>>) -> ArrayRef {
    Arc::new(TimestampMicrosecondArray::from(values).with_timezone(UTC))
}

/// Convert a text column to `Timestamp(Microsecond, "UTC")`.
pub fn convert_time_column(column: &StringArray) -> TimeConversion {
    let values: Vec<Option<&str>> = (0..column.len())
        .map(|i| {
            if column.is_null(i) {
                None
            } else {
                Some(column.value(i).trim()).filter(|v| !is_placeholder(v))
            }
        })
        .collect();

    let Some(first) = values.iter().flatten().next() else {
        return TimeConversion::Converted(to_array(vec![None; values.len()]), TimeTier::SingleFormat);
    };

    if let Some(format) = FORMATS.iter().copied().find(|f| parse_with(*f, first).is_some())
        && let Ok(out) = run_tier(&values, |s| parse_with(format, s))
    {
        return TimeConversion::Converted(to_array(out), TimeTier::SingleFormat);
    }

    let sample = match run_tier(&values, parse_any) {
        Ok(out) => return TimeConversion::Converted(to_array(out), TimeTier::MixedFormat),
        Err(sample) => sample,
    };

    match run_tier(&values, parse_day_of_year) {
        Ok(out) => TimeConversion::Converted(to_array(out), TimeTier::DayOfYear),
        // The per-value search saw the most formats, so its rejection is the
        // informative one.
        Err(_) => TimeConversion::Failed { sample },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn micros(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .timestamp_micros()
    }

    fn converted(values: &[&str]) -> (TimestampMicrosecondArray, TimeTier) {
        let col = StringArray::from(values.to_vec());
        match convert_time_column(&col) {
            TimeConversion::Converted(arr, tier) => (
                arr.as_any()
                    .downcast_ref::<TimestampMicrosecondArray>()
                    .unwrap()
                    .clone(),
                tier,
            ),
            TimeConversion::Failed { sample } => panic!("failed on {sample}"),
        }
    }

    #[test]
    fn time_column_detection() {
        assert!(is_time_column("START_TIME"));
        assert!(is_time_column("PRODUCT_CREATION_TIME"));
        assert!(!is_time_column("SPACECRAFT_CLOCK_START_COUNT"));
        assert!(!is_time_column("START_TIME_COUNT"));
        assert!(!is_time_column("LOCAL_TIME"));
        assert!(!is_time_column("DWELL_TIME"));
        assert!(!is_time_column("VOLUME_ID"));
    }

    #[test]
    fn single_format_with_placeholders() {
        let (arr, tier) = converted(&["2006-03-24T04:30:00.000", "UNK", "2007-01-01T00:00:01Z", "n/a"]);
        assert_eq!(tier, TimeTier::SingleFormat);
        assert_eq!(arr.value(0), micros(2006, 3, 24, 4, 30, 0));
        assert!(arr.is_null(1));
        assert_eq!(arr.value(2), micros(2007, 1, 1, 0, 0, 1));
        assert!(arr.is_null(3));
        assert_eq!(arr.timezone(), Some("UTC"));
    }

    #[test]
    fn mixed_formats_fall_back_per_value() {
        let (arr, tier) = converted(&["2006-03-24T04:30:00", "2006-083T04:30:00.5", "2006-03-25"]);
        assert_eq!(tier, TimeTier::MixedFormat);
        assert_eq!(arr.value(1), micros(2006, 3, 24, 4, 30, 0) + 500_000);
        assert_eq!(arr.value(2), micros(2006, 3, 25, 0, 0, 0));
    }

    #[test]
    fn day_of_year_with_partial_time() {
        let (arr, tier) = converted(&["1997-012T12", "1997-012T12:30", "1997-365T23:59:59.123456Z"]);
        assert_eq!(tier, TimeTier::DayOfYear);
        assert_eq!(arr.value(0), micros(1997, 1, 12, 12, 0, 0));
        assert_eq!(arr.value(1), micros(1997, 1, 12, 12, 30, 0));
        assert_eq!(arr.value(2), micros(1997, 12, 31, 23, 59, 59) + 123_456);
    }

    #[test]
    fn unparsable_column_reports_sample() {
        let col = StringArray::from(vec!["2006-03-24", "yesterday"]);
        match convert_time_column(&col) {
            TimeConversion::Failed { sample } => assert_eq!(sample, "yesterday"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn day_of_year_rejects_garbage() {
        assert_eq!(parse_day_of_year("1997-400"), None);
        assert_eq!(parse_day_of_year("97-012"), None);
        assert_eq!(parse_day_of_year("1997-012T25"), None);
        assert_eq!(parse_day_of_year("1997-012T12.5"), None);
        assert!(parse_day_of_year("1997-012").is_some());
    }
}
