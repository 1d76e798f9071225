use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};

/// Smallest datestamp strictly after `datestamp`, in the same granularity
///
/// `YYYY-MM-DD` advances one day and `YYYY-MM-DDThh:mm:ssZ` one second.
/// Anything else yields `None`.
pub fn next_datestamp(datestamp: &str) -> Option<String> {
    if let Ok(day) = NaiveDate::parse_from_str(datestamp, "%Y-%m-%d") {
        return day.succ_opt().map(|d| d.format("%Y-%m-%d").to_string());
    }

    if datestamp.ends_with('Z') {
        if let Ok(instant) = DateTime::parse_from_rfc3339(datestamp) {
            let next = instant.with_timezone(&Utc) + Duration::seconds(1);
            return Some(next.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }

    None
}
