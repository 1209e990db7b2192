use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};

/// This is the standard way of converting a date to a file name in beatkeeper.
pub fn date_to_record_name(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Calendar date of a moment in the local timezone. Daily totals and timeline files are keyed by
/// it.
pub fn local_date(moment: DateTime<Utc>) -> NaiveDate {
    moment.with_timezone(&Local).date_naive()
}

/// Start of the local day containing `moment`, expressed in UTC.
pub fn local_day_start(moment: DateTime<Utc>) -> DateTime<Utc> {
    let date = local_date(moment);
    Local
        .from_local_datetime(&date.and_time(chrono::NaiveTime::MIN))
        .earliest()
        .map(|v| v.with_timezone(&Utc))
        // Midnight can be skipped by a DST jump, the day then starts "now".
        .unwrap_or(moment)
}

/// Formats seconds as `HH:MM:SS`, hours are not wrapped.
pub fn format_tracking_time(duration: Duration) -> String {
    let seconds = duration.as_secs();
    let (hours, remainder) = (seconds / 3600, seconds % 3600);
    format!("{:02}:{:02}:{:02}", hours, remainder / 60, remainder % 60)
}
