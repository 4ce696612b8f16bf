use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use mailparse::dateparse;

use crate::MailError;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A parsed header date. Inputs without an offset stay naive so the
/// normalized form does not invent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedDate {
    Zoned(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl ParsedDate {
    pub fn to_iso(&self) -> String {
        match self {
            ParsedDate::Zoned(dt) => dt.to_rfc3339(),
            ParsedDate::Naive(naive) => naive.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
        }
    }

    /// Naive dates are read as local time.
    pub fn to_system_time(&self) -> Option<SystemTime> {
        match self {
            ParsedDate::Zoned(dt) => Some(SystemTime::from(*dt)),
            ParsedDate::Naive(naive) => Local
                .from_local_datetime(naive)
                .earliest()
                .map(SystemTime::from),
        }
    }
}

pub fn parse_date(raw: &str) -> Option<ParsedDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(ParsedDate::Zoned(dt));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(ParsedDate::Zoned(dt));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ParsedDate::Naive(naive));
        }
    }
    if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return day.and_hms_opt(0, 0, 0).map(ParsedDate::Naive);
    }
    // Last resort for sloppy RFC 2822 variants; the offset is folded into UTC.
    let ts = dateparse(raw).ok()?;
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| ParsedDate::Zoned(dt.fixed_offset()))
}

/// Default date normalizer: any supported header date to RFC 3339.
pub fn normalize_date(raw: &str) -> Result<String, MailError> {
    parse_date(raw)
        .map(|parsed| parsed.to_iso())
        .ok_or_else(|| MailError::InvalidDate {
            value: raw.to_string(),
        })
}

/// Current local time with its offset, the stamp given to new drafts.
pub fn local_now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}
