use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{normalize_url, sanitize_text};

/// Earliest accepted publication year.
const MIN_YEAR: i32 = 1970;

/// Reasons a raw record is refused before persistence.
///
/// Rejections are input defects: the record is skipped and logged, the
/// surrounding batch carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("date `{0}` is not a valid YYYY-MM-DD day")]
    InvalidDate(String),

    #[error("year {year} outside accepted range 1970..={max}")]
    YearOutOfRange { year: i32, max: i32 },

    #[error("link `{0}` is not an absolute URL")]
    InvalidLink(String),
}

/// A record as it appears in a page or delta file, before validation.
///
/// Every column is optional so that partially broken rows still deserialize
/// and can be rejected with a precise reason. `rss` is accepted as the legacy
/// name of the `source` column.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawItem {
    pub title: Option<String>,
    pub author: Option<String>,
    pub link: Option<String>,
    pub home: Option<String>,
    #[serde(alias = "rss")]
    pub source: Option<String>,
    pub date: Option<String>,
    pub timestamp: Option<String>,
    pub tags: Option<String>,
}

/// One aggregated entry.
///
/// Field order is the on-disk column order:
/// `title,author,link,home,source,date,timestamp,tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub title: String,
    pub author: String,
    pub link: String,
    pub home: String,
    pub source: String,
    #[serde(serialize_with = "serialize_date")]
    pub date: NaiveDate,
    pub timestamp: i64,
    pub tags: Option<String>,
}

impl Item {
    /// `YYYYMM` key of the month this item belongs to.
    pub fn month_key(&self) -> String {
        self.date.format("%Y%m").to_string()
    }
}

fn serialize_date<S: serde::Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&date.format("%Y-%m-%d"))
}

/// Validates and normalizes a raw record against the current calendar year.
pub fn validate(raw: RawItem) -> Result<Item, Rejection> {
    validate_for_year(raw, Utc::now().year())
}

/// Validates and normalizes a raw record; `current_year + 1` is the latest
/// accepted year.
pub fn validate_for_year(raw: RawItem, current_year: i32) -> Result<Item, Rejection> {
    let title = sanitize_text(required(raw.title.as_deref(), "title")?);
    if title.is_empty() {
        return Err(Rejection::MissingField("title"));
    }
    let link = required(raw.link.as_deref(), "link")?;
    let date_str = required(raw.date.as_deref(), "date")?;

    let date = parse_strict_date(date_str)?;
    let max_year = current_year + 1;
    if !(MIN_YEAR..=max_year).contains(&date.year()) {
        return Err(Rejection::YearOutOfRange {
            year: date.year(),
            max: max_year,
        });
    }

    let link = normalize_url(link);
    if url::Url::parse(link).is_err() {
        return Err(Rejection::InvalidLink(link.to_string()));
    }

    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or_else(|| midnight_utc(date));

    let tags = raw
        .tags
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    Ok(Item {
        title: title.into_owned(),
        author: sanitize_text(raw.author.as_deref().unwrap_or_default()).into_owned(),
        link: link.to_string(),
        home: normalize_url(raw.home.as_deref().unwrap_or_default()).to_string(),
        source: normalize_url(raw.source.as_deref().unwrap_or_default()).to_string(),
        date,
        timestamp,
        tags,
    })
}

fn required<'a>(value: Option<&'a str>, field: &'static str) -> Result<&'a str, Rejection> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Rejection::MissingField(field)),
    }
}

/// Strict `YYYY-MM-DD`: exactly ten characters, dashes at 4 and 7, digits elsewhere.
fn parse_strict_date(s: &str) -> Result<NaiveDate, Rejection> {
    let bytes = s.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shape_ok {
        return Err(Rejection::InvalidDate(s.to_string()));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| Rejection::InvalidDate(s.to_string()))
}

/// Accepts integer seconds and the legacy float form (`1690000000.0`).
fn parse_timestamp(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Some(secs);
    }
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(|f| f.trunc() as i64)
}

fn midnight_utc(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}
