//! Rolling 7-day bucket window.
//!
//! Every metric family is bucketed by UTC calendar day over the same window:
//! the reference date and the six days before it, oldest first. Range queries
//! use a cutoff one day earlier (reference date − 7 days at midnight UTC).

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// Number of day buckets in a window.
pub const WINDOW_DAYS: usize = 7;

/// Bucket key format (`YYYY-MM-DD`).
pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// The day buckets and range cutoff for one collection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateWindow {
    reference: DateTime<Utc>,
    days: [NaiveDate; WINDOW_DAYS],
    since: DateTime<Utc>,
}

impl DateWindow {
    /// Window ending at the UTC date of `reference`.
    pub fn ending_at(reference: DateTime<Utc>) -> Self {
        let end = reference.date_naive();
        let days = std::array::from_fn(|i| end - Duration::days((WINDOW_DAYS - 1 - i) as i64));
        let since = (end - Duration::days(WINDOW_DAYS as i64))
            .and_time(NaiveTime::MIN)
            .and_utc();

        Self {
            reference,
            days,
            since,
        }
    }

    /// Window for an explicit reference instant, or for now.
    pub fn for_reference(reference: Option<DateTime<Utc>>) -> Self {
        Self::ending_at(reference.unwrap_or_else(Utc::now))
    }

    pub fn reference(&self) -> DateTime<Utc> {
        self.reference
    }

    /// Bucket days, strictly ascending.
    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    /// Bucket keys formatted as `YYYY-MM-DD`.
    pub fn keys(&self) -> Vec<String> {
        self.days.iter().map(|d| d.format(DAY_FORMAT).to_string()).collect()
    }

    /// Start of the range used by store and relay queries.
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Exclusive upper bound: midnight UTC after the reference date.
    pub fn until(&self) -> DateTime<Utc> {
        (self.end_date() + Duration::days(1))
            .and_time(NaiveTime::MIN)
            .and_utc()
    }

    pub fn end_date(&self) -> NaiveDate {
        self.days[WINDOW_DAYS - 1]
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.days[0] && day <= self.end_date()
    }

    /// The day before the reference date.
    pub fn yesterday(&self) -> NaiveDate {
        self.days[WINDOW_DAYS - 2]
    }
}

/// UTC calendar day of a unix timestamp, if representable.
pub fn day_of_unix(secs: u64) -> Option<NaiveDate> {
    let secs = i64::try_from(secs).ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.date_naive())
}

/// Parse a `YYYY-MM-DD` date into midnight UTC.
pub fn parse_reference_date(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let date = NaiveDate::parse_from_str(raw.trim(), DAY_FORMAT)?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}
