//! Soft validation of enrichment fields. Nothing here rejects a row; a bad
//! value is dropped or kept and reported as a [`ValidationWarning`].

use std::fmt;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static email pattern"));

static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]{9,13}$").expect("static phone pattern"));

static MEETING_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)meeting\s*(?:id|number|no\.?)\s*[:#]?\s*(?P<id>[0-9][0-9 ]{5,}[0-9])")
        .expect("static meeting id pattern")
});

static PASSCODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)pass\s*(?:code|word)\s*[:#]?\s*(?P<code>\S+)").expect("static passcode pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    Email(String),
    Phone(String),
    BriefingDate(String),
    Province(String),
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email(raw) => write!(f, "malformed contact email {raw:?}"),
            Self::Phone(raw) => write!(f, "malformed contact phone {raw:?}"),
            Self::BriefingDate(raw) => write!(f, "unparseable briefing date {raw:?}"),
            Self::Province(raw) => write!(f, "unrecognized province {raw:?}"),
        }
    }
}

/// Malformed addresses are kept, only flagged.
pub fn check_email(raw: &str) -> Option<ValidationWarning> {
    (!EMAIL.is_match(raw.trim())).then(|| ValidationWarning::Email(raw.to_string()))
}

pub fn check_phone(raw: &str) -> Option<ValidationWarning> {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    (!PHONE.is_match(&digits)).then(|| ValidationWarning::Phone(raw.to_string()))
}

/// Split a combined briefing stamp such as `2025-03-10T10:00:00` or
/// `10/03/2025 10:00` into its date and `HH:MM` time.
pub fn split_briefing(raw: &str) -> (Option<NaiveDate>, Option<String>, Option<ValidationWarning>) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (None, None, None);
    }
    let (date_part, time_part) = match raw.split_once(['T', ' ']) {
        Some((date, time)) => (date.trim(), Some(time.trim())),
        None => (raw, None),
    };

    let date = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(date_part, format).ok());
    let time = time_part.and_then(clock_time);
    let warning = date
        .is_none()
        .then(|| ValidationWarning::BriefingDate(raw.to_string()));
    (date, time, warning)
}

fn clock_time(raw: &str) -> Option<String> {
    let mut parts = raw.trim_end_matches('Z').split(':');
    let hours: u32 = parts.next()?.trim().parse().ok()?;
    let minutes: u32 = parts
        .next()
        .map(|m| m.trim().get(..2).unwrap_or(m).parse())
        .transpose()
        .ok()?
        .unwrap_or(0);
    (hours < 24 && minutes < 60).then(|| format!("{hours:02}:{minutes:02}"))
}

pub fn extract_meeting_id(venue: &str) -> Option<String> {
    MEETING_ID
        .captures(venue)
        .and_then(|caps| caps.name("id"))
        .map(|m| m.as_str().chars().filter(|c| c.is_ascii_digit()).collect())
}

pub fn extract_passcode(venue: &str) -> Option<String> {
    PASSCODE
        .captures(venue)
        .and_then(|caps| caps.name("code"))
        .map(|m| m.as_str().trim_end_matches([',', ';', '.', ')']).to_string())
        .filter(|code| !code.is_empty())
}
