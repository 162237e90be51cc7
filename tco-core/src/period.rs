//! Planning-period extraction from loosely structured ADO fields.
//!
//! ADO exports carry the iteration as free text ("PI 2025.I3", "Release I 3",
//! "FY24-Q1 / Iteration 2"). Parsing never fails loudly: anything that cannot
//! be resolved yields `None`, and the allocation step treats such features as
//! outside every cohort.

use std::fmt;

use chrono::{Datelike, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref YEAR4_REGEX: Regex = Regex::new(r"(?:19|20)[0-9]{2}").unwrap();
    static ref FISCAL_YEAR_REGEX: Regex = Regex::new(r"(?i)FY\s*([0-9]+)").unwrap();
    static ref ITERATION_REGEX: Regex =
        Regex::new(r"(?i)(?:PI|ITERATION|I)\s*-?\s*([0-9]+)").unwrap();
}

/// The (year, iteration) half of a cohort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub year: i32,
    pub iteration: u32,
}

impl PeriodKey {
    pub fn new(year: i32, iteration: u32) -> Self {
        Self { year, iteration }
    }

    /// Composite label such as `2025-I1`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-I{}", self.year, self.iteration)
    }
}

/// Extract the iteration number from an iteration path.
///
/// Matches an integer following `I`, `PI` or `Iteration` (case-insensitive,
/// optional whitespace and dash). When the path holds several such tokens the
/// last one wins, so `"PI 2025.I3"` resolves to 3 rather than 2025.
pub fn parse_iteration_number(iteration_path: &str) -> Option<u32> {
    ITERATION_REGEX
        .captures_iter(iteration_path)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Four-digit 19xx/20xx year embedded anywhere in the text.
pub fn parse_calendar_year(text: &str) -> Option<i32> {
    YEAR4_REGEX
        .find(text)
        .and_then(|m| m.as_str().parse().ok())
}

/// `FY24` → 2024, `FY 2025` → 2025. Other digit counts are rejected.
pub fn parse_fiscal_year(text: &str) -> Option<i32> {
    let digits = FISCAL_YEAR_REGEX.captures(text)?.get(1)?.as_str();
    let value: i32 = digits.parse().ok()?;
    match digits.len() {
        2 => Some(2000 + value),
        4 => Some(value),
        _ => None,
    }
}

/// Resolve a feature's year.
///
/// Precedence: explicit year column, 4-digit year in the iteration path,
/// `FYxx`/`FYxxxx` in the iteration path, calendar year of the last-changed
/// timestamp, calendar year of the created timestamp.
pub fn parse_year(
    explicit_year: Option<i32>,
    iteration_path: Option<&str>,
    changed_at: Option<NaiveDateTime>,
    created_at: Option<NaiveDateTime>,
) -> Option<i32> {
    explicit_year
        .or_else(|| iteration_path.and_then(parse_calendar_year))
        .or_else(|| iteration_path.and_then(parse_fiscal_year))
        .or_else(|| changed_at.or(created_at).map(|ts| ts.year()))
}

/// Both halves of the period, or `None` when either is missing.
pub fn resolve_period(
    explicit_year: Option<i32>,
    iteration_path: Option<&str>,
    changed_at: Option<NaiveDateTime>,
    created_at: Option<NaiveDateTime>,
) -> Option<PeriodKey> {
    let year = parse_year(explicit_year, iteration_path, changed_at, created_at)?;
    let iteration = iteration_path.and_then(parse_iteration_number)?;
    Some(PeriodKey::new(year, iteration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(year: i32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, 6, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn iteration_from_pi_path_takes_last_token() {
        assert_eq!(parse_iteration_number("PI 2025.I3"), Some(3));
    }

    #[test]
    fn iteration_with_word_and_extra_spaces() {
        assert_eq!(parse_iteration_number("Iteration  12"), Some(12));
    }

    #[test]
    fn iteration_with_spaced_token() {
        assert_eq!(parse_iteration_number("Release I 3"), Some(3));
        assert_eq!(parse_iteration_number("Project\\I-4"), Some(4));
        assert_eq!(parse_iteration_number("project\\i2"), Some(2));
    }

    #[test]
    fn iteration_missing() {
        assert_eq!(parse_iteration_number("FY24-Q1"), None);
        assert_eq!(parse_iteration_number(""), None);
        assert_eq!(parse_iteration_number("Backlog"), None);
    }

    #[test]
    fn fiscal_year_two_digits_means_2000s() {
        assert_eq!(parse_fiscal_year("FY24-Q1"), Some(2024));
        assert_eq!(parse_fiscal_year("fy 2026"), Some(2026));
        assert_eq!(parse_fiscal_year("FY123"), None);
    }

    #[test]
    fn year_precedence() {
        assert_eq!(parse_year(Some(2023), Some("PI 2025.I3"), None, None), Some(2023));
        assert_eq!(parse_year(None, Some("PI 2025.I3"), Some(ts(2020)), None), Some(2025));
        assert_eq!(parse_year(None, Some("FY24-Q1"), None, None), Some(2024));
        assert_eq!(parse_year(None, Some("I2"), Some(ts(2022)), Some(ts(2021))), Some(2022));
        assert_eq!(parse_year(None, Some("I2"), None, Some(ts(2021))), Some(2021));
        assert_eq!(parse_year(None, Some("I2"), None, None), None);
    }

    #[test]
    fn period_requires_both_parts() {
        assert_eq!(
            resolve_period(None, Some("PI 2025.I3"), None, None),
            Some(PeriodKey::new(2025, 3))
        );
        assert_eq!(resolve_period(None, Some("FY24-Q1"), None, None), None);
        assert_eq!(resolve_period(None, Some("I1"), None, None), None);
        assert_eq!(resolve_period(Some(2025), None, None, None), None);
    }

    #[test]
    fn label_format() {
        assert_eq!(PeriodKey::new(2025, 1).label(), "2025-I1");
    }
}
