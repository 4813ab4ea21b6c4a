use chrono::{Datelike, NaiveDate};
use std::fmt::{self, Display};

use crate::FetchError;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One fiscal month.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1900..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }

    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn pred(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn start_date(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn end_date(self) -> NaiveDate {
        self.succ().start_date().pred_opt().unwrap_or_default()
    }

    /// Canonical `YYYY-MM` form.
    pub fn key(self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Every month from `self` through `to`, inclusive. Empty when `to < self`.
    pub fn months_through(self, to: Period) -> Vec<Period> {
        let mut out = Vec::new();
        let mut cur = self;
        while cur <= to {
            out.push(cur);
            cur = cur.succ();
        }
        out
    }

    /// Parse a single month in any of the accepted spellings:
    /// `Jan 2025`, `January 2025`, `jan-25`, `2025-01`, `2025/1`, `1/2025`,
    /// or a full date such as `2025-01-31`.
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let text = raw.trim().to_ascii_lowercase();
        if text.is_empty() {
            return Err(FetchError::invalid("empty period"));
        }
        parse_numeric(&text)
            .or_else(|| parse_named(&text))
            .ok_or_else(|| FetchError::invalid(format!("unrecognised period '{}'", raw.trim())))
    }
}

impl Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match MONTH_LABELS.get(self.month.wrapping_sub(1) as usize) {
            Some(label) => write!(f, "{label} {}", self.year),
            None => write!(f, "{}", self.key()),
        }
    }
}

fn parse_year(token: &str) -> Option<i32> {
    if !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match token.len() {
        4 => token.parse().ok(),
        2 => token.parse::<i32>().ok().map(|y| 2000 + y),
        _ => None,
    }
}

fn parse_numeric(text: &str) -> Option<Period> {
    let parts: Vec<&str> = text.split(['-', '/']).map(str::trim).collect();
    if !parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    match parts.as_slice() {
        [a, b] if a.len() == 4 => Period::new(a.parse().ok()?, b.parse().ok()?),
        [a, b] if b.len() == 4 => Period::new(b.parse().ok()?, a.parse().ok()?),
        [y, m, d] if y.len() == 4 => {
            let date = NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)?;
            Some(Period::from_date(date))
        }
        _ => None,
    }
}

fn parse_named(text: &str) -> Option<Period> {
    let tokens: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || matches!(c, '-' | ',' | '.' | '/'))
        .filter(|t| !t.is_empty())
        .collect();
    let [name, year] = tokens.as_slice() else {
        return None;
    };
    if name.len() < 3 {
        return None;
    }
    let month = MONTH_NAMES.iter().position(|full| full.starts_with(name))? as u32 + 1;
    Period::new(parse_year(year)?, month)
}

/// Canonical textual form of a period expression.
///
/// Two expressions that denote the same months always produce the same key,
/// regardless of how the caller spelled them.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodKey(String);

impl PeriodKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Period> for PeriodKey {
    fn from(period: Period) -> Self {
        PeriodKey(period.key())
    }
}

/// A period as requested by a formula: one month, a range, or a whole year.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PeriodExpr {
    Single(Period),
    Range { from: Period, to: Period },
    /// Year-only shorthand: January through December.
    Year(i32),
}

impl PeriodExpr {
    /// Parse `Jan 2025`, `2025`, `FY2025`, `Jan 2025:Mar 2025`,
    /// `Jan 2025 to Mar 2025` or `2025-01..2025-03`.
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(FetchError::invalid("empty period"));
        }
        let lower = text.to_ascii_lowercase();
        for sep in ["..", ":", " to "] {
            if let Some(idx) = lower.find(sep) {
                let (left, right) = (&text[..idx], &text[idx + sep.len()..]);
                let from = parse_endpoint(left, true)?;
                let to = parse_endpoint(right, false)?;
                return Self::range(from, to);
            }
        }
        if let Some(year) = parse_year_only(&lower) {
            return Ok(PeriodExpr::Year(year));
        }
        Period::parse(text).map(PeriodExpr::Single)
    }

    /// Build a canonical range expression from explicit endpoints.
    pub fn range(from: Period, to: Period) -> Result<Self, FetchError> {
        if from > to {
            return Err(FetchError::invalid(format!(
                "period range starts after it ends ({from} > {to})"
            )));
        }
        Ok(if from == to {
            PeriodExpr::Single(from)
        } else if from.year == to.year && from.month == 1 && to.month == 12 {
            PeriodExpr::Year(from.year)
        } else {
            PeriodExpr::Range { from, to }
        })
    }

    pub fn first(&self) -> Period {
        match *self {
            PeriodExpr::Single(p) => p,
            PeriodExpr::Range { from, .. } => from,
            PeriodExpr::Year(y) => Period { year: y, month: 1 },
        }
    }

    pub fn last(&self) -> Period {
        match *self {
            PeriodExpr::Single(p) => p,
            PeriodExpr::Range { to, .. } => to,
            PeriodExpr::Year(y) => Period { year: y, month: 12 },
        }
    }

    pub fn months(&self) -> Vec<Period> {
        self.first().months_through(self.last())
    }

    pub fn as_single(&self) -> Option<Period> {
        match *self {
            PeriodExpr::Single(p) => Some(p),
            _ => None,
        }
    }

    pub fn key(&self) -> PeriodKey {
        match *self {
            PeriodExpr::Single(p) => PeriodKey(p.key()),
            PeriodExpr::Range { from, to } => PeriodKey(format!("{}..{}", from.key(), to.key())),
            PeriodExpr::Year(y) => PeriodKey(format!("FY{y:04}")),
        }
    }
}

impl From<Period> for PeriodExpr {
    fn from(period: Period) -> Self {
        PeriodExpr::Single(period)
    }
}

impl Display for PeriodExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodExpr::Single(p) => write!(f, "{p}"),
            PeriodExpr::Range { from, to } => write!(f, "{from} to {to}"),
            PeriodExpr::Year(y) => write!(f, "FY{y}"),
        }
    }
}

fn parse_year_only(lower: &str) -> Option<i32> {
    let stripped = lower.strip_prefix("fy").unwrap_or(lower).trim();
    if stripped.len() == 4 {
        let year = parse_year(stripped)?;
        Period::new(year, 1).map(|_| year)
    } else {
        None
    }
}

fn parse_endpoint(raw: &str, is_start: bool) -> Result<Period, FetchError> {
    let lower = raw.trim().to_ascii_lowercase();
    if let Some(year) = parse_year_only(&lower) {
        let month = if is_start { 1 } else { 12 };
        return Period::new(year, month)
            .ok_or_else(|| FetchError::invalid(format!("year out of range '{}'", raw.trim())));
    }
    Period::parse(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(y: i32, m: u32) -> Period {
        Period::new(y, m).unwrap()
    }

    #[test]
    fn spellings_of_one_month_agree() {
        for raw in ["Jan 2025", "January 2025", "jan-25", "2025-01", "2025/1", "1/2025", " JAN 2025 "] {
            assert_eq!(Period::parse(raw).unwrap(), p(2025, 1), "{raw}");
        }
        assert_eq!(Period::parse("2025-03-31").unwrap(), p(2025, 3));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Period::parse("").is_err());
        assert!(Period::parse("Ju 2025").is_err());
        assert!(Period::parse("13/2025").is_err());
        assert!(Period::parse("Smarch 2025").is_err());
    }

    #[test]
    fn year_shorthand_and_full_range_share_a_key() {
        let a = PeriodExpr::parse("2025").unwrap();
        let b = PeriodExpr::parse("Jan 2025:Dec 2025").unwrap();
        let c = PeriodExpr::parse("FY2025").unwrap();
        assert_eq!(a, PeriodExpr::Year(2025));
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key(), c.key());
        assert_eq!(a.months().len(), 12);
    }

    #[test]
    fn degenerate_range_collapses_to_single() {
        let expr = PeriodExpr::parse("Mar 2025 to 2025-03").unwrap();
        assert_eq!(expr, PeriodExpr::Single(p(2025, 3)));
        assert_eq!(expr.key().as_str(), "2025-03");
    }

    #[test]
    fn range_key_is_spelling_independent() {
        let a = PeriodExpr::parse("Jan 2025:Mar 2025").unwrap();
        let b = PeriodExpr::parse("2025-01..2025-03").unwrap();
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "2025-01..2025-03");
    }

    #[test]
    fn inverted_range_is_invalid() {
        assert!(PeriodExpr::parse("Mar 2025:Jan 2025").is_err());
    }

    #[test]
    fn month_arithmetic_wraps_years() {
        assert_eq!(p(2024, 12).succ(), p(2025, 1));
        assert_eq!(p(2025, 1).pred(), p(2024, 12));
        assert_eq!(p(2024, 2).end_date(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(p(2024, 11).months_through(p(2025, 2)).len(), 4);
    }
}
