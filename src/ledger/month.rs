//! Budget month selection.

use chrono::{Datelike, Months, NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::MirrorError;

/// A budget month as named by a caller.
///
/// Parses `current`, `last`, `next` (relative to today) or an ISO date in
/// `YYYY-MM` or `YYYY-MM-DD` form. Resolves to the first day of the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonthSelector {
  Current,
  Last,
  Next,
  Date(NaiveDate),
}

impl MonthSelector {
  pub fn resolve(&self, today: NaiveDate) -> NaiveDate {
    let current = first_of_month(today);
    match self {
      Self::Current => current,
      Self::Last => shift_months(current, -1),
      Self::Next => shift_months(current, 1),
      Self::Date(date) => first_of_month(*date),
    }
  }

  pub fn resolve_now(&self) -> NaiveDate {
    self.resolve(Utc::now().date_naive())
  }
}

impl From<NaiveDate> for MonthSelector {
  fn from(date: NaiveDate) -> Self {
    Self::Date(date)
  }
}

impl FromStr for MonthSelector {
  type Err = MirrorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let trimmed = s.trim();
    match trimmed.to_ascii_lowercase().as_str() {
      "current" => return Ok(Self::Current),
      "last" => return Ok(Self::Last),
      "next" => return Ok(Self::Next),
      _ => {}
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
      .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", trimmed), "%Y-%m-%d"))
      .map(Self::Date)
      .map_err(|_| MirrorError::InvalidMonth(s.to_string()))
  }
}

impl fmt::Display for MonthSelector {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Current => f.write_str("current"),
      Self::Last => f.write_str("last"),
      Self::Next => f.write_str("next"),
      Self::Date(date) => write!(f, "{}", date.format("%Y-%m")),
    }
  }
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
  date.with_day(1).unwrap_or(date)
}

/// Move a month forwards or backwards, clamping at the calendar bounds.
pub fn shift_months(month: NaiveDate, delta: i32) -> NaiveDate {
  let shifted = if delta >= 0 {
    month.checked_add_months(Months::new(delta.unsigned_abs()))
  } else {
    month.checked_sub_months(Months::new(delta.unsigned_abs()))
  };
  shifted.unwrap_or(month)
}
