use crate::error::{FinsightError, Result};
use chrono::{Datelike, Days, NaiveDate};

pub fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .checked_sub_days(Days::new(1))
        .unwrap()
}

pub fn first_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| {
        FinsightError::Validation(format!("invalid year/month: {year}-{month:02}"))
    })
}

/// Calendar bounds of a quarter (1..=4).
pub fn quarter_bounds(year: i32, quarter: u32) -> Result<(NaiveDate, NaiveDate)> {
    if !(1..=4).contains(&quarter) {
        return Err(FinsightError::Validation(format!(
            "quarter must be 1..=4, got {quarter}"
        )));
    }
    let start_month = (quarter - 1) * 3 + 1;
    let start = first_day_of_month(year, start_month)?;
    let end = last_day_of_month(year, start_month + 2);
    Ok((start, end))
}

pub fn months_between(start: NaiveDate, end: NaiveDate) -> i32 {
    let year_diff = end.year() - start.year();
    let month_diff = end.month() as i32 - start.month() as i32;
    year_diff * 12 + month_diff
}

/// Every (year, month) whose calendar month overlaps [start, end].
pub fn months_in_range(start: NaiveDate, end: NaiveDate) -> Vec<(i32, u32)> {
    let mut months = Vec::new();
    let mut year = start.year();
    let mut month = start.month();

    while (year, month) <= (end.year(), end.month()) {
        months.push((year, month));
        if month == 12 {
            year += 1;
            month = 1;
        } else {
            month += 1;
        }
    }

    months
}

/// Lowercase alphanumeric slug for generated account ids.
pub fn slugify(name: &str) -> String {
    let lowered = name.trim().to_lowercase().replace('&', "and");
    let mut slug = String::with_capacity(lowered.len());
    let mut last_underscore = false;

    for ch in lowered.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_underscore = false;
        } else if !last_underscore && !slug.is_empty() {
            slug.push('_');
            last_underscore = true;
        }
    }

    while slug.ends_with('_') {
        slug.pop();
    }

    slug
}

pub fn parse_iso_date(value: &str, field: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        FinsightError::Validation(format!(
            "invalid {field} '{value}', expected YYYY-MM-DD"
        ))
    })
}

/// A period expression accepted by aggregate queries and growth tools:
/// a year (`2024`), a quarter (`2024-Q2`), a month (`2024-03`), or a single
/// day (`2024-03-15`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodSpec {
    Year(i32),
    Quarter(i32, u32),
    Month(i32, u32),
    Day(NaiveDate),
}

impl PeriodSpec {
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Ok(PeriodSpec::Day(date));
        }

        let parts: Vec<&str> = trimmed.split('-').collect();
        match parts.as_slice() {
            [year] => {
                let year: i32 = year.parse().map_err(|_| invalid_period(trimmed))?;
                if !(1000..=9999).contains(&year) {
                    return Err(invalid_period(trimmed));
                }
                Ok(PeriodSpec::Year(year))
            }
            [year, rest] => {
                let year: i32 = year.parse().map_err(|_| invalid_period(trimmed))?;
                if let Some(q) = rest.strip_prefix('Q').or_else(|| rest.strip_prefix('q')) {
                    let quarter: u32 = q.parse().map_err(|_| invalid_period(trimmed))?;
                    if !(1..=4).contains(&quarter) {
                        return Err(invalid_period(trimmed));
                    }
                    Ok(PeriodSpec::Quarter(year, quarter))
                } else {
                    let month: u32 = rest.parse().map_err(|_| invalid_period(trimmed))?;
                    if !(1..=12).contains(&month) {
                        return Err(invalid_period(trimmed));
                    }
                    Ok(PeriodSpec::Month(year, month))
                }
            }
            _ => Err(invalid_period(trimmed)),
        }
    }

    pub fn bounds(&self) -> (NaiveDate, NaiveDate) {
        match *self {
            PeriodSpec::Year(year) => (
                NaiveDate::from_ymd_opt(year, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(year, 12, 31).unwrap(),
            ),
            PeriodSpec::Quarter(year, quarter) => {
                quarter_bounds(year, quarter).expect("quarter validated at parse time")
            }
            PeriodSpec::Month(year, month) => (
                NaiveDate::from_ymd_opt(year, month, 1).unwrap(),
                last_day_of_month(year, month),
            ),
            PeriodSpec::Day(date) => (date, date),
        }
    }

    pub fn label(&self) -> String {
        match *self {
            PeriodSpec::Year(year) => format!("{year}"),
            PeriodSpec::Quarter(year, quarter) => format!("{year}-Q{quarter}"),
            PeriodSpec::Month(year, month) => format!("{year}-{month:02}"),
            PeriodSpec::Day(date) => date.format("%Y-%m-%d").to_string(),
        }
    }
}

fn invalid_period(input: &str) -> FinsightError {
    FinsightError::Validation(format!(
        "invalid period '{input}', expected YYYY, YYYY-Qn, YYYY-MM, or YYYY-MM-DD"
    ))
}
