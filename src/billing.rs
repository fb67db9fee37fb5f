use chrono::{Datelike, NaiveDate};

/// Parse an ISO date (`YYYY-MM-DD`) or bare month (`YYYY-MM`) and
/// normalize it to the first day of its month. Billing only ever cares
/// about the year-month portion.
pub fn parse_month_start(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return NaiveDate::from_ymd_opt(d.year(), d.month(), 1);
    }
    parse_month_key(t)
}

/// Strict `YYYY-MM` month key, as used by attendance sheets and the
/// sweep marker.
pub fn parse_month_key(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    let (y, m) = t.split_once('-')?;
    if y.len() != 4 {
        return None;
    }
    let year = y.parse::<i32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Billing label for a month: `MM/YYYY`.
pub fn month_label(d: NaiveDate) -> String {
    format!("{:02}/{:04}", d.month(), d.year())
}

/// Marker/attendance key for a month: `YYYY-MM`.
pub fn month_key(d: NaiveDate) -> String {
    format!("{:04}-{:02}", d.year(), d.month())
}

/// Strict `MM/YYYY` billing label, the key stored on tuition records.
pub fn parse_month_label(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    let (m, y) = t.split_once('/')?;
    if m.len() != 2 || y.len() != 4 {
        return None;
    }
    let month = m.parse::<u32>().ok()?;
    let year = y.parse::<i32>().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, 1)
}

fn month_after(d: NaiveDate) -> Option<NaiveDate> {
    if d.month() == 12 {
        NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
    }
}

/// The billable months for one enrollment, as `MM/YYYY` labels in
/// ascending order.
///
/// A join after the course's last month owes nothing (empty vec, not an
/// error). A join before the course start bills from the course start,
/// never retroactively before it.
pub fn tuition_months(start: NaiveDate, end: NaiveDate, join: NaiveDate) -> Vec<String> {
    let start = first_of_month(start);
    let end = first_of_month(end);
    let join = first_of_month(join);

    if join > end {
        return Vec::new();
    }

    let mut cur = if join > start { join } else { start };
    let mut out = Vec::new();
    while cur <= end {
        out.push(month_label(cur));
        match month_after(cur) {
            Some(next) => cur = next,
            None => break,
        }
    }
    out
}

fn first_of_month(d: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(d.year(), d.month(), 1).unwrap_or(d)
}

/// True when the given month (first-of-month) falls inside the course
/// window, month-granular and inclusive on both ends.
pub fn month_in_window(start: NaiveDate, end: NaiveDate, month: NaiveDate) -> bool {
    let start = first_of_month(start);
    let end = first_of_month(end);
    let month = first_of_month(month);
    month >= start && month <= end
}

pub fn days_in_month(year: i32, month: u32) -> usize {
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if leap => 29,
        2 => 28,
        _ => 30,
    }
}

/// Tuition amounts must be positive and finite.
pub fn valid_amount(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuitionStatus {
    Pending,
    Paid,
    Overdue,
}

impl TuitionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TuitionStatus::Pending => "pending",
            TuitionStatus::Paid => "paid",
            TuitionStatus::Overdue => "overdue",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(TuitionStatus::Pending),
            "paid" => Some(TuitionStatus::Paid),
            "overdue" => Some(TuitionStatus::Overdue),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(raw: &str) -> NaiveDate {
        parse_month_start(raw).expect("valid date")
    }

    #[test]
    fn parse_accepts_full_date_and_bare_month() {
        assert_eq!(d("2024-03-15"), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(d("2024-03"), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert!(parse_month_start("03/2024").is_none());
        assert!(parse_month_start("2024-13").is_none());
        assert!(parse_month_start("24-03").is_none());
    }

    #[test]
    fn month_label_round_trips() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(month_label(date), "03/2024");
        assert_eq!(parse_month_label("03/2024"), Some(date));
        assert!(parse_month_label("3/2024").is_none());
        assert!(parse_month_label("2024-03").is_none());
        assert!(parse_month_label("13/2024").is_none());
    }

    #[test]
    fn month_key_rejects_full_dates() {
        assert!(parse_month_key("2024-03-15").is_none());
        assert_eq!(
            parse_month_key("2024-03"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
    }

    #[test]
    fn mid_year_join_bills_from_join_month() {
        let months = tuition_months(d("2024-01-01"), d("2024-12-31"), d("2024-03-15"));
        assert_eq!(months.len(), 10);
        assert_eq!(months.first().map(String::as_str), Some("03/2024"));
        assert_eq!(months.last().map(String::as_str), Some("12/2024"));
    }

    #[test]
    fn join_in_final_month_bills_one_month() {
        let months = tuition_months(d("2024-01-01"), d("2024-12-31"), d("2024-12-15"));
        assert_eq!(months, vec!["12/2024".to_string()]);
    }

    #[test]
    fn early_join_is_clamped_to_course_start() {
        let months = tuition_months(d("2024-01-01"), d("2024-12-31"), d("2023-12-15"));
        assert_eq!(months.len(), 12);
        assert_eq!(months.first().map(String::as_str), Some("01/2024"));
    }

    #[test]
    fn join_after_course_end_owes_nothing() {
        let months = tuition_months(d("2024-01-01"), d("2024-12-31"), d("2025-01-01"));
        assert!(months.is_empty());
    }

    #[test]
    fn single_month_course() {
        let months = tuition_months(d("2024-06-01"), d("2024-06-30"), d("2024-06-10"));
        assert_eq!(months, vec!["06/2024".to_string()]);
    }

    #[test]
    fn months_cross_year_boundary_in_order() {
        let months = tuition_months(d("2024-11-01"), d("2025-02-28"), d("2024-01-01"));
        assert_eq!(
            months,
            vec![
                "11/2024".to_string(),
                "12/2024".to_string(),
                "01/2025".to_string(),
                "02/2025".to_string(),
            ]
        );
    }

    #[test]
    fn output_is_strictly_ascending_and_duplicate_free() {
        let months = tuition_months(d("2022-09-01"), d("2025-06-30"), d("2023-02-01"));
        let mut keys: Vec<NaiveDate> = months
            .iter()
            .map(|m| {
                let (mm, yyyy) = m.split_once('/').expect("label shape");
                NaiveDate::from_ymd_opt(yyyy.parse().unwrap(), mm.parse().unwrap(), 1).unwrap()
            })
            .collect();
        let original = keys.clone();
        keys.sort();
        keys.dedup();
        assert_eq!(original, keys);
    }

    #[test]
    fn same_inputs_same_output() {
        let a = tuition_months(d("2024-01-01"), d("2024-12-31"), d("2024-03-15"));
        let b = tuition_months(d("2024-01-01"), d("2024-12-31"), d("2024-03-15"));
        assert_eq!(a, b);
    }

    #[test]
    fn window_check_is_month_granular() {
        assert!(month_in_window(
            d("2024-01-15"),
            d("2024-12-01"),
            d("2024-12-31")
        ));
        assert!(!month_in_window(
            d("2024-01-15"),
            d("2024-12-01"),
            d("2025-01-01")
        ));
    }

    #[test]
    fn status_round_trips() {
        for s in ["pending", "paid", "overdue"] {
            assert_eq!(TuitionStatus::parse(s).map(|v| v.as_str()), Some(s));
        }
        assert_eq!(TuitionStatus::parse(" Paid "), Some(TuitionStatus::Paid));
        assert!(TuitionStatus::parse("void").is_none());
    }

    #[test]
    fn february_day_counts() {
        assert_eq!(days_in_month(2024, 2), 29);
        assert_eq!(days_in_month(2023, 2), 28);
        assert_eq!(days_in_month(2100, 2), 28);
        assert_eq!(days_in_month(2000, 2), 29);
    }
}
