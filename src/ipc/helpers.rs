use crate::billing;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::AppState;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

#[derive(Debug, Clone)]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub tuition: f64,
}

impl ClassRow {
    /// Course window normalized to first-of-month bounds. Stored dates
    /// are validated on write, so a parse failure here means the
    /// workspace was edited out from under us.
    pub fn window(&self) -> Result<(NaiveDate, NaiveDate), HandlerErr> {
        let start = billing::parse_month_start(&self.start_date);
        let end = billing::parse_month_start(&self.end_date);
        match (start, end) {
            (Some(s), Some(e)) => Ok((s, e)),
            _ => Err(HandlerErr::with_details(
                "internal_error",
                "class has an unreadable course window",
                serde_json::json!({ "classId": self.id }),
            )),
        }
    }
}

pub fn get_class(conn: &Connection, class_id: &str) -> Result<Option<ClassRow>, HandlerErr> {
    conn.query_row(
        "SELECT id, name, start_date, end_date, tuition FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
                tuition: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

pub fn require_class(conn: &Connection, class_id: &str) -> Result<ClassRow, HandlerErr> {
    get_class(conn, class_id)?.ok_or_else(|| HandlerErr::new("not_found", "class not found"))
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM students WHERE id = ?",
        [student_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}
