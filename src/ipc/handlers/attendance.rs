use crate::billing;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

fn normalize_day_codes(raw: &str, days: usize) -> String {
    let mut chars: Vec<char> = raw.chars().collect();
    chars.resize(days, ' ');
    chars.into_iter().collect()
}

fn patch_day_code(existing: &str, days: usize, day: usize, code: Option<char>) -> String {
    let mut chars: Vec<char> = normalize_day_codes(existing, days).chars().collect();
    if let Some(slot) = chars.get_mut(day.saturating_sub(1)) {
        *slot = code.unwrap_or(' ');
    }
    chars.into_iter().collect()
}

/// Month param as a strict `YYYY-MM` key, plus that month's day count.
fn month_param(params: &serde_json::Value) -> Result<(String, usize), HandlerErr> {
    let raw = required_str(params, "month")?;
    let date = billing::parse_month_key(&raw)
        .ok_or_else(|| HandlerErr::new("bad_params", "month must be YYYY-MM"))?;
    Ok((
        billing::month_key(date),
        billing::days_in_month(date.year(), date.month()),
    ))
}

fn parse_code_param(v: Option<&serde_json::Value>) -> Result<Option<char>, HandlerErr> {
    let Some(v) = v else { return Ok(None) };
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr::new("bad_params", "code must be string or null"));
    };
    let t = s.trim();
    if t.is_empty() {
        return Ok(None);
    }
    Ok(t.chars().next())
}

pub(crate) struct EnsureReport {
    pub sheet_created: bool,
    pub entries_created: usize,
    pub entries_existing: usize,
}

/// Idempotently create the class's sheet row for a month plus one blank
/// entry per enrolled student. Safe to call repeatedly; existing rows
/// are left untouched.
pub(crate) fn ensure_month(
    conn: &Connection,
    class_id: &str,
    month_key: &str,
    days: usize,
) -> Result<EnsureReport, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let sheet_created = tx
        .execute(
            "INSERT OR IGNORE INTO attendance_months(class_id, month) VALUES(?, ?)",
            (class_id, month_key),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "attendance_months" }),
            )
        })?
        > 0;

    let student_ids: Vec<String> = tx
        .prepare("SELECT student_id FROM enrollments WHERE class_id = ?")
        .and_then(|mut stmt| {
            stmt.query_map([class_id], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect())
        })
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let blank = normalize_day_codes("", days);
    let mut entries_created = 0usize;
    let mut entries_existing = 0usize;
    for student_id in &student_ids {
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO attendance_entries(class_id, student_id, month, day_codes)
                 VALUES(?, ?, ?, ?)",
                (class_id, student_id, month_key, &blank),
            )
            .map_err(|e| {
                HandlerErr::with_details(
                    "db_insert_failed",
                    e.to_string(),
                    json!({ "table": "attendance_entries" }),
                )
            })?;
        if inserted > 0 {
            entries_created += 1;
        } else {
            entries_existing += 1;
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(EnsureReport {
        sheet_created,
        entries_created,
        entries_existing,
    })
}

fn attendance_ensure_month(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let (month_key, days) = month_param(params)?;
    require_class(conn, &class_id)?;

    let report = ensure_month(conn, &class_id, &month_key, days)?;
    Ok(json!({
        "classId": class_id,
        "month": month_key,
        "sheetCreated": report.sheet_created,
        "entriesCreated": report.entries_created,
        "entriesExisting": report.entries_existing
    }))
}

fn attendance_month_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let (month_key, days) = month_param(params)?;
    require_class(conn, &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_id = ?
             ORDER BY s.name",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let roster = stmt
        .query_map([&class_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut by_student: HashMap<String, String> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, day_codes
             FROM attendance_entries
             WHERE class_id = ? AND month = ?",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map((&class_id, &month_key), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    for (student_id, day_codes) in rows {
        by_student.insert(student_id, normalize_day_codes(&day_codes, days));
    }

    let rows_json: Vec<serde_json::Value> = roster
        .iter()
        .map(|(id, name)| {
            let day_codes = by_student
                .get(id)
                .cloned()
                .unwrap_or_else(|| normalize_day_codes("", days));
            json!({
                "studentId": id,
                "name": name,
                "dayCodes": day_codes
            })
        })
        .collect();

    Ok(json!({
        "classId": class_id,
        "month": month_key,
        "daysInMonth": days,
        "rows": rows_json
    }))
}

fn attendance_set_student_day(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let student_id = required_str(params, "studentId")?;
    let (month_key, days) = month_param(params)?;
    let day = params
        .get("day")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing day"))? as usize;
    let code = parse_code_param(params.get("code"))?;
    if day == 0 || day > days {
        return Err(HandlerErr::new("bad_params", "day out of range for month"));
    }
    require_class(conn, &class_id)?;

    let enrolled = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .is_some();
    if !enrolled {
        return Err(HandlerErr::new(
            "not_found",
            "student is not enrolled in this class",
        ));
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT day_codes FROM attendance_entries
             WHERE class_id = ? AND student_id = ? AND month = ?",
            (&class_id, &student_id, &month_key),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let patched = patch_day_code(existing.as_deref().unwrap_or(""), days, day, code);
    conn.execute(
        "INSERT INTO attendance_entries(class_id, student_id, month, day_codes)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, student_id, month) DO UPDATE SET
           day_codes = excluded.day_codes",
        (&class_id, &student_id, &month_key, &patched),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_update_failed",
            e.to_string(),
            json!({ "table": "attendance_entries" }),
        )
    })?;

    Ok(json!({ "ok": true, "dayCodes": patched }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "attendance.ensureMonth" => {
            db_conn(state).and_then(|c| attendance_ensure_month(c, &req.params))
        }
        "attendance.monthOpen" => db_conn(state).and_then(|c| attendance_month_open(c, &req.params)),
        "attendance.setStudentDay" => {
            db_conn(state).and_then(|c| attendance_set_student_day(c, &req.params))
        }
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
