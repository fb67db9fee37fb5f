use crate::billing;
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::attendance;
use crate::ipc::handlers::tuition::{create_pending, TuitionInsert};
use crate::ipc::helpers::{db_conn, now_ts, optional_str, today, ClassRow};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;
use serde_json::json;

const MARKER_KEY: &str = "sweep.last_run_month";

fn read_marker(conn: &Connection) -> Result<Option<String>, HandlerErr> {
    let value = db::settings_get_json(conn, MARKER_KEY)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    Ok(value
        .and_then(|v| v.get("month").and_then(|m| m.as_str()).map(|s| s.to_string())))
}

fn write_marker(conn: &Connection, month_key: &str) -> Result<(), HandlerErr> {
    db::settings_set_json(conn, MARKER_KEY, &json!({ "month": month_key }))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))
}

fn target_month(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match optional_str(params, "month") {
        Some(raw) => billing::parse_month_key(&raw)
            .ok_or_else(|| HandlerErr::new("bad_params", "month must be YYYY-MM")),
        None => Ok(today()),
    }
}

/// Ensure every class has its current-month tuition and attendance
/// rows. Runs at most once per calendar month per workspace: the last
/// run is recorded under a settings key, and a repeat call for the same
/// month reports `ran: false` without touching any class.
fn sweep_run(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let target = target_month(params)?;
    let target_key = billing::month_key(target);

    let last_run = read_marker(conn)?;
    if last_run.as_deref() == Some(target_key.as_str()) {
        return Ok(json!({
            "ran": false,
            "month": target_key,
            "lastRunMonth": last_run
        }));
    }

    let mut stmt = conn
        .prepare("SELECT id, name, start_date, end_date, tuition FROM classes ORDER BY name")
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let classes = stmt
        .query_map([], |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
                start_date: r.get(2)?,
                end_date: r.get(3)?,
                tuition: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let month_label = billing::month_label(target);
    let days = billing::days_in_month(target.year(), target.month());
    let ts = now_ts();

    // One class failing must not stop the rest; failures ride along in
    // the per-class report instead of aborting the sweep.
    let reports: Vec<serde_json::Value> = classes
        .iter()
        .map(|class| sweep_class(conn, class, target, &month_label, &target_key, days, &ts))
        .collect();

    // The marker advances even when some classes failed; the report is
    // the caller's only record of what still needs attention.
    write_marker(conn, &target_key)?;

    Ok(json!({
        "ran": true,
        "month": target_key,
        "lastRunMonth": last_run,
        "classes": reports
    }))
}

fn sweep_class(
    conn: &Connection,
    class: &ClassRow,
    target: NaiveDate,
    month_label: &str,
    month_key: &str,
    days: usize,
    ts: &str,
) -> serde_json::Value {
    match sweep_class_inner(conn, class, target, month_label, month_key, days, ts) {
        Ok(v) => v,
        Err(e) => json!({
            "classId": class.id,
            "name": class.name,
            "status": "failed",
            "error": { "code": e.code, "message": e.message }
        }),
    }
}

fn sweep_class_inner(
    conn: &Connection,
    class: &ClassRow,
    target: NaiveDate,
    month_label: &str,
    month_key: &str,
    days: usize,
    ts: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let (start, end) = class.window()?;
    if !billing::month_in_window(start, end, target) {
        return Ok(json!({
            "classId": class.id,
            "name": class.name,
            "status": "out_of_window"
        }));
    }

    let student_ids: Vec<String> = conn
        .prepare("SELECT student_id FROM enrollments WHERE class_id = ?")
        .and_then(|mut stmt| {
            stmt.query_map([&class.id], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect())
        })
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let mut tuition_created = 0usize;
    let mut tuition_skipped = 0usize;
    for student_id in &student_ids {
        match create_pending(conn, &class.id, student_id, month_label, class.tuition, ts)? {
            TuitionInsert::Created { .. } => tuition_created += 1,
            TuitionInsert::Exists { .. } => tuition_skipped += 1,
        }
    }

    let att = attendance::ensure_month(conn, &class.id, month_key, days)?;

    Ok(json!({
        "classId": class.id,
        "name": class.name,
        "status": "swept",
        "tuitionCreated": tuition_created,
        "tuitionSkipped": tuition_skipped,
        "attendanceCreated": att.entries_created,
        "attendanceExisting": att.entries_existing
    }))
}

fn sweep_status(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    Ok(json!({ "lastRunMonth": read_marker(conn)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "sweep.run" => db_conn(state).and_then(|c| sweep_run(c, &req.params)),
        "sweep.status" => db_conn(state).and_then(sweep_status),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
