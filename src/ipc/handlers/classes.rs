use crate::billing;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, now_ts, optional_str, require_class, required_f64, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn validate_window(start_raw: &str, end_raw: &str) -> Result<(), HandlerErr> {
    let start = billing::parse_month_start(start_raw)
        .ok_or_else(|| HandlerErr::new("bad_params", "startDate must be an ISO date"))?;
    let end = billing::parse_month_start(end_raw)
        .ok_or_else(|| HandlerErr::new("bad_params", "endDate must be an ISO date"))?;
    if start > end {
        return Err(HandlerErr::new(
            "bad_params",
            "startDate must not be after endDate",
        ));
    }
    Ok(())
}

fn classes_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Correlated subqueries keep the counts join-free.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.start_date,
               c.end_date,
               c.tuition,
               (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM lessons l WHERE l.class_id = c.id) AS lesson_count
             FROM classes c
             ORDER BY c.name",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    let classes = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "startDate": r.get::<_, String>(2)?,
                "endDate": r.get::<_, String>(3)?,
                "tuition": r.get::<_, f64>(4)?,
                "studentCount": r.get::<_, i64>(5)?,
                "lessonCount": r.get::<_, i64>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "classes": classes }))
}

fn classes_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let start_date = required_str(params, "startDate")?;
    let end_date = required_str(params, "endDate")?;
    let tuition = required_f64(params, "tuition")?;

    validate_window(&start_date, &end_date)?;
    if !billing::valid_amount(tuition) {
        return Err(HandlerErr::new(
            "bad_params",
            "tuition must be a positive number",
        ));
    }

    let class_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    conn.execute(
        "INSERT INTO classes(id, name, start_date, end_date, tuition, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&class_id, &name, &start_date, &end_date, tuition, &ts, &ts),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "classes" }))
    })?;

    Ok(json!({
        "classId": class_id,
        "name": name,
        "startDate": start_date,
        "endDate": end_date,
        "tuition": tuition
    }))
}

fn classes_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let current = require_class(conn, &class_id)?;

    let name = optional_str(params, "name").unwrap_or(current.name);
    let start_date = optional_str(params, "startDate").unwrap_or(current.start_date);
    let end_date = optional_str(params, "endDate").unwrap_or(current.end_date);
    let tuition = match params.get("tuition") {
        Some(v) => v
            .as_f64()
            .ok_or_else(|| HandlerErr::new("bad_params", "tuition must be a number"))?,
        None => current.tuition,
    };

    validate_window(&start_date, &end_date)?;
    if !billing::valid_amount(tuition) {
        return Err(HandlerErr::new(
            "bad_params",
            "tuition must be a positive number",
        ));
    }

    conn.execute(
        "UPDATE classes
         SET name = ?, start_date = ?, end_date = ?, tuition = ?, updated_at = ?
         WHERE id = ?",
        (&name, &start_date, &end_date, tuition, &now_ts(), &class_id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "classes" }))
    })?;

    Ok(json!({
        "classId": class_id,
        "name": name,
        "startDate": start_date,
        "endDate": end_date,
        "tuition": tuition
    }))
}

fn classes_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    require_class(conn, &class_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Explicit deletes in dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        (
            "tuition_records",
            "DELETE FROM tuition_records WHERE class_id = ?",
        ),
        (
            "attendance_entries",
            "DELETE FROM attendance_entries WHERE class_id = ?",
        ),
        (
            "attendance_months",
            "DELETE FROM attendance_months WHERE class_id = ?",
        ),
        ("lessons", "DELETE FROM lessons WHERE class_id = ?"),
        ("enrollments", "DELETE FROM enrollments WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ] {
        tx.execute(sql, [&class_id]).map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": table }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "classes.list" => db_conn(state).and_then(classes_list),
        "classes.create" => db_conn(state).and_then(|c| classes_create(c, &req.params)),
        "classes.update" => db_conn(state).and_then(|c| classes_update(c, &req.params)),
        "classes.delete" => db_conn(state).and_then(|c| classes_delete(c, &req.params)),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
