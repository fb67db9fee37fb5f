use crate::billing;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::tuition::{create_pending, TuitionInsert};
use crate::ipc::helpers::{
    db_conn, now_ts, optional_str, require_class, required_str, student_exists, today, ClassRow,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn parse_join_date(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match optional_str(params, "joinDate") {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|_| HandlerErr::new("bad_params", "joinDate must be YYYY-MM-DD")),
        None => Ok(today()),
    }
}

/// Enroll a batch of students and bill each one's share of the course
/// window. Each student runs in its own transaction: a failure is
/// reported in the batch result without rolling back or blocking the
/// students before and after it.
fn add_students(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let Some(ids_json) = params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing studentIds"));
    };
    let student_ids: Vec<String> = ids_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect();

    let class = require_class(conn, &class_id)?;
    let (start, end) = class.window()?;
    let join = parse_join_date(params)?;
    let join_iso = join.format("%Y-%m-%d").to_string();
    let ts = now_ts();

    let students: Vec<serde_json::Value> = student_ids
        .iter()
        .map(|sid| enroll_one(conn, &class, start, end, sid, join, &ts))
        .collect();

    let roster_size: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM enrollments WHERE class_id = ?",
            [&class.id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({
        "classId": class.id,
        "joinDate": join_iso,
        "students": students,
        "rosterSize": roster_size
    }))
}

fn enroll_one(
    conn: &Connection,
    class: &ClassRow,
    start: NaiveDate,
    end: NaiveDate,
    student_id: &str,
    join: NaiveDate,
    ts: &str,
) -> serde_json::Value {
    match enroll_one_inner(conn, class, start, end, student_id, join, ts) {
        Ok(v) => v,
        Err(e) => json!({
            "studentId": student_id,
            "status": "failed",
            "error": { "code": e.code, "message": e.message }
        }),
    }
}

fn enroll_one_inner(
    conn: &Connection,
    class: &ClassRow,
    start: NaiveDate,
    end: NaiveDate,
    student_id: &str,
    join: NaiveDate,
    ts: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let join_iso = join.format("%Y-%m-%d").to_string();
    if !student_exists(conn, student_id)? {
        return Ok(json!({ "studentId": student_id, "status": "not_found" }));
    }

    let enrolled: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class.id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if enrolled.is_some() {
        return Ok(json!({ "studentId": student_id, "status": "already_enrolled" }));
    }

    // Enrollment and its billing months land together or not at all.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO enrollments(class_id, student_id, join_date) VALUES(?, ?, ?)",
        (&class.id, student_id, &join_iso),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "enrollments" }),
        )
    })?;

    let months = billing::tuition_months(start, end, join);
    let mut billed = 0usize;
    let mut skipped = 0usize;
    for month in &months {
        match create_pending(&tx, &class.id, student_id, month, class.tuition, ts)? {
            TuitionInsert::Created { .. } => billed += 1,
            TuitionInsert::Exists { .. } => skipped += 1,
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "studentId": student_id,
        "status": "enrolled",
        "monthsBilled": billed,
        "monthsSkipped": skipped
    }))
}

fn remove_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let student_id = required_str(params, "studentId")?;
    require_class(conn, &class_id)?;

    // Historical tuition records stay; only the membership goes.
    let changed = conn
        .execute(
            "DELETE FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "enrollments" }),
            )
        })?;
    if changed == 0 {
        return Err(HandlerErr::new(
            "not_found",
            "student is not enrolled in this class",
        ));
    }

    Ok(json!({ "ok": true }))
}

fn roster(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    require_class(conn, &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, e.join_date
             FROM enrollments e
             JOIN students s ON s.id = e.student_id
             WHERE e.class_id = ?
             ORDER BY s.name",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let students = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "joinDate": r.get::<_, String>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "classId": class_id, "students": students }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "class.addStudents" => db_conn(state).and_then(|c| add_students(c, &req.params)),
        "class.removeStudent" => db_conn(state).and_then(|c| remove_student(c, &req.params)),
        "class.roster" => db_conn(state).and_then(|c| roster(c, &req.params)),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
