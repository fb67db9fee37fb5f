use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, now_ts, optional_str, required_str, student_exists};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "phone": r.get::<_, Option<String>>(2)?,
        "email": r.get::<_, Option<String>>(3)?
    }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    // With classId, list that class's roster; otherwise all students.
    let (sql, bind): (&str, Option<String>) = match optional_str(params, "classId") {
        Some(class_id) => (
            "SELECT s.id, s.name, s.phone, s.email
             FROM students s
             JOIN enrollments e ON e.student_id = s.id
             WHERE e.class_id = ?
             ORDER BY s.name",
            Some(class_id),
        ),
        None => (
            "SELECT id, name, phone, email FROM students ORDER BY name",
            None,
        ),
    };

    let mut stmt = stmt_for(conn, sql)?;
    let rows = match bind {
        Some(class_id) => stmt.query_map([&class_id], student_json),
        None => stmt.query_map([], student_json),
    };
    let students = rows
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "students": students }))
}

fn stmt_for<'a>(
    conn: &'a Connection,
    sql: &str,
) -> Result<rusqlite::Statement<'a>, HandlerErr> {
    conn.prepare(sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let name = required_str(params, "name")?;
    let phone = optional_str(params, "phone");
    let email = optional_str(params, "email");

    let student_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    conn.execute(
        "INSERT INTO students(id, name, phone, email, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&student_id, &name, &phone, &email, &ts, &ts),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "name": name,
        "phone": phone,
        "email": email
    }))
}

fn students_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;

    let current = conn
        .query_row(
            "SELECT name, phone, email FROM students WHERE id = ?",
            [&student_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))?;

    let name = optional_str(params, "name").unwrap_or(current.0);
    let phone = optional_str(params, "phone").or(current.1);
    let email = optional_str(params, "email").or(current.2);

    conn.execute(
        "UPDATE students SET name = ?, phone = ?, email = ?, updated_at = ? WHERE id = ?",
        (&name, &phone, &email, &now_ts(), &student_id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "students" }))
    })?;

    Ok(json!({
        "studentId": student_id,
        "name": name,
        "phone": phone,
        "email": email
    }))
}

fn students_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    for (table, sql) in [
        (
            "tuition_records",
            "DELETE FROM tuition_records WHERE student_id = ?",
        ),
        (
            "attendance_entries",
            "DELETE FROM attendance_entries WHERE student_id = ?",
        ),
        (
            "enrollments",
            "DELETE FROM enrollments WHERE student_id = ?",
        ),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        tx.execute(sql, [&student_id]).map_err(|e| {
            HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": table }))
        })?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => db_conn(state).and_then(|c| students_list(c, &req.params)),
        "students.create" => db_conn(state).and_then(|c| students_create(c, &req.params)),
        "students.update" => db_conn(state).and_then(|c| students_update(c, &req.params)),
        "students.delete" => db_conn(state).and_then(|c| students_delete(c, &req.params)),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
