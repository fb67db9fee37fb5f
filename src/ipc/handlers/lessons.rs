use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, now_ts, optional_str, require_class, required_str};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn validate_lesson_date(raw: &str) -> Result<(), HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| HandlerErr::new("bad_params", "date must be YYYY-MM-DD"))
}

fn parse_duration(v: Option<&serde_json::Value>, default: i64) -> Result<i64, HandlerErr> {
    match v {
        None => Ok(default),
        Some(raw) => raw
            .as_i64()
            .filter(|d| *d > 0)
            .ok_or_else(|| HandlerErr::new("bad_params", "durationMinutes must be a positive integer")),
    }
}

fn lessons_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    require_class(conn, &class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, date, topic, notes, duration_minutes
             FROM lessons
             WHERE class_id = ?
             ORDER BY date, id",
        )
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let lessons = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "topic": r.get::<_, String>(2)?,
                "notes": r.get::<_, Option<String>>(3)?,
                "durationMinutes": r.get::<_, i64>(4)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "classId": class_id, "lessons": lessons }))
}

fn lessons_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let date = required_str(params, "date")?;
    let topic = required_str(params, "topic")?;
    let notes = optional_str(params, "notes");
    let duration = parse_duration(params.get("durationMinutes"), 60)?;

    validate_lesson_date(&date)?;
    require_class(conn, &class_id)?;

    let lesson_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    conn.execute(
        "INSERT INTO lessons(id, class_id, date, topic, notes, duration_minutes, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (&lesson_id, &class_id, &date, &topic, &notes, duration, &ts, &ts),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_insert_failed", e.to_string(), json!({ "table": "lessons" }))
    })?;

    Ok(json!({
        "lessonId": lesson_id,
        "classId": class_id,
        "date": date,
        "topic": topic,
        "notes": notes,
        "durationMinutes": duration
    }))
}

fn lessons_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let lesson_id = required_str(params, "lessonId")?;

    let current = conn
        .query_row(
            "SELECT date, topic, notes, duration_minutes FROM lessons WHERE id = ?",
            [&lesson_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "lesson not found"))?;

    let date = optional_str(params, "date").unwrap_or(current.0);
    let topic = optional_str(params, "topic").unwrap_or(current.1);
    let notes = optional_str(params, "notes").or(current.2);
    let duration = parse_duration(params.get("durationMinutes"), current.3)?;
    validate_lesson_date(&date)?;

    conn.execute(
        "UPDATE lessons SET date = ?, topic = ?, notes = ?, duration_minutes = ?, updated_at = ?
         WHERE id = ?",
        (&date, &topic, &notes, duration, &now_ts(), &lesson_id),
    )
    .map_err(|e| {
        HandlerErr::with_details("db_update_failed", e.to_string(), json!({ "table": "lessons" }))
    })?;

    Ok(json!({
        "lessonId": lesson_id,
        "date": date,
        "topic": topic,
        "notes": notes,
        "durationMinutes": duration
    }))
}

fn lessons_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let lesson_id = required_str(params, "lessonId")?;
    let changed = conn
        .execute("DELETE FROM lessons WHERE id = ?", [&lesson_id])
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "lessons" }),
            )
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "lesson not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "lessons.list" => db_conn(state).and_then(|c| lessons_list(c, &req.params)),
        "lessons.create" => db_conn(state).and_then(|c| lessons_create(c, &req.params)),
        "lessons.update" => db_conn(state).and_then(|c| lessons_update(c, &req.params)),
        "lessons.delete" => db_conn(state).and_then(|c| lessons_delete(c, &req.params)),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
