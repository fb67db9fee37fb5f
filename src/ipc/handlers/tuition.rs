use crate::billing::{self, TuitionStatus};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{
    db_conn, now_ts, optional_str, require_class, required_f64, required_str, student_exists,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub(crate) enum TuitionInsert {
    Created { tuition_id: String },
    Exists { tuition_id: String },
}

/// Append one pending tuition record for (class, student, month),
/// unless one already exists. The pre-check plus the table's UNIQUE
/// constraint keep the one-record-per-triple invariant; callers decide
/// whether `Exists` is an error (direct create) or a skip (cascade,
/// sweep).
pub(crate) fn create_pending(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
    month: &str,
    amount: f64,
    ts: &str,
) -> Result<TuitionInsert, HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM tuition_records WHERE class_id = ? AND student_id = ? AND month = ?",
            (class_id, student_id, month),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    if let Some(tuition_id) = existing {
        return Ok(TuitionInsert::Exists { tuition_id });
    }

    let tuition_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO tuition_records(id, class_id, student_id, month, amount, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &tuition_id,
            class_id,
            student_id,
            month,
            amount,
            TuitionStatus::Pending.as_str(),
            ts,
            ts,
        ),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "tuition_records" }),
        )
    })?;

    Ok(TuitionInsert::Created { tuition_id })
}

fn tuition_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_id = required_str(params, "classId")?;
    let student_id = required_str(params, "studentId")?;
    let month = required_str(params, "month")?;
    let amount = required_f64(params, "amount")?;

    if billing::parse_month_label(&month).is_none() {
        return Err(HandlerErr::new("bad_params", "month must be MM/YYYY"));
    }
    if !billing::valid_amount(amount) {
        return Err(HandlerErr::new(
            "bad_params",
            "amount must be a positive number",
        ));
    }
    require_class(conn, &class_id)?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    match create_pending(conn, &class_id, &student_id, &month, amount, &now_ts())? {
        TuitionInsert::Created { tuition_id } => Ok(json!({
            "tuitionId": tuition_id,
            "classId": class_id,
            "studentId": student_id,
            "month": month,
            "amount": amount,
            "status": TuitionStatus::Pending.as_str()
        })),
        TuitionInsert::Exists { tuition_id } => Err(HandlerErr::with_details(
            "duplicate_tuition_period",
            "a tuition record already exists for this class, student, and month",
            json!({ "tuitionId": tuition_id }),
        )),
    }
}

fn tuition_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(class_id) = optional_str(params, "classId") {
        clauses.push("class_id = ?");
        binds.push(Value::from(class_id));
    }
    if let Some(student_id) = optional_str(params, "studentId") {
        clauses.push("student_id = ?");
        binds.push(Value::from(student_id));
    }
    if let Some(month) = optional_str(params, "month") {
        if billing::parse_month_label(&month).is_none() {
            return Err(HandlerErr::new("bad_params", "month must be MM/YYYY"));
        }
        clauses.push("month = ?");
        binds.push(Value::from(month));
    }
    if let Some(status) = optional_str(params, "status") {
        let parsed = TuitionStatus::parse(&status).ok_or_else(|| {
            HandlerErr::new("bad_params", "status must be pending, paid, or overdue")
        })?;
        clauses.push("status = ?");
        binds.push(Value::from(parsed.as_str().to_string()));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    // month is MM/YYYY, so sort year-first via substr.
    let sql = format!(
        "SELECT id, class_id, student_id, month, amount, status, created_at, updated_at
         FROM tuition_records{}
         ORDER BY substr(month, 4, 4), substr(month, 1, 2), student_id",
        where_sql
    );

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
    let records = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "studentId": r.get::<_, String>(2)?,
                "month": r.get::<_, String>(3)?,
                "amount": r.get::<_, f64>(4)?,
                "status": r.get::<_, String>(5)?,
                "createdAt": r.get::<_, Option<String>>(6)?,
                "updatedAt": r.get::<_, Option<String>>(7)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;

    Ok(json!({ "records": records }))
}

fn tuition_set_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tuition_id = required_str(params, "tuitionId")?;
    let status_raw = required_str(params, "status")?;
    let status = TuitionStatus::parse(&status_raw).ok_or_else(|| {
        HandlerErr::new("bad_params", "status must be pending, paid, or overdue")
    })?;

    let changed = conn
        .execute(
            "UPDATE tuition_records SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), &now_ts(), &tuition_id),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_update_failed",
                e.to_string(),
                json!({ "table": "tuition_records" }),
            )
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "tuition record not found"));
    }

    Ok(json!({ "tuitionId": tuition_id, "status": status.as_str() }))
}

fn tuition_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let tuition_id = required_str(params, "tuitionId")?;
    let changed = conn
        .execute("DELETE FROM tuition_records WHERE id = ?", [&tuition_id])
        .map_err(|e| {
            HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "tuition_records" }),
            )
        })?;
    if changed == 0 {
        return Err(HandlerErr::new("not_found", "tuition record not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "tuition.create" => db_conn(state).and_then(|c| tuition_create(c, &req.params)),
        "tuition.list" => db_conn(state).and_then(|c| tuition_list(c, &req.params)),
        "tuition.setStatus" => db_conn(state).and_then(|c| tuition_set_status(c, &req.params)),
        "tuition.delete" => db_conn(state).and_then(|c| tuition_delete(c, &req.params)),
        _ => return None,
    };
    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
