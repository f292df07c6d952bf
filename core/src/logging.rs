//! Durable structured events stored in the `event_log` table.
//!
//! The `log` facade is used for process diagnostics; this module records the
//! events worth keeping (AI invocations, job transitions, writes) so they can
//! be inspected through `GET /api/v1/events`.

use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub module: String,
    pub message: String,
    pub explain: Option<String>,
    pub data: Option<Value>,
}

pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Best effort variant for call sites that only hold the pool. Failures are
/// reported through `log` and otherwise swallowed.
pub fn log_event_pooled(
    pool: &DbPool,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    data: Option<Value>,
) {
    let result = pool
        .get()
        .map_err(|e| e.to_string())
        .and_then(|conn| {
            log_event(&conn, level, code, module, message, None, data).map_err(|e| e.to_string())
        });
    if let Err(err) = result {
        log::warn!("failed to persist event '{message}' for {module}: {err}");
    }
}

/// Most recent events first, optionally filtered by module.
pub fn list_events(
    conn: &Connection,
    module: Option<&str>,
    limit: u32,
) -> rusqlite::Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, ts, level, code, module, message, explain, data FROM event_log
         WHERE (?1 IS NULL OR module = ?1)
         ORDER BY ts DESC, rowid DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![module, limit], |row| {
        let data: Option<String> = row.get(7)?;
        Ok(EventRecord {
            id: row.get(0)?,
            ts: row.get(1)?,
            level: row.get(2)?,
            code: row.get(3)?,
            module: row.get(4)?,
            message: row.get(5)?,
            explain: row.get(6)?,
            data: data.and_then(|raw| serde_json::from_str(&raw).ok()),
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, DatabaseTarget};

    #[test]
    fn events_round_trip_with_module_filter() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let conn = pool.get().unwrap();
        log_event(
            &conn,
            "info",
            Some("PRJ-0000"),
            "projects",
            "project created",
            None,
            Some(serde_json::json!({ "id": 7 })),
        )
        .unwrap();
        log_event(&conn, "warn", None, "ai.runtime", "provider missing", None, None).unwrap();

        let projects = list_events(&conn, Some("projects"), 10).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].code.as_deref(), Some("PRJ-0000"));
        assert_eq!(projects[0].data, Some(serde_json::json!({ "id": 7 })));

        let everything = list_events(&conn, None, 10).unwrap();
        assert!(everything.len() >= 2);
    }
}
