//! Background jobs persisted in the `jobs` table.
//!
//! A job row is the source of truth for state; the [`queue`] transports only
//! decide which job id a worker picks up next.

pub mod queue;
pub mod runner;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::{PlanFlowError, PlanFlowResult};

pub use queue::{transport_from_settings, DatabaseTransport, JobTransport, RedisTransport};
pub use runner::Worker;

pub const CHARTER_VALIDATE: &str = "charter.validate";
pub const RELEASE_EXTRACT: &str = "release.extract";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub kind: String,
    pub state: JobState,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempts: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

const JOB_COLUMNS: &str =
    "id, kind, state, payload, result, error, attempts, created_at, updated_at";

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

fn map_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let state: String = row.get(2)?;
    Ok(JobRecord {
        id: row.get(0)?,
        kind: row.get(1)?,
        state: JobState::parse(&state).unwrap_or(JobState::Failed),
        payload: json_column(row, 3)?.unwrap_or(Value::Null),
        result: json_column(row, 4)?,
        error: row.get(5)?,
        attempts: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn enqueue_job(conn: &Connection, kind: &str, payload: Value) -> rusqlite::Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = now();
    conn.execute(
        "INSERT INTO jobs (id, kind, state, payload, created_at, updated_at) VALUES (?1, ?2, 'queued', ?3, ?4, ?5)",
        (id.as_str(), kind, payload.to_string(), now, now),
    )?;
    Ok(id)
}

pub fn get_job(conn: &Connection, id: &str) -> PlanFlowResult<JobRecord> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id],
        map_job,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("Job"))
}

/// Oldest job still waiting to run.
pub fn next_queued(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM jobs WHERE state = 'queued' ORDER BY created_at ASC, rowid ASC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
}

/// Moves a queued job to running. Returns false when another worker got there first.
pub fn claim_job(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE jobs SET state = 'running', attempts = attempts + 1, updated_at = ?2
         WHERE id = ?1 AND state = 'queued'",
        params![id, now()],
    )?;
    Ok(changed == 1)
}

pub fn complete_job(conn: &Connection, id: &str, result: &Value) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE jobs SET state = 'completed', result = ?2, error = NULL, updated_at = ?3 WHERE id = ?1",
        params![id, result.to_string(), now()],
    )?;
    Ok(())
}

pub fn fail_job(conn: &Connection, id: &str, error: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE jobs SET state = 'failed', error = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, error, now()],
    )?;
    Ok(())
}

/// Puts jobs a crashed worker left `running` back in the queue. Returns their ids.
pub fn requeue_stale(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM jobs WHERE state = 'running' ORDER BY created_at ASC")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    conn.execute(
        "UPDATE jobs SET state = 'queued', updated_at = ?1 WHERE state = 'running'",
        params![now()],
    )?;
    Ok(ids)
}
