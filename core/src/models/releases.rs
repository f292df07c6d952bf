use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{
    check_name, check_progress, list_from_row, list_to_sql, now_ts, parse_date, EpicStatus,
    ReleaseStatus,
};
use crate::errors::{PlanFlowError, PlanFlowResult};

const RELEASE_COLUMNS: &str = "id, name, description, version, start_date, end_date, scope_modules, goals, status, progress, project_id, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct Release {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub scope_modules: Vec<String>,
    pub goals: Vec<String>,
    pub status: ReleaseStatus,
    pub progress: f64,
    pub project_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseCreate {
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub scope_modules: Vec<String>,
    #[serde(default)]
    pub goals: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReleaseUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub scope_modules: Option<Vec<String>>,
    pub goals: Option<Vec<String>>,
    pub status: Option<ReleaseStatus>,
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseList {
    pub releases: Vec<Release>,
    pub total: usize,
}

fn map_release(row: &Row<'_>) -> rusqlite::Result<Release> {
    Ok(Release {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        version: row.get(3)?,
        start_date: row.get(4)?,
        end_date: row.get(5)?,
        scope_modules: list_from_row(row, 6)?,
        goals: list_from_row(row, 7)?,
        status: row.get(8)?,
        progress: row.get(9)?,
        project_id: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn check_version(version: Option<&str>) -> PlanFlowResult<()> {
    if version.is_some_and(|v| v.chars().count() > 50) {
        return Err(PlanFlowError::Validation(
            "version must be at most 50 characters".to_string(),
        ));
    }
    Ok(())
}

/// Both dates are optional; when both are present the window must not be inverted.
fn check_window(start: Option<&str>, end: Option<&str>) -> PlanFlowResult<()> {
    let start = start.map(|s| parse_date("start_date", s)).transpose()?;
    let end = end.map(|e| parse_date("end_date", e)).transpose()?;
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(PlanFlowError::Validation(
                "end_date must not be before start_date".to_string(),
            ));
        }
    }
    Ok(())
}

fn normalise_date(raw: Option<&String>) -> Option<String> {
    raw.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

pub fn create_release(
    conn: &Connection,
    project_id: i64,
    input: &ReleaseCreate,
) -> PlanFlowResult<Release> {
    check_name("name", &input.name, 100)?;
    check_version(input.version.as_deref())?;
    let start = normalise_date(input.start_date.as_ref());
    let end = normalise_date(input.end_date.as_ref());
    check_window(start.as_deref(), end.as_deref())?;

    let now = now_ts();
    conn.execute(
        "INSERT INTO releases (name, description, version, start_date, end_date, scope_modules, goals, status, progress, project_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?10)",
        params![
            input.name.trim(),
            input.description,
            input.version,
            start,
            end,
            list_to_sql(&input.scope_modules),
            list_to_sql(&input.goals),
            ReleaseStatus::NotStarted,
            project_id,
            now
        ],
    )?;
    get_release(conn, project_id, conn.last_insert_rowid())
}

pub fn list_releases(conn: &Connection, project_id: i64) -> PlanFlowResult<ReleaseList> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RELEASE_COLUMNS} FROM releases WHERE project_id = ?1 ORDER BY start_date ASC, created_at ASC, id ASC"
    ))?;
    let releases = stmt
        .query_map([project_id], map_release)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ReleaseList {
        total: releases.len(),
        releases,
    })
}

pub fn get_release(conn: &Connection, project_id: i64, id: i64) -> PlanFlowResult<Release> {
    conn.query_row(
        &format!("SELECT {RELEASE_COLUMNS} FROM releases WHERE id = ?1 AND project_id = ?2"),
        params![id, project_id],
        map_release,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("Release"))
}

/// Lookup without the owning project, used by the backlog routes.
pub fn find_release(conn: &Connection, id: i64) -> PlanFlowResult<Release> {
    conn.query_row(
        &format!("SELECT {RELEASE_COLUMNS} FROM releases WHERE id = ?1"),
        [id],
        map_release,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("Release"))
}

pub fn update_release(
    conn: &Connection,
    project_id: i64,
    id: i64,
    input: &ReleaseUpdate,
) -> PlanFlowResult<Release> {
    let current = get_release(conn, project_id, id)?;
    if let Some(name) = &input.name {
        check_name("name", name, 100)?;
    }
    check_version(input.version.as_deref())?;
    if let Some(progress) = input.progress {
        check_progress(progress)?;
    }
    let start = normalise_date(input.start_date.as_ref().or(current.start_date.as_ref()));
    let end = normalise_date(input.end_date.as_ref().or(current.end_date.as_ref()));
    check_window(start.as_deref(), end.as_deref())?;

    let name = input.name.as_deref().map(str::trim).unwrap_or(&current.name);
    conn.execute(
        "UPDATE releases SET name = ?1, description = ?2, version = ?3, start_date = ?4, end_date = ?5,
         scope_modules = ?6, goals = ?7, status = ?8, progress = ?9, updated_at = ?10 WHERE id = ?11",
        params![
            name,
            input.description.as_ref().or(current.description.as_ref()),
            input.version.as_ref().or(current.version.as_ref()),
            start,
            end,
            list_to_sql(input.scope_modules.as_ref().unwrap_or(&current.scope_modules)),
            list_to_sql(input.goals.as_ref().unwrap_or(&current.goals)),
            input.status.unwrap_or(current.status),
            input.progress.unwrap_or(current.progress),
            now_ts(),
            id
        ],
    )?;
    get_release(conn, project_id, id)
}

pub fn delete_release(conn: &Connection, project_id: i64, id: i64) -> PlanFlowResult<()> {
    let removed = conn.execute(
        "DELETE FROM releases WHERE id = ?1 AND project_id = ?2",
        params![id, project_id],
    )?;
    if removed == 0 {
        return Err(PlanFlowError::NotFound("Release"));
    }
    Ok(())
}

/// Percentage of the release's epics marked Completed. Zero without epics.
pub fn release_progress(conn: &Connection, release_id: i64) -> PlanFlowResult<f64> {
    let (total, completed): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = ?2 THEN 1 ELSE 0 END), 0)
         FROM epics WHERE release_id = ?1",
        params![release_id, EpicStatus::Completed],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if total == 0 {
        return Ok(0.0);
    }
    Ok(completed as f64 / total as f64 * 100.0)
}

/// Recomputes and stores the release progress.
pub fn refresh_progress(conn: &Connection, project_id: i64, id: i64) -> PlanFlowResult<Release> {
    get_release(conn, project_id, id)?;
    let progress = release_progress(conn, id)?;
    conn.execute(
        "UPDATE releases SET progress = ?1, updated_at = ?2 WHERE id = ?3",
        params![progress, now_ts(), id],
    )?;
    get_release(conn, project_id, id)
}
