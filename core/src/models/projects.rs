use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{check_name, check_progress, display_date, now_ts, ProjectStatus};
use crate::errors::{PlanFlowError, PlanFlowResult};

const PROJECT_COLUMNS: &str = "id, name, description, vision, problem_being_solved, status, progress, charter, owner_id, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub vision: Option<String>,
    pub problem_being_solved: Option<String>,
    pub status: ProjectStatus,
    pub progress: f64,
    pub charter: Option<Value>,
    pub owner_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(rename = "lastUpdate")]
    pub last_update: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectCreate {
    pub name: String,
    pub description: Option<String>,
    pub vision: Option<String>,
    pub problem_being_solved: Option<String>,
    pub charter: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub vision: Option<String>,
    pub problem_being_solved: Option<String>,
    pub status: Option<ProjectStatus>,
    pub progress: Option<f64>,
    pub charter: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectPage {
    pub projects: Vec<Project>,
    pub total: i64,
    pub page: i64,
    pub size: i64,
    pub total_pages: i64,
}

fn map_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let updated_at: i64 = row.get(10)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        vision: row.get(3)?,
        problem_being_solved: row.get(4)?,
        status: row.get(5)?,
        progress: row.get(6)?,
        charter: row.get(7)?,
        owner_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at,
        last_update: display_date(updated_at),
    })
}

pub fn create_project(
    conn: &Connection,
    owner_id: i64,
    input: &ProjectCreate,
) -> PlanFlowResult<Project> {
    check_name("name", &input.name, 200)?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO projects (name, description, vision, problem_being_solved, status, progress, charter, owner_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?8)",
        params![
            input.name.trim(),
            input.description,
            input.vision,
            input.problem_being_solved,
            ProjectStatus::Draft,
            input.charter,
            owner_id,
            now
        ],
    )?;
    get_project(conn, owner_id, conn.last_insert_rowid())
}

pub fn get_project(conn: &Connection, owner_id: i64, id: i64) -> PlanFlowResult<Project> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1 AND owner_id = ?2"),
        params![id, owner_id],
        map_project,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("Project"))
}

/// Paginated listing, newest first. `search` matches name or description.
pub fn list_projects(
    conn: &Connection,
    owner_id: i64,
    skip: i64,
    limit: i64,
    search: Option<&str>,
) -> PlanFlowResult<ProjectPage> {
    if !(1..=100).contains(&limit) {
        return Err(PlanFlowError::Validation(
            "limit must be between 1 and 100".to_string(),
        ));
    }
    if skip < 0 {
        return Err(PlanFlowError::Validation("skip must not be negative".to_string()));
    }
    let search = search.map(str::trim).filter(|s| !s.is_empty());
    let filter = "owner_id = ?1 AND (?2 IS NULL OR name LIKE '%' || ?2 || '%' OR description LIKE '%' || ?2 || '%')";

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM projects WHERE {filter}"),
        params![owner_id, search],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE {filter} ORDER BY updated_at DESC, id DESC LIMIT ?3 OFFSET ?4"
    ))?;
    let projects = stmt
        .query_map(params![owner_id, search, limit, skip], map_project)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(ProjectPage {
        size: projects.len() as i64,
        projects,
        total,
        page: skip / limit + 1,
        total_pages: (total + limit - 1) / limit,
    })
}

pub fn update_project(
    conn: &Connection,
    owner_id: i64,
    id: i64,
    input: &ProjectUpdate,
) -> PlanFlowResult<Project> {
    let current = get_project(conn, owner_id, id)?;
    if let Some(name) = &input.name {
        check_name("name", name, 200)?;
    }
    if let Some(progress) = input.progress {
        check_progress(progress)?;
    }
    let name = input
        .name
        .as_deref()
        .map(str::trim)
        .unwrap_or(&current.name);
    conn.execute(
        "UPDATE projects SET name = ?1, description = ?2, vision = ?3, problem_being_solved = ?4,
         status = ?5, progress = ?6, charter = ?7, updated_at = ?8 WHERE id = ?9",
        params![
            name,
            input.description.as_ref().or(current.description.as_ref()),
            input.vision.as_ref().or(current.vision.as_ref()),
            input
                .problem_being_solved
                .as_ref()
                .or(current.problem_being_solved.as_ref()),
            input.status.unwrap_or(current.status),
            input.progress.unwrap_or(current.progress),
            input.charter.as_ref().or(current.charter.as_ref()),
            now_ts(),
            id
        ],
    )?;
    get_project(conn, owner_id, id)
}

pub fn delete_project(conn: &Connection, owner_id: i64, id: i64) -> PlanFlowResult<()> {
    let removed = conn.execute(
        "DELETE FROM projects WHERE id = ?1 AND owner_id = ?2",
        params![id, owner_id],
    )?;
    if removed == 0 {
        return Err(PlanFlowError::NotFound("Project"));
    }
    Ok(())
}
