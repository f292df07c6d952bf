//! Epics, user stories and the use cases / test cases hanging off stories.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{
    check_name, check_progress, list_from_row, list_to_sql, now_ts, Automation, EpicStatus,
    Priority, StoryStatus,
};
use crate::errors::{PlanFlowError, PlanFlowResult};

fn delete_row(conn: &Connection, table: &str, id: i64, entity: &'static str) -> PlanFlowResult<()> {
    let removed = conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [id])?;
    if removed == 0 {
        return Err(PlanFlowError::NotFound(entity));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Epics
// ---------------------------------------------------------------------------

const EPIC_COLUMNS: &str = "id, name, description, version, status, progress, acceptance_criteria, business_value, technical_notes, architecture_notes, release_id, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct Epic {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    pub status: EpicStatus,
    pub progress: f64,
    pub acceptance_criteria: Vec<String>,
    pub business_value: Option<String>,
    pub technical_notes: Option<String>,
    pub architecture_notes: Option<String>,
    pub release_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpicCreate {
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub status: EpicStatus,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub business_value: Option<String>,
    pub technical_notes: Option<String>,
    pub architecture_notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpicUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub status: Option<EpicStatus>,
    pub progress: Option<f64>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub business_value: Option<String>,
    pub technical_notes: Option<String>,
    pub architecture_notes: Option<String>,
}

fn map_epic(row: &Row<'_>) -> rusqlite::Result<Epic> {
    Ok(Epic {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        version: row.get(3)?,
        status: row.get(4)?,
        progress: row.get(5)?,
        acceptance_criteria: list_from_row(row, 6)?,
        business_value: row.get(7)?,
        technical_notes: row.get(8)?,
        architecture_notes: row.get(9)?,
        release_id: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

pub fn create_epic(conn: &Connection, release_id: i64, input: &EpicCreate) -> PlanFlowResult<Epic> {
    check_name("name", &input.name, 200)?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO epics (name, description, version, status, progress, acceptance_criteria, business_value, technical_notes, architecture_notes, release_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            input.name.trim(),
            input.description,
            input.version,
            input.status,
            list_to_sql(&input.acceptance_criteria),
            input.business_value,
            input.technical_notes,
            input.architecture_notes,
            release_id,
            now
        ],
    )?;
    get_epic(conn, conn.last_insert_rowid())
}

pub fn list_epics(conn: &Connection, release_id: i64) -> PlanFlowResult<Vec<Epic>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EPIC_COLUMNS} FROM epics WHERE release_id = ?1 ORDER BY id ASC"
    ))?;
    let epics = stmt
        .query_map([release_id], map_epic)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(epics)
}

pub fn get_epic(conn: &Connection, id: i64) -> PlanFlowResult<Epic> {
    conn.query_row(
        &format!("SELECT {EPIC_COLUMNS} FROM epics WHERE id = ?1"),
        [id],
        map_epic,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("Epic"))
}

pub fn update_epic(conn: &Connection, id: i64, input: &EpicUpdate) -> PlanFlowResult<Epic> {
    let current = get_epic(conn, id)?;
    if let Some(name) = &input.name {
        check_name("name", name, 200)?;
    }
    if let Some(progress) = input.progress {
        check_progress(progress)?;
    }
    conn.execute(
        "UPDATE epics SET name = ?1, description = ?2, version = ?3, status = ?4, progress = ?5,
         acceptance_criteria = ?6, business_value = ?7, technical_notes = ?8, architecture_notes = ?9,
         updated_at = ?10 WHERE id = ?11",
        params![
            input.name.as_deref().map(str::trim).unwrap_or(&current.name),
            input.description.as_ref().or(current.description.as_ref()),
            input.version.as_ref().or(current.version.as_ref()),
            input.status.unwrap_or(current.status),
            input.progress.unwrap_or(current.progress),
            list_to_sql(
                input
                    .acceptance_criteria
                    .as_ref()
                    .unwrap_or(&current.acceptance_criteria)
            ),
            input.business_value.as_ref().or(current.business_value.as_ref()),
            input.technical_notes.as_ref().or(current.technical_notes.as_ref()),
            input
                .architecture_notes
                .as_ref()
                .or(current.architecture_notes.as_ref()),
            now_ts(),
            id
        ],
    )?;
    get_epic(conn, id)
}

pub fn delete_epic(conn: &Connection, id: i64) -> PlanFlowResult<()> {
    delete_row(conn, "epics", id, "Epic")
}

// ---------------------------------------------------------------------------
// User stories
// ---------------------------------------------------------------------------

const STORY_COLUMNS: &str = "id, name, description, story_points, status, priority, assignee_id, acceptance_criteria, business_value, technical_notes, architecture_recommendations, epic_id, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct UserStory {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub story_points: Option<i64>,
    pub status: StoryStatus,
    pub priority: Priority,
    pub assignee_id: Option<i64>,
    pub acceptance_criteria: Vec<String>,
    pub business_value: Option<String>,
    pub technical_notes: Option<String>,
    pub architecture_recommendations: Vec<String>,
    pub epic_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoryCreate {
    pub name: String,
    pub description: Option<String>,
    pub story_points: Option<i64>,
    #[serde(default)]
    pub status: StoryStatus,
    #[serde(default)]
    pub priority: Priority,
    pub assignee_id: Option<i64>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub business_value: Option<String>,
    pub technical_notes: Option<String>,
    #[serde(default)]
    pub architecture_recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoryUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub story_points: Option<i64>,
    pub status: Option<StoryStatus>,
    pub priority: Option<Priority>,
    pub assignee_id: Option<i64>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub business_value: Option<String>,
    pub technical_notes: Option<String>,
    pub architecture_recommendations: Option<Vec<String>>,
}

fn map_story(row: &Row<'_>) -> rusqlite::Result<UserStory> {
    Ok(UserStory {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        story_points: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        assignee_id: row.get(6)?,
        acceptance_criteria: list_from_row(row, 7)?,
        business_value: row.get(8)?,
        technical_notes: row.get(9)?,
        architecture_recommendations: list_from_row(row, 10)?,
        epic_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn check_points(points: Option<i64>) -> PlanFlowResult<()> {
    if points.is_some_and(|p| p < 0) {
        return Err(PlanFlowError::Validation(
            "story_points must not be negative".to_string(),
        ));
    }
    Ok(())
}

pub fn create_story(conn: &Connection, epic_id: i64, input: &StoryCreate) -> PlanFlowResult<UserStory> {
    check_name("name", &input.name, 200)?;
    check_points(input.story_points)?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO user_stories (name, description, story_points, status, priority, assignee_id, acceptance_criteria, business_value, technical_notes, architecture_recommendations, epic_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            input.name.trim(),
            input.description,
            input.story_points,
            input.status,
            input.priority,
            input.assignee_id,
            list_to_sql(&input.acceptance_criteria),
            input.business_value,
            input.technical_notes,
            list_to_sql(&input.architecture_recommendations),
            epic_id,
            now
        ],
    )?;
    get_story(conn, conn.last_insert_rowid())
}

pub fn list_stories(conn: &Connection, epic_id: i64) -> PlanFlowResult<Vec<UserStory>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STORY_COLUMNS} FROM user_stories WHERE epic_id = ?1 ORDER BY id ASC"
    ))?;
    let stories = stmt
        .query_map([epic_id], map_story)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(stories)
}

pub fn get_story(conn: &Connection, id: i64) -> PlanFlowResult<UserStory> {
    conn.query_row(
        &format!("SELECT {STORY_COLUMNS} FROM user_stories WHERE id = ?1"),
        [id],
        map_story,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("User story"))
}

pub fn update_story(conn: &Connection, id: i64, input: &StoryUpdate) -> PlanFlowResult<UserStory> {
    let current = get_story(conn, id)?;
    if let Some(name) = &input.name {
        check_name("name", name, 200)?;
    }
    check_points(input.story_points)?;
    conn.execute(
        "UPDATE user_stories SET name = ?1, description = ?2, story_points = ?3, status = ?4, priority = ?5,
         assignee_id = ?6, acceptance_criteria = ?7, business_value = ?8, technical_notes = ?9,
         architecture_recommendations = ?10, updated_at = ?11 WHERE id = ?12",
        params![
            input.name.as_deref().map(str::trim).unwrap_or(&current.name),
            input.description.as_ref().or(current.description.as_ref()),
            input.story_points.or(current.story_points),
            input.status.unwrap_or(current.status),
            input.priority.unwrap_or(current.priority),
            input.assignee_id.or(current.assignee_id),
            list_to_sql(
                input
                    .acceptance_criteria
                    .as_ref()
                    .unwrap_or(&current.acceptance_criteria)
            ),
            input.business_value.as_ref().or(current.business_value.as_ref()),
            input.technical_notes.as_ref().or(current.technical_notes.as_ref()),
            list_to_sql(
                input
                    .architecture_recommendations
                    .as_ref()
                    .unwrap_or(&current.architecture_recommendations)
            ),
            now_ts(),
            id
        ],
    )?;
    get_story(conn, id)
}

pub fn delete_story(conn: &Connection, id: i64) -> PlanFlowResult<()> {
    delete_row(conn, "user_stories", id, "User story")
}

// ---------------------------------------------------------------------------
// Use cases
// ---------------------------------------------------------------------------

const USE_CASE_COLUMNS: &str = "id, title, description, preconditions, main_flow, alternative_flows, postconditions, primary_actor, secondary_actors, user_story_id, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct UseCase {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub preconditions: Vec<String>,
    pub main_flow: Vec<String>,
    pub alternative_flows: Vec<String>,
    pub postconditions: Vec<String>,
    pub primary_actor: Option<String>,
    pub secondary_actors: Vec<String>,
    pub user_story_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UseCaseCreate {
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub main_flow: Vec<String>,
    #[serde(default)]
    pub alternative_flows: Vec<String>,
    #[serde(default)]
    pub postconditions: Vec<String>,
    pub primary_actor: Option<String>,
    #[serde(default)]
    pub secondary_actors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UseCaseUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub preconditions: Option<Vec<String>>,
    pub main_flow: Option<Vec<String>>,
    pub alternative_flows: Option<Vec<String>>,
    pub postconditions: Option<Vec<String>>,
    pub primary_actor: Option<String>,
    pub secondary_actors: Option<Vec<String>>,
}

fn map_use_case(row: &Row<'_>) -> rusqlite::Result<UseCase> {
    Ok(UseCase {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        preconditions: list_from_row(row, 3)?,
        main_flow: list_from_row(row, 4)?,
        alternative_flows: list_from_row(row, 5)?,
        postconditions: list_from_row(row, 6)?,
        primary_actor: row.get(7)?,
        secondary_actors: list_from_row(row, 8)?,
        user_story_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub fn create_use_case(conn: &Connection, story_id: i64, input: &UseCaseCreate) -> PlanFlowResult<UseCase> {
    check_name("title", &input.title, 200)?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO use_cases (title, description, preconditions, main_flow, alternative_flows, postconditions, primary_actor, secondary_actors, user_story_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            input.title.trim(),
            input.description,
            list_to_sql(&input.preconditions),
            list_to_sql(&input.main_flow),
            list_to_sql(&input.alternative_flows),
            list_to_sql(&input.postconditions),
            input.primary_actor,
            list_to_sql(&input.secondary_actors),
            story_id,
            now
        ],
    )?;
    get_use_case(conn, conn.last_insert_rowid())
}

pub fn list_use_cases(conn: &Connection, story_id: i64) -> PlanFlowResult<Vec<UseCase>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {USE_CASE_COLUMNS} FROM use_cases WHERE user_story_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([story_id], map_use_case)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_use_case(conn: &Connection, id: i64) -> PlanFlowResult<UseCase> {
    conn.query_row(
        &format!("SELECT {USE_CASE_COLUMNS} FROM use_cases WHERE id = ?1"),
        [id],
        map_use_case,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("Use case"))
}

pub fn update_use_case(conn: &Connection, id: i64, input: &UseCaseUpdate) -> PlanFlowResult<UseCase> {
    let current = get_use_case(conn, id)?;
    if let Some(title) = &input.title {
        check_name("title", title, 200)?;
    }
    conn.execute(
        "UPDATE use_cases SET title = ?1, description = ?2, preconditions = ?3, main_flow = ?4,
         alternative_flows = ?5, postconditions = ?6, primary_actor = ?7, secondary_actors = ?8,
         updated_at = ?9 WHERE id = ?10",
        params![
            input.title.as_deref().map(str::trim).unwrap_or(&current.title),
            input.description.as_ref().or(current.description.as_ref()),
            list_to_sql(input.preconditions.as_ref().unwrap_or(&current.preconditions)),
            list_to_sql(input.main_flow.as_ref().unwrap_or(&current.main_flow)),
            list_to_sql(
                input
                    .alternative_flows
                    .as_ref()
                    .unwrap_or(&current.alternative_flows)
            ),
            list_to_sql(input.postconditions.as_ref().unwrap_or(&current.postconditions)),
            input.primary_actor.as_ref().or(current.primary_actor.as_ref()),
            list_to_sql(
                input
                    .secondary_actors
                    .as_ref()
                    .unwrap_or(&current.secondary_actors)
            ),
            now_ts(),
            id
        ],
    )?;
    get_use_case(conn, id)
}

pub fn delete_use_case(conn: &Connection, id: i64) -> PlanFlowResult<()> {
    delete_row(conn, "use_cases", id, "Use case")
}

// ---------------------------------------------------------------------------
// Test cases
// ---------------------------------------------------------------------------

const TEST_CASE_COLUMNS: &str = "id, title, description, test_type, preconditions, test_steps, expected_results, priority, automated, user_story_id, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub test_type: Option<String>,
    pub preconditions: Vec<String>,
    pub test_steps: Vec<String>,
    pub expected_results: Vec<String>,
    pub priority: Priority,
    pub automated: Automation,
    pub user_story_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestCaseCreate {
    pub title: String,
    pub description: Option<String>,
    pub test_type: Option<String>,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub test_steps: Vec<String>,
    #[serde(default)]
    pub expected_results: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub automated: Automation,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestCaseUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub test_type: Option<String>,
    pub preconditions: Option<Vec<String>>,
    pub test_steps: Option<Vec<String>>,
    pub expected_results: Option<Vec<String>>,
    pub priority: Option<Priority>,
    pub automated: Option<Automation>,
}

fn map_test_case(row: &Row<'_>) -> rusqlite::Result<TestCase> {
    Ok(TestCase {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        test_type: row.get(3)?,
        preconditions: list_from_row(row, 4)?,
        test_steps: list_from_row(row, 5)?,
        expected_results: list_from_row(row, 6)?,
        priority: row.get(7)?,
        automated: row.get(8)?,
        user_story_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn check_test_type(test_type: Option<&str>) -> PlanFlowResult<()> {
    if test_type.is_some_and(|t| t.chars().count() > 50) {
        return Err(PlanFlowError::Validation(
            "test_type must be at most 50 characters".to_string(),
        ));
    }
    Ok(())
}

pub fn create_test_case(conn: &Connection, story_id: i64, input: &TestCaseCreate) -> PlanFlowResult<TestCase> {
    check_name("title", &input.title, 200)?;
    check_test_type(input.test_type.as_deref())?;
    let now = now_ts();
    conn.execute(
        "INSERT INTO test_cases (title, description, test_type, preconditions, test_steps, expected_results, priority, automated, user_story_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            input.title.trim(),
            input.description,
            input.test_type,
            list_to_sql(&input.preconditions),
            list_to_sql(&input.test_steps),
            list_to_sql(&input.expected_results),
            input.priority,
            input.automated,
            story_id,
            now
        ],
    )?;
    get_test_case(conn, conn.last_insert_rowid())
}

pub fn list_test_cases(conn: &Connection, story_id: i64) -> PlanFlowResult<Vec<TestCase>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TEST_CASE_COLUMNS} FROM test_cases WHERE user_story_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map([story_id], map_test_case)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_test_case(conn: &Connection, id: i64) -> PlanFlowResult<TestCase> {
    conn.query_row(
        &format!("SELECT {TEST_CASE_COLUMNS} FROM test_cases WHERE id = ?1"),
        [id],
        map_test_case,
    )
    .optional()?
    .ok_or(PlanFlowError::NotFound("Test case"))
}

pub fn update_test_case(conn: &Connection, id: i64, input: &TestCaseUpdate) -> PlanFlowResult<TestCase> {
    let current = get_test_case(conn, id)?;
    if let Some(title) = &input.title {
        check_name("title", title, 200)?;
    }
    check_test_type(input.test_type.as_deref())?;
    conn.execute(
        "UPDATE test_cases SET title = ?1, description = ?2, test_type = ?3, preconditions = ?4,
         test_steps = ?5, expected_results = ?6, priority = ?7, automated = ?8, updated_at = ?9
         WHERE id = ?10",
        params![
            input.title.as_deref().map(str::trim).unwrap_or(&current.title),
            input.description.as_ref().or(current.description.as_ref()),
            input.test_type.as_ref().or(current.test_type.as_ref()),
            list_to_sql(input.preconditions.as_ref().unwrap_or(&current.preconditions)),
            list_to_sql(input.test_steps.as_ref().unwrap_or(&current.test_steps)),
            list_to_sql(
                input
                    .expected_results
                    .as_ref()
                    .unwrap_or(&current.expected_results)
            ),
            input.priority.unwrap_or(current.priority),
            input.automated.unwrap_or(current.automated),
            now_ts(),
            id
        ],
    )?;
    get_test_case(conn, id)
}

pub fn delete_test_case(conn: &Connection, id: i64) -> PlanFlowResult<()> {
    delete_row(conn, "test_cases", id, "Test case")
}
