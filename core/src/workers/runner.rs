use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::spawn_blocking;

use super::{claim_job, complete_job, fail_job, get_job, requeue_stale, JobRecord, JobTransport};
use super::{CHARTER_VALIDATE, RELEASE_EXTRACT};
use crate::charter::{charter_from_fields, CharterService};
use crate::db::{DbPool, DEMO_USER_ID};
use crate::errors::{PlanFlowError, PlanFlowResult};
use crate::logging::log_event_pooled;
use crate::models::projects::{get_project, Project};
use crate::release_planner::ReleasePlanner;

const MODULE: &str = "workers";

/// Single consumer of the job queue.
pub struct Worker {
    pool: DbPool,
    transport: Arc<dyn JobTransport>,
    charter: CharterService,
    planner: ReleasePlanner,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        pool: DbPool,
        transport: Arc<dyn JobTransport>,
        charter: CharterService,
        planner: ReleasePlanner,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            transport,
            charter,
            planner,
            poll_interval,
        }
    }

    /// Requeue interrupted jobs, then process until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.recover().await {
            log::error!("failed to requeue interrupted jobs: {err}");
        }
        log::info!("job worker started ({} transport)", self.transport.name());

        while !*shutdown.borrow() {
            let worked = match self.run_once().await {
                Ok(worked) => worked,
                Err(err) => {
                    log::error!("job worker iteration failed: {err}");
                    false
                }
            };
            if worked {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        log::info!("job worker stopped");
    }

    pub async fn recover(&self) -> PlanFlowResult<()> {
        let pool = self.pool.clone();
        let requeued = spawn_blocking(move || -> PlanFlowResult<Vec<String>> {
            let conn = pool.get()?;
            Ok(requeue_stale(&conn)?)
        })
        .await??;
        if !requeued.is_empty() {
            log::warn!("requeued {} interrupted job(s)", requeued.len());
            self.event("warn", "JOB-0100", "interrupted jobs requeued", json!({ "ids": requeued }))
                .await;
        }
        self.transport.recover(&requeued).await
    }

    /// Processes at most one job. Returns whether a job id was taken off the queue.
    pub async fn run_once(&self) -> PlanFlowResult<bool> {
        let Some(job_id) = self.transport.pop().await? else {
            return Ok(false);
        };

        let pool = self.pool.clone();
        let id = job_id.clone();
        let claimed = spawn_blocking(move || -> PlanFlowResult<Option<JobRecord>> {
            let conn = pool.get()?;
            if !claim_job(&conn, &id)? {
                return Ok(None);
            }
            Ok(Some(get_job(&conn, &id)?))
        })
        .await??;

        let Some(job) = claimed else {
            log::debug!("job {job_id} already claimed");
            self.transport.ack(&job_id).await?;
            return Ok(true);
        };

        self.event(
            "info",
            "JOB-0001",
            "job started",
            json!({ "id": job.id, "kind": job.kind, "attempt": job.attempts }),
        )
        .await;

        let outcome = self.execute(&job).await;
        let pool = self.pool.clone();
        let id = job.id.clone();
        let stored = outcome.clone();
        spawn_blocking(move || -> PlanFlowResult<()> {
            let conn = pool.get()?;
            match &stored {
                Ok(result) => complete_job(&conn, &id, result)?,
                Err(message) => fail_job(&conn, &id, message)?,
            }
            Ok(())
        })
        .await??;

        match outcome {
            Ok(_) => {
                log::info!("job {} ({}) completed", job.id, job.kind);
                self.event("info", "JOB-0002", "job completed", json!({ "id": job.id, "kind": job.kind }))
                    .await;
            }
            Err(message) => {
                log::warn!("job {} ({}) failed: {message}", job.id, job.kind);
                self.event(
                    "warn",
                    "JOB-1002",
                    "job failed",
                    json!({ "id": job.id, "kind": job.kind, "error": message }),
                )
                .await;
            }
        }
        self.transport.ack(&job.id).await?;
        Ok(true)
    }

    async fn execute(&self, job: &JobRecord) -> Result<Value, String> {
        let result = match job.kind.as_str() {
            CHARTER_VALIDATE => self.validate_charter(&job.payload).await,
            RELEASE_EXTRACT => self.extract_releases(&job.payload).await,
            other => Err(PlanFlowError::BadRequest(format!("Unknown job kind '{other}'"))),
        };
        result.map_err(|err| err.to_string())
    }

    async fn validate_charter(&self, payload: &Value) -> PlanFlowResult<Value> {
        let text = match payload.get("charter_text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => {
                let project = self.load_project(payload).await?;
                let charter = project.charter.clone().unwrap_or_else(|| {
                    charter_from_fields(
                        &project.name,
                        project.description.as_deref(),
                        project.vision.as_deref(),
                        project.problem_being_solved.as_deref(),
                    )
                });
                charter.to_string()
            }
        };
        let report = self.charter.validate(&text).await;
        serde_json::to_value(report).map_err(|e| PlanFlowError::Unknown(e.to_string()))
    }

    async fn extract_releases(&self, payload: &Value) -> PlanFlowResult<Value> {
        let project = self.load_project(payload).await?;
        let extraction = self.planner.extract(&project).await?;
        serde_json::to_value(extraction).map_err(|e| PlanFlowError::Unknown(e.to_string()))
    }

    async fn load_project(&self, payload: &Value) -> PlanFlowResult<Project> {
        let project_id = payload
            .get("project_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PlanFlowError::BadRequest("job payload has no project_id".to_string()))?;
        let pool = self.pool.clone();
        spawn_blocking(move || {
            let conn = pool.get()?;
            get_project(&conn, DEMO_USER_ID, project_id)
        })
        .await?
    }

    async fn event(&self, level: &str, code: &str, message: &str, data: Value) {
        let pool = self.pool.clone();
        let (level, code, message) = (level.to_string(), code.to_string(), message.to_string());
        let _ = spawn_blocking(move || {
            log_event_pooled(&pool, &level, Some(&code), MODULE, &message, Some(data));
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::{init_db, DatabaseTarget};
    use crate::logging::list_events;
    use crate::model_manager::ModelManager;
    use crate::models::projects::{create_project, ProjectCreate};
    use crate::prompts::PromptManager;
    use crate::workers::{enqueue_job, DatabaseTransport, JobState};

    fn worker(pool: DbPool) -> Worker {
        let prompts = Arc::new(PromptManager::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../prompts"
        )));
        let models = ModelManager::from_settings(pool.clone(), &Settings::default(), prompts);
        Worker::new(
            pool.clone(),
            Arc::new(DatabaseTransport::new(pool)),
            CharterService::new(models.clone()),
            ReleasePlanner::new(models),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn charter_job_completes_without_a_provider() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let id = {
            let conn = pool.get().unwrap();
            enqueue_job(&conn, CHARTER_VALIDATE, json!({ "charter_text": "{\"name\": \"x\"}" }))
                .unwrap()
        };
        let worker = worker(pool.clone());
        assert!(worker.run_once().await.unwrap());
        assert!(!worker.run_once().await.unwrap());

        let conn = pool.get().unwrap();
        let job = get_job(&conn, &id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        let result = job.result.unwrap();
        assert_eq!(result["is_valid"], false);
        assert_eq!(result["ai_status"], "unavailable");
        let events = list_events(&conn, Some(MODULE), 10).unwrap();
        assert_eq!(events[0].code.as_deref(), Some("JOB-0002"));
    }

    #[tokio::test]
    async fn extraction_without_charter_fails_the_job() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let id = {
            let conn = pool.get().unwrap();
            let project = create_project(
                &conn,
                DEMO_USER_ID,
                &ProjectCreate {
                    name: "Bare".to_string(),
                    ..ProjectCreate::default()
                },
            )
            .unwrap();
            enqueue_job(&conn, RELEASE_EXTRACT, json!({ "project_id": project.id })).unwrap()
        };
        let worker = worker(pool.clone());
        worker.run_once().await.unwrap();

        let conn = pool.get().unwrap();
        let job = get_job(&conn, &id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("Project has no charter to work from"));
    }

    #[tokio::test]
    async fn unknown_kind_is_failed() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let id = {
            let conn = pool.get().unwrap();
            enqueue_job(&conn, "digest.daily", json!({})).unwrap()
        };
        worker(pool.clone()).run_once().await.unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(get_job(&conn, &id).unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker(pool).run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
