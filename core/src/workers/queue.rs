use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::task::spawn_blocking;

use crate::config::Settings;
use crate::db::DbPool;
use crate::errors::{PlanFlowError, PlanFlowResult};

const QUEUE_KEY: &str = "planflow:jobs";
const PROCESSING_KEY: &str = "planflow:jobs:processing";

/// Hands job ids from producers to the worker. Job state lives in the database
/// regardless of transport.
#[async_trait]
pub trait JobTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Announce a freshly inserted job.
    async fn push(&self, job_id: &str) -> PlanFlowResult<()>;

    /// Next candidate job id, if any. The caller still has to claim it.
    async fn pop(&self) -> PlanFlowResult<Option<String>>;

    /// The job has reached a final state.
    async fn ack(&self, job_id: &str) -> PlanFlowResult<()>;

    /// Startup hook for ids that were in flight when the process died.
    async fn recover(&self, _requeued: &[String]) -> PlanFlowResult<()> {
        Ok(())
    }
}

/// Uses the `jobs` table as the queue; the worker claims the oldest queued row.
pub struct DatabaseTransport {
    pool: DbPool,
}

impl DatabaseTransport {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobTransport for DatabaseTransport {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn push(&self, _job_id: &str) -> PlanFlowResult<()> {
        Ok(())
    }

    async fn pop(&self) -> PlanFlowResult<Option<String>> {
        let pool = self.pool.clone();
        spawn_blocking(move || -> PlanFlowResult<Option<String>> {
            let conn = pool.get()?;
            Ok(super::next_queued(&conn)?)
        })
        .await?
    }

    async fn ack(&self, _job_id: &str) -> PlanFlowResult<()> {
        Ok(())
    }
}

/// Redis list transport: `LPUSH` to enqueue, `RPOPLPUSH` into a processing list
/// while the job runs, `LREM` once it is done.
pub struct RedisTransport {
    client: redis::Client,
}

fn queue_error(err: redis::RedisError) -> PlanFlowError {
    PlanFlowError::Queue(err.to_string())
}

impl RedisTransport {
    pub fn new(url: &str) -> PlanFlowResult<Self> {
        let client = redis::Client::open(url).map_err(queue_error)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> PlanFlowResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(queue_error)
    }
}

#[async_trait]
impl JobTransport for RedisTransport {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, job_id: &str) -> PlanFlowResult<()> {
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, job_id)
            .await
            .map_err(queue_error)
    }

    async fn pop(&self) -> PlanFlowResult<Option<String>> {
        let mut conn = self.connection().await?;
        conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY)
            .await
            .map_err(queue_error)
    }

    async fn ack(&self, job_id: &str) -> PlanFlowResult<()> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, job_id)
            .await
            .map_err(queue_error)
    }

    async fn recover(&self, requeued: &[String]) -> PlanFlowResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(PROCESSING_KEY).await.map_err(queue_error)?;
        for id in requeued {
            conn.lpush::<_, _, ()>(QUEUE_KEY, id)
                .await
                .map_err(queue_error)?;
        }
        Ok(())
    }
}

/// Redis when `queue_url` is configured, the database otherwise.
pub fn transport_from_settings(
    settings: &Settings,
    pool: DbPool,
) -> PlanFlowResult<Arc<dyn JobTransport>> {
    match settings.queue_url() {
        Some(url) => {
            log::info!("using redis job queue");
            Ok(Arc::new(RedisTransport::new(url)?))
        }
        None => Ok(Arc::new(DatabaseTransport::new(pool))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, DatabaseTarget};
    use crate::workers::{claim_job, enqueue_job, RELEASE_EXTRACT};
    use serde_json::json;

    #[tokio::test]
    async fn database_transport_yields_oldest_queued_job() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let transport = DatabaseTransport::new(pool.clone());
        assert_eq!(transport.pop().await.unwrap(), None);

        let (first, second) = {
            let conn = pool.get().unwrap();
            let first = enqueue_job(&conn, RELEASE_EXTRACT, json!({ "project_id": 1 })).unwrap();
            let second = enqueue_job(&conn, RELEASE_EXTRACT, json!({ "project_id": 2 })).unwrap();
            (first, second)
        };
        assert_eq!(transport.pop().await.unwrap(), Some(first.clone()));
        {
            let conn = pool.get().unwrap();
            claim_job(&conn, &first).unwrap();
        }
        assert_eq!(transport.pop().await.unwrap(), Some(second));
    }

    #[test]
    fn settings_without_queue_url_use_the_database() {
        let pool = init_db(&DatabaseTarget::Memory).unwrap();
        let transport = transport_from_settings(&Settings::default(), pool).unwrap();
        assert_eq!(transport.name(), "database");
    }

    #[test]
    fn malformed_redis_url_is_a_queue_error() {
        assert!(matches!(
            RedisTransport::new("not a url"),
            Err(PlanFlowError::Queue(_))
        ));
    }
}
