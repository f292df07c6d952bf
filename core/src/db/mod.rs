use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;
use time::OffsetDateTime;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Fixed identity every request acts as until authentication exists.
pub const DEMO_USER_ID: i64 = 1;

/// Where the SQLite database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    File(PathBuf),
    Memory,
}

impl DatabaseTarget {
    /// Accepts `sqlite://path`, `sqlite:path`, a bare path or `:memory:`.
    pub fn from_url(url: &str) -> Self {
        let trimmed = url.trim();
        let path = trimmed
            .strip_prefix("sqlite://")
            .or_else(|| trimmed.strip_prefix("sqlite:"))
            .unwrap_or(trimmed);
        if path.is_empty() || path == ":memory:" {
            Self::Memory
        } else {
            Self::File(PathBuf::from(path))
        }
    }
}

pub fn init_db(target: &DatabaseTarget) -> Result<DbPool> {
    let mgr = match target {
        DatabaseTarget::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            SqliteConnectionManager::file(path)
        }
        DatabaseTarget::Memory => SqliteConnectionManager::memory(),
    }
    .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

    // Every in-memory connection is its own database, so keep exactly one.
    let builder = match target {
        DatabaseTarget::Memory => Pool::builder().max_size(1),
        DatabaseTarget::File(_) => Pool::builder(),
    };
    let pool = builder.build(mgr).context("failed to build SQLite pool")?;
    {
        let conn = pool.get()?;
        apply_migrations(&conn)?;
        seed_demo_user(&conn)?;
    }
    Ok(pool)
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_init.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0001_init.sql"
            )),
        ),
        (
            "0002_planning.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0002_planning.sql"
            )),
        ),
        (
            "0003_jobs.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0003_jobs.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}

fn seed_demo_user(conn: &Connection) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT OR IGNORE INTO users (id, email, username, full_name, is_active, created_at, updated_at)
         VALUES (?1, 'demo@planflow.local', 'demo', 'Demo User', 1, ?2, ?2)",
        (DEMO_USER_ID, now),
    )
    .context("failed to seed demo user")?;
    Ok(())
}
