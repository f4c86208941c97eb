/*!
SQLite checkpointer.

Durable implementation of the [`Checkpointer`] trait backed by `sqlx`.
Checkpoint rows and step-history rows live in two tables created on
connect; per-thread write serialization comes from a SQLite transaction
plus the strictly increasing `step_index` guard.

Database layout:

- `checkpoints(thread_id, step_index, state_json, frontier_json,
  join_ledger_json, created_at)` — one row per super-step.
- `steps(execution_id, step_index, node_id, started_at, finished_at,
  input_snapshot_json, output_delta_json, events_json, error_json)`.

Storage grows with `(threads × steps × state size)`; prune old rows with
plain SQL (`DELETE FROM checkpoints WHERE created_at < ...`) followed by
`VACUUM`.
*/

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::instrument;

use crate::runtime::checkpoint::{Checkpoint, Checkpointer, CheckpointerError, StepRecord};
use crate::runtime::persistence::{from_json_str, to_json_string, PersistedCheckpoint};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id   TEXT    NOT NULL,
    step_index  INTEGER NOT NULL,
    state_json  TEXT    NOT NULL,
    frontier_json    TEXT NOT NULL,
    join_ledger_json TEXT NOT NULL,
    created_at  TEXT    NOT NULL,
    PRIMARY KEY (thread_id, step_index)
);
CREATE TABLE IF NOT EXISTS steps (
    execution_id  TEXT    NOT NULL,
    step_index    INTEGER NOT NULL,
    node_id       TEXT    NOT NULL,
    started_at    TEXT    NOT NULL,
    finished_at   TEXT    NOT NULL,
    input_snapshot_json TEXT NOT NULL,
    output_delta_json   TEXT NOT NULL,
    events_json   TEXT    NOT NULL,
    error_json    TEXT
);
CREATE INDEX IF NOT EXISTS idx_steps_execution ON steps (execution_id, step_index);
"#;

fn backend(e: impl std::fmt::Display) -> CheckpointerError {
    CheckpointerError::Backend {
        message: e.to_string(),
    }
}

fn serde_err(e: impl std::fmt::Display) -> CheckpointerError {
    CheckpointerError::Serde {
        message: e.to_string(),
    }
}

/// SQLite-backed checkpointer.
pub struct SqliteCheckpointer {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointer").finish()
    }
}

impl SqliteCheckpointer {
    /// Connects (or creates) a SQLite database, e.g.
    /// `sqlite://agentweave.db?mode=rwc`. With no argument, the URL comes
    /// from `AGENTWEAVE_SQLITE_URL` in the environment or `.env`.
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: Option<&str>) -> Result<Self, CheckpointerError> {
        let url = match database_url {
            Some(url) => url.to_string(),
            None => {
                dotenvy::dotenv().ok();
                std::env::var("AGENTWEAVE_SQLITE_URL")
                    .unwrap_or_else(|_| "sqlite://agentweave.db?mode=rwc".to_string())
            }
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .map_err(backend)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(backend)?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    #[instrument(skip(self, checkpoint), fields(thread_id = %checkpoint.thread_id, step = checkpoint.step_index), err)]
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointerError> {
        let persisted = PersistedCheckpoint::from(&checkpoint);
        let state_json = to_json_string(&persisted.state).map_err(serde_err)?;
        let frontier_json = to_json_string(&persisted.frontier).map_err(serde_err)?;
        let ledger_json = to_json_string(&persisted.join_ledger).map_err(serde_err)?;

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(step_index) FROM checkpoints WHERE thread_id = ?1")
                .bind(&persisted.thread_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(backend)?;
        if let Some(latest) = latest {
            if persisted.step_index as i64 <= latest {
                return Err(CheckpointerError::StaleWrite {
                    thread_id: persisted.thread_id,
                    attempted: persisted.step_index,
                    latest: latest as u64,
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO checkpoints (
                thread_id, step_index, state_json, frontier_json,
                join_ledger_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&persisted.thread_id)
        .bind(persisted.step_index as i64)
        .bind(&state_json)
        .bind(&frontier_json)
        .bind(&ledger_json)
        .bind(&persisted.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)
    }

    #[instrument(skip(self), err)]
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointerError> {
        let row = sqlx::query(
            r#"
            SELECT thread_id, step_index, state_json, frontier_json,
                   join_ledger_json, created_at
            FROM checkpoints
            WHERE thread_id = ?1
            ORDER BY step_index DESC
            LIMIT 1
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else { return Ok(None) };

        let persisted = PersistedCheckpoint {
            thread_id: row.get("thread_id"),
            step_index: row.get::<i64, _>("step_index") as u64,
            state: from_json_str(row.get::<String, _>("state_json").as_str())
                .map_err(serde_err)?,
            frontier: from_json_str(row.get::<String, _>("frontier_json").as_str())
                .map_err(serde_err)?,
            join_ledger: from_json_str(row.get::<String, _>("join_ledger_json").as_str())
                .map_err(serde_err)?,
            created_at: row.get("created_at"),
        };
        Ok(Some(Checkpoint::from(persisted)))
    }

    #[instrument(skip(self, step), fields(execution_id = %step.execution_id, node_id = %step.node_id), err)]
    async fn append_step(&self, step: StepRecord) -> Result<(), CheckpointerError> {
        let events_json = serde_json::to_string(&step.events).map_err(serde_err)?;
        let error_json = step
            .error
            .as_ref()
            .map(|e| serde_json::to_string(e))
            .transpose()
            .map_err(serde_err)?;

        sqlx::query(
            r#"
            INSERT INTO steps (
                execution_id, step_index, node_id, started_at, finished_at,
                input_snapshot_json, output_delta_json, events_json, error_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&step.execution_id)
        .bind(step.step_index as i64)
        .bind(&step.node_id)
        .bind(step.started_at.to_rfc3339())
        .bind(step.finished_at.to_rfc3339())
        .bind(step.input_snapshot.to_string())
        .bind(step.output_delta.to_string())
        .bind(&events_json)
        .bind(error_json)
        .execute(&*self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, CheckpointerError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, step_index, node_id, started_at, finished_at,
                   input_snapshot_json, output_delta_json, events_json, error_json
            FROM steps
            WHERE execution_id = ?1
            ORDER BY step_index ASC, rowid ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let parse_ts = |s: String| {
                    chrono::DateTime::parse_from_rfc3339(&s)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .map_err(serde_err)
                };
                Ok(StepRecord {
                    execution_id: row.get("execution_id"),
                    step_index: row.get::<i64, _>("step_index") as u64,
                    node_id: row.get("node_id"),
                    started_at: parse_ts(row.get("started_at"))?,
                    finished_at: parse_ts(row.get("finished_at"))?,
                    input_snapshot: serde_json::from_str(
                        row.get::<String, _>("input_snapshot_json").as_str(),
                    )
                    .map_err(serde_err)?,
                    output_delta: serde_json::from_str(
                        row.get::<String, _>("output_delta_json").as_str(),
                    )
                    .map_err(serde_err)?,
                    events: serde_json::from_str(row.get::<String, _>("events_json").as_str())
                        .map_err(serde_err)?,
                    error: row
                        .get::<Option<String>, _>("error_json")
                        .map(|e| serde_json::from_str(&e))
                        .transpose()
                        .map_err(serde_err)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_thread(&self, thread_id: &str) -> Result<(), CheckpointerError> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&*self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_threads(&self) -> Result<Vec<String>, CheckpointerError> {
        let rows =
            sqlx::query_scalar::<_, String>("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")
                .fetch_all(&*self.pool)
                .await
                .map_err(backend)?;
        Ok(rows)
    }
}
