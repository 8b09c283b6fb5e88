use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use conductor_core::ids::RunId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRow {
    pub id: RunId,
    pub prompt: String,
    pub orchestrator_enabled: bool,
    pub status: RunStatus,
    pub reply: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct RunRepo {
    db: Database,
}

impl RunRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, prompt), fields(run_id = %run_id))]
    pub fn create(&self, run_id: &RunId, prompt: &str, orchestrator_enabled: bool) -> Result<RunRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (id, prompt, orchestrator_enabled, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?4)",
                rusqlite::params![run_id.as_str(), prompt, orchestrator_enabled, now],
            )?;
            Ok(())
        })?;

        Ok(RunRow {
            id: run_id.clone(),
            prompt: prompt.to_string(),
            orchestrator_enabled,
            status: RunStatus::Running,
            reply: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Record the terminal state. Only a running run can be finished.
    #[instrument(skip(self, reply, error), fields(run_id = %run_id, status = %status))]
    pub fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        reply: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE runs SET status = ?1, reply = ?2, error = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                rusqlite::params![status.to_string(), reply, error, now, run_id.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("running run {run_id}")));
        }
        Ok(())
    }

    /// Fail every run still marked running. Runs do not survive a restart, so
    /// this is called once at startup before any new run is accepted.
    pub fn fail_interrupted(&self, reason: &str) -> Result<usize, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE runs SET status = 'failed', error = ?1, updated_at = ?2 WHERE status = 'running'",
                rusqlite::params![reason, now],
            )?)
        })?;
        if changed > 0 {
            info!(count = changed, "marked interrupted runs as failed");
        }
        Ok(changed)
    }

    pub fn get(&self, run_id: &RunId) -> Result<Option<RunRow>, StoreError> {
        self.db.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT id, prompt, orchestrator_enabled, status, reply, error, created_at, updated_at
                     FROM runs WHERE id = ?1",
                    [run_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, bool>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;

            raw.map(|(id, prompt, orchestrator_enabled, status, reply, error, created_at, updated_at)| {
                let status = status.parse().map_err(|detail| StoreError::CorruptRow {
                    table: "runs",
                    column: "status",
                    detail,
                })?;
                Ok(RunRow {
                    id: RunId::from_raw(id),
                    prompt,
                    orchestrator_enabled,
                    status,
                    reply,
                    error,
                    created_at,
                    updated_at,
                })
            })
            .transpose()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_finish() {
        let repo = RunRepo::new(Database::in_memory().unwrap());
        let id = RunId::new();
        let row = repo.create(&id, "refactor module X", true).unwrap();
        assert_eq!(row.status, RunStatus::Running);

        repo.finish(&id, RunStatus::Completed, Some("all done"), None).unwrap();
        let stored = repo.get(&id).unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.reply.as_deref(), Some("all done"));
        assert!(stored.orchestrator_enabled);
    }

    #[test]
    fn finish_is_once_only() {
        let repo = RunRepo::new(Database::in_memory().unwrap());
        let id = RunId::new();
        repo.create(&id, "p", false).unwrap();
        repo.finish(&id, RunStatus::Failed, None, Some("planner gave up")).unwrap();

        let err = repo.finish(&id, RunStatus::Completed, Some("late"), None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(repo.get(&id).unwrap().unwrap().error.as_deref(), Some("planner gave up"));
    }

    #[test]
    fn interrupted_runs_are_failed() {
        let repo = RunRepo::new(Database::in_memory().unwrap());
        let open = RunId::new();
        let done = RunId::new();
        repo.create(&open, "a", true).unwrap();
        repo.create(&done, "b", true).unwrap();
        repo.finish(&done, RunStatus::Completed, Some("ok"), None).unwrap();

        assert_eq!(repo.fail_interrupted("server restarted").unwrap(), 1);
        let row = repo.get(&open).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("server restarted"));
        assert_eq!(repo.get(&done).unwrap().unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn missing_run_is_none() {
        let repo = RunRepo::new(Database::in_memory().unwrap());
        assert!(repo.get(&RunId::new()).unwrap().is_none());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }
}
