//! Deployment history: one row per top-level deployment plus its failed attempts.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use shipyard_core::deployment::InstanceRef;
use shipyard_core::ids::{DeploymentId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, parse_enum};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Running,
    Completed,
    /// The caller gave up waiting. The loop may still complete later.
    TimedOut,
    /// Replaced by a newer retry loop before converging.
    Superseded,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "timed_out" => Ok(Self::TimedOut),
            "superseded" => Ok(Self::Superseded),
            _ => Err(format!("unknown deployment status: {s}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRow {
    pub id: DeploymentId,
    pub project: String,
    pub session_id: SessionId,
    pub status: DeploymentStatus,
    pub file_count: u32,
    pub attempts: u32,
    pub instance_id: Option<String>,
    pub preview_url: Option<String>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRow {
    pub attempt: u32,
    pub session_id: SessionId,
    pub error: String,
    pub error_kind: String,
    pub retry_in_ms: u64,
    pub session_rotated: bool,
}

pub struct DeploymentHistoryRepo {
    db: Database,
}

const SELECT_DEPLOYMENT: &str = "SELECT id, project, session_id, status, file_count, attempts,
        instance_id, preview_url, error, started_at, finished_at FROM deployments";

impl DeploymentHistoryRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(deployment_id = %id))]
    pub fn start(
        &self,
        id: &DeploymentId,
        project: &str,
        session_id: &SessionId,
        file_count: usize,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deployments (id, project, session_id, status, file_count, started_at)
                 VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
                rusqlite::params![id.as_str(), project, session_id.as_str(), file_count as i64, now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, attempt), fields(deployment_id = %id, attempt = attempt.attempt))]
    pub fn record_attempt(&self, id: &DeploymentId, attempt: &AttemptRow) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO deployment_attempts
                    (deployment_id, attempt, session_id, error, error_kind, retry_in_ms, session_rotated, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    attempt.attempt,
                    attempt.session_id.as_str(),
                    attempt.error,
                    attempt.error_kind,
                    attempt.retry_in_ms as i64,
                    attempt.session_rotated,
                    now
                ],
            )?;
            conn.execute(
                "UPDATE deployments SET attempts = MAX(attempts, ?2) WHERE id = ?1",
                rusqlite::params![id.as_str(), attempt.attempt],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self, instance), fields(deployment_id = %id))]
    pub fn complete(&self, id: &DeploymentId, attempts: u32, instance: &InstanceRef) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.update(id, |conn| {
            conn.execute(
                "UPDATE deployments
                 SET status = 'completed', attempts = ?2, instance_id = ?3, preview_url = ?4,
                     error = NULL, finished_at = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    id.as_str(),
                    attempts,
                    instance.instance_id.as_str(),
                    instance.preview_url,
                    now
                ],
            )
        })
    }

    /// Finished deployments are left alone, so a late completion wins.
    pub fn mark_timed_out(&self, id: &DeploymentId, error: &str) -> Result<(), StoreError> {
        self.mark_unfinished(id, DeploymentStatus::TimedOut, error)
    }

    pub fn mark_superseded(&self, id: &DeploymentId) -> Result<(), StoreError> {
        self.mark_unfinished(id, DeploymentStatus::Superseded, "superseded by a newer deployment")
    }

    fn mark_unfinished(&self, id: &DeploymentId, status: DeploymentStatus, error: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE deployments SET status = ?2, error = ?3, finished_at = ?4
                 WHERE id = ?1 AND status IN ('running', 'timed_out')",
                rusqlite::params![id.as_str(), status.to_string(), error, now],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &DeploymentId) -> Result<DeploymentRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_DEPLOYMENT} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_deployment(row),
                None => Err(StoreError::NotFound(format!("deployment {id}"))),
            }
        })
    }

    /// Most recent first.
    pub fn list(&self, project: &str, limit: u32) -> Result<Vec<DeploymentRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_DEPLOYMENT} WHERE project = ?1 ORDER BY rowid DESC LIMIT ?2"
            ))?;
            let mut rows = stmt.query(rusqlite::params![project, limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_deployment(row)?);
            }
            Ok(out)
        })
    }

    pub fn attempts(&self, id: &DeploymentId) -> Result<Vec<AttemptRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT attempt, session_id, error, error_kind, retry_in_ms, session_rotated
                 FROM deployment_attempts WHERE deployment_id = ?1 ORDER BY attempt",
            )?;
            let rows = stmt
                .query_map([id.as_str()], |row| {
                    Ok(AttemptRow {
                        attempt: row.get(0)?,
                        session_id: SessionId::from_raw(row.get::<_, String>(1)?),
                        error: row.get(2)?,
                        error_kind: row.get(3)?,
                        retry_in_ms: row.get::<_, i64>(4)?.max(0) as u64,
                        session_rotated: row.get(5)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn update<F>(&self, id: &DeploymentId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<usize>,
    {
        let changed = self.db.with_conn(|conn| Ok(f(conn)?))?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("deployment {id}")));
        }
        Ok(())
    }
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> Result<DeploymentRow, StoreError> {
    const T: &str = "deployments";
    let status: String = get(row, 3, T, "status")?;
    Ok(DeploymentRow {
        id: DeploymentId::from_raw(get::<String>(row, 0, T, "id")?),
        project: get(row, 1, T, "project")?,
        session_id: SessionId::from_raw(get::<String>(row, 2, T, "session_id")?),
        status: parse_enum(&status, T, "status")?,
        file_count: get(row, 4, T, "file_count")?,
        attempts: get(row, 5, T, "attempts")?,
        instance_id: get(row, 6, T, "instance_id")?,
        preview_url: get(row, 7, T, "preview_url")?,
        error: get(row, 8, T, "error")?,
        started_at: get(row, 9, T, "started_at")?,
        finished_at: get(row, 10, T, "finished_at")?,
    })
}
