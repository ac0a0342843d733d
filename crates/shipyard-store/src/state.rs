//! Current session and instance per project, restored on startup.

use chrono::Utc;
use tracing::instrument;

use shipyard_core::deployment::{InstanceRef, Session};
use shipyard_core::ids::{InstanceId, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, parse_time};

const TABLE: &str = "deployment_state";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredState {
    pub session: Session,
    pub instance: Option<InstanceRef>,
    pub updated_at: String,
}

pub struct DeploymentStateRepo {
    db: Database,
}

impl DeploymentStateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub fn get(&self, project: &str) -> Result<Option<StoredState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, session_created_at, instance_id, preview_url, tunnel_url, updated_at
                 FROM deployment_state WHERE project = ?1",
            )?;
            let mut rows = stmt.query([project])?;
            match rows.next()? {
                Some(row) => row_to_state(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Record a new session. Any previously stored instance is cleared,
    /// since instances never outlive the session that created them.
    #[instrument(skip(self, session), fields(session_id = %session.session_id))]
    pub fn save_session(&self, project: &str, session: &Session) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO deployment_state (project, session_id, session_created_at, instance_id, preview_url, tunnel_url, updated_at)
                 VALUES (?1, ?2, ?3, NULL, NULL, NULL, ?4)
                 ON CONFLICT(project) DO UPDATE SET
                    session_id = excluded.session_id,
                    session_created_at = excluded.session_created_at,
                    instance_id = NULL,
                    preview_url = NULL,
                    tunnel_url = NULL,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    project,
                    session.session_id.as_str(),
                    session.created_at.to_rfc3339(),
                    now
                ],
            )?;
            Ok(())
        })
    }

    /// Set or clear the instance for the project's stored session.
    #[instrument(skip(self, instance))]
    pub fn save_instance(&self, project: &str, instance: Option<&InstanceRef>) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE deployment_state
                 SET instance_id = ?2, preview_url = ?3, tunnel_url = ?4, updated_at = ?5
                 WHERE project = ?1",
                rusqlite::params![
                    project,
                    instance.map(|i| i.instance_id.as_str()),
                    instance.and_then(|i| i.preview_url.as_deref()),
                    instance.and_then(|i| i.tunnel_url.as_deref()),
                    now
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("deployment state for {project}")));
        }
        Ok(())
    }

    pub fn delete(&self, project: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM deployment_state WHERE project = ?1", [project])?;
            Ok(())
        })
    }
}

fn row_to_state(row: &rusqlite::Row<'_>) -> Result<StoredState, StoreError> {
    let session_id: String = get(row, 0, TABLE, "session_id")?;
    let created_raw: String = get(row, 1, TABLE, "session_created_at")?;
    let instance_id: Option<String> = get(row, 2, TABLE, "instance_id")?;
    let preview_url: Option<String> = get(row, 3, TABLE, "preview_url")?;
    let tunnel_url: Option<String> = get(row, 4, TABLE, "tunnel_url")?;

    Ok(StoredState {
        session: Session {
            session_id: SessionId::from_raw(session_id),
            created_at: parse_time(&created_raw, TABLE, "session_created_at")?,
        },
        instance: instance_id.map(|id| InstanceRef {
            instance_id: InstanceId::from_raw(id),
            preview_url,
            tunnel_url,
        }),
        updated_at: get(row, 5, TABLE, "updated_at")?,
    })
}
