use crate::error::OperationError;
use crate::workspace::{validate_id, Workspace, WorkspaceStore};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub operations: u64,
}

/// Live sessions. A session owns exactly one workspace, stored under the
/// session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh opaque token for the transport to hand to a client.
    pub fn issue_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Validate the id a request carries.
    pub fn parse_id(session_id: Option<&str>) -> Result<&str, OperationError> {
        let id = session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OperationError::BadRequest("missing session id".to_string()))?;
        validate_id(id).map_err(OperationError::from)
    }

    /// The workspace of `session_id`, creating both on first use.
    pub async fn resolve(
        &self,
        store: &WorkspaceStore,
        session_id: &str,
    ) -> Result<Arc<Workspace>, OperationError> {
        let workspace = store.create(Some(session_id)).await?;

        let now = Utc::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionInfo {
                session_id: session_id.to_string(),
                created_at: now,
                last_used: now,
                operations: 0,
            });
        entry.last_used = now;
        entry.operations += 1;

        Ok(workspace)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.remove(session_id).map(|(_, info)| info)
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}
