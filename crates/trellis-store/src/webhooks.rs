use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{RunId, WebhookEndpoint, WebhookLog};

use crate::store::{parse_opt_ts, parse_ts, SqliteStore};

const COLUMNS: &str = "id, workflow_id, user_id, token, secret, description, active, \
                       allowed_ips, require_signature, trigger_count, last_triggered_at, \
                       created_at";

#[allow(clippy::type_complexity)]
fn read_row(
    row: &Row<'_>,
) -> rusqlite::Result<(
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    String,
    i64,
    i64,
    Option<String>,
    String,
)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn into_endpoint(
    r: (
        String,
        String,
        String,
        String,
        String,
        Option<String>,
        i64,
        String,
        i64,
        i64,
        Option<String>,
        String,
    ),
) -> Result<WebhookEndpoint> {
    let (
        id,
        workflow_id,
        user_id,
        token,
        secret,
        description,
        active,
        allowed_ips,
        require_signature,
        trigger_count,
        last_triggered_at,
        created_at,
    ) = r;
    Ok(WebhookEndpoint {
        id,
        workflow_id,
        user_id,
        token,
        secret,
        description,
        active: active != 0,
        allowed_ips: serde_json::from_str(&allowed_ips)?,
        require_signature: require_signature != 0,
        trigger_count: trigger_count as u64,
        last_triggered_at: parse_opt_ts(last_triggered_at)?,
        created_at: parse_ts(&created_at)?,
    })
}

impl SqliteStore {
    pub fn create_endpoint(&self, endpoint: &WebhookEndpoint) -> Result<()> {
        let allowed_ips = serde_json::to_string(&endpoint.allowed_ips)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO webhook_endpoints
                 (id, workflow_id, user_id, token, secret, description, active,
                  allowed_ips, require_signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                endpoint.id,
                endpoint.workflow_id,
                endpoint.user_id,
                endpoint.token,
                endpoint.secret,
                endpoint.description,
                endpoint.active as i64,
                allowed_ips,
                endpoint.require_signature as i64,
                endpoint.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        info!(endpoint_id = %endpoint.id, workflow_id = %endpoint.workflow_id,
              "webhook endpoint created");
        Ok(())
    }

    /// Resolve an endpoint from its public path token.
    pub fn find_endpoint_by_token(&self, token: &str) -> Result<Option<WebhookEndpoint>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM webhook_endpoints WHERE token = ?1",
                    COLUMNS
                ),
                params![token],
                read_row,
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        row.map(into_endpoint).transpose()
    }

    pub fn load_endpoint(&self, id: &str) -> Result<Option<WebhookEndpoint>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM webhook_endpoints WHERE id = ?1", COLUMNS),
                params![id],
                read_row,
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        row.map(into_endpoint).transpose()
    }

    pub fn list_endpoints(&self, user_id: &str) -> Result<Vec<WebhookEndpoint>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM webhook_endpoints WHERE user_id = ?1
                 ORDER BY created_at DESC",
                COLUMNS
            ))
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![user_id], read_row)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut endpoints = Vec::new();
        for row in rows {
            endpoints.push(into_endpoint(
                row.map_err(|e| TrellisError::Database(e.to_string()))?,
            )?);
        }
        Ok(endpoints)
    }

    pub fn delete_endpoint(&self, id: &str, user_id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "DELETE FROM webhook_endpoints WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(n > 0)
    }

    pub fn set_endpoint_active(&self, id: &str, user_id: &str, active: bool) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE webhook_endpoints SET active = ?1 WHERE id = ?2 AND user_id = ?3",
                params![active as i64, id, user_id],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(n > 0)
    }

    /// Bump the trigger counter and stamp the last trigger time in one
    /// statement, so concurrent deliveries never lose a count.
    pub fn record_trigger(&self, id: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "UPDATE webhook_endpoints
             SET trigger_count = trigger_count + 1, last_triggered_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    pub fn append_webhook_log(&self, log: &WebhookLog) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO webhook_logs
                 (id, endpoint_id, execution_id, source_ip, status_code, message,
                  processing_time_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log.id,
                log.endpoint_id,
                log.execution_id.as_ref().map(|r| r.0.clone()),
                log.source_ip,
                log.status_code as i64,
                log.message,
                log.processing_time_ms as i64,
                log.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    /// Recent audit entries for one endpoint, newest first.
    pub fn list_webhook_logs(&self, endpoint_id: &str, limit: usize) -> Result<Vec<WebhookLog>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, endpoint_id, execution_id, source_ip, status_code, message,
                        processing_time_ms, created_at
                 FROM webhook_logs WHERE endpoint_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![endpoint_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut logs = Vec::new();
        for row in rows {
            let (id, endpoint_id, execution_id, source_ip, status_code, message, ms, created) =
                row.map_err(|e| TrellisError::Database(e.to_string()))?;
            logs.push(WebhookLog {
                id,
                endpoint_id,
                execution_id: execution_id.map(|s| RunId::from_string(&s)),
                source_ip,
                status_code: status_code as u16,
                message,
                processing_time_ms: ms as u64,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoint(token: &str, user: &str) -> WebhookEndpoint {
        WebhookEndpoint {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: "wf1".into(),
            user_id: user.into(),
            token: token.into(),
            secret: "s3cr3t".into(),
            description: None,
            active: true,
            allowed_ips: vec![],
            require_signature: true,
            trigger_count: 0,
            last_triggered_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn token_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        let ep = sample_endpoint("tok-abc", "alice");
        store.create_endpoint(&ep).unwrap();

        let found = store.find_endpoint_by_token("tok-abc").unwrap().unwrap();
        assert_eq!(found.id, ep.id);
        assert_eq!(found.secret, "s3cr3t");
        assert!(found.require_signature);

        assert!(store.find_endpoint_by_token("nope").unwrap().is_none());
    }

    #[test]
    fn duplicate_token_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_endpoint(&sample_endpoint("tok", "alice")).unwrap();
        assert!(store.create_endpoint(&sample_endpoint("tok", "bob")).is_err());
    }

    #[test]
    fn trigger_counter_accumulates() {
        let store = SqliteStore::in_memory().unwrap();
        let ep = sample_endpoint("tok", "alice");
        store.create_endpoint(&ep).unwrap();

        store.record_trigger(&ep.id).unwrap();
        store.record_trigger(&ep.id).unwrap();

        let found = store.load_endpoint(&ep.id).unwrap().unwrap();
        assert_eq!(found.trigger_count, 2);
        assert!(found.last_triggered_at.is_some());
    }

    #[test]
    fn activation_toggle_checks_owner() {
        let store = SqliteStore::in_memory().unwrap();
        let ep = sample_endpoint("tok", "alice");
        store.create_endpoint(&ep).unwrap();

        assert!(!store.set_endpoint_active(&ep.id, "bob", false).unwrap());
        assert!(store.set_endpoint_active(&ep.id, "alice", false).unwrap());
        assert!(!store.load_endpoint(&ep.id).unwrap().unwrap().active);
    }

    #[test]
    fn audit_log_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let ep = sample_endpoint("tok", "alice");
        store.create_endpoint(&ep).unwrap();

        let run = RunId::new();
        for (code, msg, exec) in [
            (401u16, "invalid signature", None),
            (200u16, "accepted", Some(run.clone())),
        ] {
            store
                .append_webhook_log(&WebhookLog {
                    id: uuid::Uuid::new_v4().to_string(),
                    endpoint_id: ep.id.clone(),
                    execution_id: exec,
                    source_ip: "10.0.0.1".into(),
                    status_code: code,
                    message: msg.into(),
                    processing_time_ms: 3,
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let logs = store.list_webhook_logs(&ep.id, 10).unwrap();
        assert_eq!(logs.len(), 2);
        // Rejections are logged alongside accepted deliveries
        assert!(logs.iter().any(|l| l.status_code == 401));
        assert!(logs
            .iter()
            .any(|l| l.status_code == 200 && l.execution_id.is_some()));
    }
}
