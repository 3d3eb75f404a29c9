use bazaar_common::model::UserId;
use bazaar_service_base::storage::SharedStorage;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

pub const AUDIT_LOG_PATH: &str = "audit/audit.log";

/// Append-only record of authenticated actions, written through the shared
/// storage layer so it ships independently of application logs.
pub struct AuditLog {
    storage: Arc<dyn SharedStorage>,
}

impl AuditLog {
    pub fn new(storage: Arc<dyn SharedStorage>) -> Self {
        Self { storage }
    }

    pub async fn record(&self, user_id: Option<UserId>, method: &str, path: &str, status: u16) {
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "user_id": user_id.map(|id| id.to_string()),
            "method": method,
            "path": path,
            "status": status,
        });
        let mut entry = line.to_string();
        entry.push('\n');
        if let Err(e) = self.storage.append(AUDIT_LOG_PATH, entry.as_bytes()).await {
            // the request must not fail because auditing did
            error!("failed to append audit record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use bazaar_service_base::storage::memory::InMemoryStorage;

    #[test]
    async fn records_are_json_lines() {
        let storage = Arc::new(InMemoryStorage::new());
        let audit = AuditLog::new(storage.clone());
        let user = UserId::new_v4();
        audit
            .record(Some(user), "POST", "/api/v2/train/ndb", 200)
            .await;
        audit.record(None, "GET", "/api/v2/user/login", 401).await;

        let content = storage.read(AUDIT_LOG_PATH).await.unwrap();
        let lines: Vec<&str> = std::str::from_utf8(&content)
            .unwrap()
            .lines()
            .collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["user_id"], user.to_string());
        assert_eq!(first["method"], "POST");
        assert_eq!(first["status"], 200);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(second["user_id"].is_null());
    }
}
