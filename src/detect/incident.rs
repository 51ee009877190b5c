use crate::detect::policy::AlertAction;
use crate::detect::{PeriodSummary, Severity};
use crate::storage::{Pool, StoreError};
use rusqlite::{params, Connection};
use uuid::Uuid;

/// One alert action together with how its delivery went.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Incident {
    pub id: Uuid,
    pub source: String,
    pub key: String,
    pub severity: Severity,
    pub action: String,
    pub target: String,
    pub message: String,
    pub delivered: bool,
    pub error: Option<String>,
    pub new_count: u64,
    pub mean: f64,
    pub probability: f64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Incident {
    pub fn new(
        source: &str,
        summary: &PeriodSummary,
        action: &AlertAction,
        error: Option<String>,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            key: summary.key.clone(),
            severity: action.severity(),
            action: action.kind().to_string(),
            target: action.target().to_string(),
            message: action.message().to_string(),
            delivered: error.is_none(),
            error,
            new_count: summary.new_count,
            mean: summary.mean,
            probability: summary.probability,
            created_at,
        }
    }
}

/// Write an incident row. Called inside the run's persist transaction.
pub fn insert(conn: &Connection, incident: &Incident) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO incidents (id, source, dimension, severity, action, target, message,
                                delivered, error, new_count, mean, probability, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            incident.id.to_string(),
            incident.source,
            incident.key,
            format!("{:?}", incident.severity), // Info, Warning, Critical
            incident.action,
            incident.target,
            incident.message,
            incident.delivered,
            incident.error,
            i64::try_from(incident.new_count).unwrap_or(i64::MAX),
            incident.mean,
            incident.probability,
            crate::storage::format_time(&incident.created_at),
        ],
    )?;
    Ok(())
}

pub struct IncidentManager {
    pool: Pool,
}

impl IncidentManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Most recent incidents first, optionally for one source.
    pub fn list_recent(&self, source: Option<&str>, limit: usize) -> Result<Vec<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, source, dimension, severity, action, target, message, delivered, error,
                    new_count, mean, probability, created_at
             FROM incidents
             WHERE ?1 IS NULL OR source = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![source, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, i64>(9)?,
                row.get::<_, f64>(10)?,
                row.get::<_, f64>(11)?,
                row.get::<_, String>(12)?,
            ))
        })?;

        let mut incidents = Vec::new();
        for r in rows {
            let (id, source, key, severity, action, target, message, delivered, error, new_count, mean, probability, created_at) =
                r?;
            incidents.push(Incident {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("incident id '{}': {}", id, e)))?,
                source,
                key,
                severity: severity
                    .parse()
                    .map_err(|e| StoreError::Corrupt(format!("incident severity: {}", e)))?,
                action,
                target,
                message,
                delivered,
                error,
                new_count: u64::try_from(new_count).unwrap_or_default(),
                mean,
                probability,
                created_at: crate::storage::parse_time(&created_at)?,
            });
        }
        Ok(incidents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AlertLevel;

    #[test]
    fn test_insert_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(&dir.path().join("bugwatch.db")).unwrap();
        let summary = PeriodSummary {
            key: "all".to_string(),
            historical_count: 10,
            historical_secs: 36_000.0,
            new_count: 20,
            period_secs: 600.0,
            mean: 0.1667,
            probability: 0.99999,
            level: AlertLevel::Critical,
        };
        let page = AlertAction::Page {
            service: "on-call".to_string(),
            message: "spike".to_string(),
        };
        let incident = Incident::new("zendesk", &summary, &page, Some("HTTP 500".to_string()), chrono::Utc::now());
        {
            let conn = pool.get().unwrap();
            insert(&conn, &incident).unwrap();
        }

        let manager = IncidentManager::new(pool);
        let all = manager.list_recent(None, 10).unwrap();
        assert_eq!(all, vec![incident]);
        assert!(!all[0].delivered);
        assert_eq!(all[0].severity, Severity::Critical);
        assert!(manager.list_recent(Some("jira"), 10).unwrap().is_empty());
    }
}
