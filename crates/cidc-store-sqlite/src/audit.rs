use cidc_audit::{
    AuditAction, AuditEvent, AuditLog, AuditLogError, AuditLogFilter, AuditLogId, AuditResult,
};
use uuid::Uuid;

use crate::{from_millis, to_millis, SqliteLedger};

const AUDIT_COLUMNS: &str = "id, timestamp, actor_user_id, subject_user_id, action, \
     resource_type, resource_id, trial_id, upload_type, result, reason, details";

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    timestamp: i64,
    actor_user_id: Option<String>,
    subject_user_id: Option<String>,
    action: String,
    resource_type: String,
    resource_id: String,
    trial_id: Option<String>,
    upload_type: Option<String>,
    result: String,
    reason: Option<String>,
    details: Option<String>,
}

fn db_err(e: impl std::fmt::Display) -> AuditLogError {
    AuditLogError::Database(e.to_string())
}

fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>, AuditLogError> {
    s.map(|s| Uuid::try_parse(&s).map_err(db_err)).transpose()
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = AuditLogError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditEvent {
            id: row.id.parse::<AuditLogId>().map_err(db_err)?,
            timestamp: from_millis(row.timestamp).map_err(db_err)?,
            actor_user_id: parse_opt_uuid(row.actor_user_id)?,
            subject_user_id: parse_opt_uuid(row.subject_user_id)?,
            action: row.action.parse::<AuditAction>().map_err(db_err)?,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            trial_id: row.trial_id,
            upload_type: row.upload_type,
            result: row.result.parse::<AuditResult>().map_err(db_err)?,
            reason: row.reason,
            details: row
                .details
                .map(|d| serde_json::from_str(&d))
                .transpose()
                .map_err(db_err)?,
        })
    }
}

/// WHERE clause for a filter; binds are applied in the same order by [`bind_filter`].
fn filter_clause(filter: &AuditLogFilter) -> String {
    let mut sql = String::from(" WHERE 1 = 1");
    if filter.actor_user_id.is_some() {
        sql.push_str(" AND actor_user_id = ?");
    }
    if filter.subject_user_id.is_some() {
        sql.push_str(" AND subject_user_id = ?");
    }
    if filter.trial_id.is_some() {
        sql.push_str(" AND trial_id = ?");
    }
    if filter.action.is_some() {
        sql.push_str(" AND action = ?");
    }
    if filter.result.is_some() {
        sql.push_str(" AND result = ?");
    }
    if filter.from.is_some() {
        sql.push_str(" AND timestamp >= ?");
    }
    if filter.to.is_some() {
        sql.push_str(" AND timestamp < ?");
    }
    sql
}

fn bind_filter<'q, O>(
    mut query: sqlx::query::QueryAs<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &AuditLogFilter,
) -> sqlx::query::QueryAs<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(actor) = &filter.actor_user_id {
        query = query.bind(actor.0.to_string());
    }
    if let Some(subject) = &filter.subject_user_id {
        query = query.bind(subject.0.to_string());
    }
    if let Some(trial_id) = &filter.trial_id {
        query = query.bind(trial_id.0.clone());
    }
    if let Some(action) = &filter.action {
        query = query.bind(action.to_string());
    }
    if let Some(result) = &filter.result {
        query = query.bind(result.to_string());
    }
    if let Some(from) = filter.from {
        query = query.bind(to_millis(from));
    }
    if let Some(to) = filter.to {
        query = query.bind(to_millis(to));
    }
    query
}

#[async_trait::async_trait]
impl AuditLog for SqliteLedger {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditLogError> {
        let details = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO audit_logs(id, timestamp, actor_user_id, subject_user_id, action, resource_type, resource_id, trial_id, upload_type, result, reason, details)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(to_millis(event.timestamp))
        .bind(event.actor_user_id.map(|u| u.to_string()))
        .bind(event.subject_user_id.map(|u| u.to_string()))
        .bind(event.action.to_string())
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.trial_id)
        .bind(&event.upload_type)
        .bind(event.result.to_string())
        .bind(&event.reason)
        .bind(details)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn query(&self, filter: AuditLogFilter) -> Result<Vec<AuditEvent>, AuditLogError> {
        let sql = format!(
            "SELECT {} FROM audit_logs{} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            AUDIT_COLUMNS,
            filter_clause(&filter)
        );
        let query = bind_filter(sqlx::query_as::<_, AuditRow>(&sql), &filter)
            .bind(filter.limit.map(i64::from).unwrap_or(-1))
            .bind(filter.offset.map(i64::from).unwrap_or(0));
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter().map(AuditEvent::try_from).collect()
    }

    async fn get(&self, id: AuditLogId) -> Result<AuditEvent, AuditLogError> {
        let sql = format!("SELECT {} FROM audit_logs WHERE id = ?", AUDIT_COLUMNS);
        let row = sqlx::query_as::<_, AuditRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(AuditLogError::NotFound(id))?;
        AuditEvent::try_from(row)
    }

    async fn count(&self, filter: AuditLogFilter) -> Result<u64, AuditLogError> {
        let sql = format!("SELECT COUNT(*) FROM audit_logs{}", filter_clause(&filter));
        let (count,) = bind_filter(sqlx::query_as::<_, (i64,)>(&sql), &filter)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        u64::try_from(count).map_err(db_err)
    }
}
