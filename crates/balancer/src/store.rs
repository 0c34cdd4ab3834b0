//! Relational persistence for providers, scaling policies and the request log
//!
//! Rows are validated at this boundary. A row that cannot be turned into
//! a typed record (bad JSON column, unknown enum tag, unparsable id or
//! timestamp, out-of-range priority) is quarantined and reported next to
//! the good rows instead of failing the whole load.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics::{RequestLogEntry, RequestStatus};
use crate::scaling::{ScaleAction, ScalingPolicy, TriggerMetric};
use crate::types::{HealthStatus, Provider, ProviderCost, ProviderId, ProviderKind, RateLimitState};

/// A row rejected by validation
#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedRow {
    pub table: &'static str,
    /// Primary key or row number, whatever identifies the row best
    pub key: String,
    pub reason: String,
}

/// Result of a bulk load: the valid rows plus the rejected ones
#[derive(Debug, Clone)]
pub struct LoadedRows<T> {
    pub rows: Vec<T>,
    pub quarantined: Vec<QuarantinedRow>,
}

impl<T> LoadedRows<T> {
    fn from_results(results: Vec<Result<T, QuarantinedRow>>) -> Self {
        let mut rows = Vec::new();
        let mut quarantined = Vec::new();
        for result in results {
            match result {
                Ok(row) => rows.push(row),
                Err(bad) => {
                    warn!(
                        table = bad.table,
                        key = %bad.key,
                        reason = %bad.reason,
                        "Quarantined malformed row"
                    );
                    quarantined.push(bad);
                }
            }
        }
        Self { rows, quarantined }
    }
}

/// Persistence collaborator used by the engine
#[async_trait]
pub trait ProviderStore: Send + Sync + std::fmt::Debug {
    async fn load_providers(&self) -> Result<LoadedRows<Provider>, StoreError>;

    /// Insert or replace by id
    async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError>;

    async fn load_scaling_policies(&self) -> Result<LoadedRows<ScalingPolicy>, StoreError>;

    /// Insert or replace by id
    async fn save_scaling_policy(&self, policy: &ScalingPolicy) -> Result<(), StoreError>;

    async fn append_request_log(&self, entry: &RequestLogEntry) -> Result<(), StoreError>;

    async fn request_logs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<LoadedRows<RequestLogEntry>, StoreError>;
}

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS providers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        endpoint TEXT NOT NULL,
        credential TEXT NOT NULL,
        models TEXT NOT NULL,
        rate_limit TEXT NOT NULL,
        health_status TEXT NOT NULL,
        cost TEXT NOT NULL,
        priority INTEGER NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS scaling_policies (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        trigger_metric TEXT NOT NULL,
        threshold REAL NOT NULL,
        scale_action TEXT NOT NULL,
        cooldown_period INTEGER NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS request_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider_id TEXT NOT NULL,
        response_time REAL NOT NULL,
        status TEXT NOT NULL,
        cost REAL NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs(timestamp);
"#;

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema exists
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!("Opening SQLite store at {}", path.display());
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn timestamp_text(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order in SQL matches time order
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn column_text(row: &Row<'_>, idx: usize, name: &str) -> Result<String, String> {
    match row.get_ref(idx) {
        Ok(ValueRef::Text(bytes)) => std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| format!("{name} is not valid UTF-8")),
        Ok(other) => Err(format!("{name} has unexpected type {}", other.data_type())),
        Err(e) => Err(format!("{name}: {e}")),
    }
}

fn column_i64(row: &Row<'_>, idx: usize, name: &str) -> Result<i64, String> {
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(value)) => Ok(value),
        Ok(other) => Err(format!("{name} has unexpected type {}", other.data_type())),
        Err(e) => Err(format!("{name}: {e}")),
    }
}

fn column_f64(row: &Row<'_>, idx: usize, name: &str) -> Result<f64, String> {
    match row.get_ref(idx) {
        Ok(ValueRef::Real(value)) => Ok(value),
        Ok(ValueRef::Integer(value)) => Ok(value as f64),
        Ok(other) => Err(format!("{name} has unexpected type {}", other.data_type())),
        Err(e) => Err(format!("{name}: {e}")),
    }
}

fn column_json<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
    name: &str,
) -> Result<T, String> {
    let raw = column_text(row, idx, name)?;
    serde_json::from_str(&raw).map_err(|e| format!("{name} is not valid JSON: {e}"))
}

fn parse_timestamp(raw: &str, name: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("{name} is not an RFC 3339 timestamp: {e}"))
}

fn provider_from_row(row: &Row<'_>) -> Result<Provider, QuarantinedRow> {
    let key = column_text(row, 0, "id").unwrap_or_else(|_| "<unreadable id>".to_string());
    let quarantine = |reason: String| QuarantinedRow {
        table: "providers",
        key: key.clone(),
        reason,
    };

    let id: ProviderId = key
        .parse()
        .map_err(|e| quarantine(format!("id is not a UUID: {e}")))?;
    let kind: ProviderKind = column_text(row, 2, "type")
        .and_then(|raw| raw.parse())
        .map_err(&quarantine)?;
    let models: BTreeSet<String> = column_json(row, 5, "models").map_err(&quarantine)?;
    let rate_limit: RateLimitState = column_json(row, 6, "rate_limit").map_err(&quarantine)?;
    let health: HealthStatus = column_json(row, 7, "health_status").map_err(&quarantine)?;
    let cost: ProviderCost = column_json(row, 8, "cost").map_err(&quarantine)?;
    let priority = column_i64(row, 9, "priority").map_err(&quarantine)?;
    if !(1..=10).contains(&priority) {
        return Err(quarantine(format!("priority {priority} outside 1-10")));
    }
    let is_active = column_i64(row, 10, "is_active").map_err(&quarantine)? != 0;

    Ok(Provider {
        id,
        name: column_text(row, 1, "name").map_err(&quarantine)?,
        kind,
        endpoint: column_text(row, 3, "endpoint").map_err(&quarantine)?,
        credential: column_text(row, 4, "credential").map_err(&quarantine)?,
        models,
        rate_limit,
        health,
        cost,
        priority: priority as u8,
        is_active,
    })
}

fn policy_from_row(row: &Row<'_>) -> Result<ScalingPolicy, QuarantinedRow> {
    let key = column_text(row, 0, "id").unwrap_or_else(|_| "<unreadable id>".to_string());
    let quarantine = |reason: String| QuarantinedRow {
        table: "scaling_policies",
        key: key.clone(),
        reason,
    };

    let id = Uuid::parse_str(&key).map_err(|e| quarantine(format!("id is not a UUID: {e}")))?;
    let trigger_metric: TriggerMetric = column_text(row, 2, "trigger_metric")
        .and_then(|raw| raw.parse())
        .map_err(&quarantine)?;
    let scale_action: ScaleAction = column_text(row, 4, "scale_action")
        .and_then(|raw| raw.parse())
        .map_err(&quarantine)?;
    let cooldown = column_i64(row, 5, "cooldown_period").map_err(&quarantine)?;
    if cooldown < 0 {
        return Err(quarantine(format!("cooldown_period {cooldown} is negative")));
    }

    Ok(ScalingPolicy {
        id,
        name: column_text(row, 1, "name").map_err(&quarantine)?,
        trigger_metric,
        threshold: column_f64(row, 3, "threshold").map_err(&quarantine)?,
        scale_action,
        cooldown_period_secs: cooldown as u64,
        is_active: column_i64(row, 6, "is_active").map_err(&quarantine)? != 0,
        last_fired_at: None,
    })
}

fn log_from_row(row: &Row<'_>) -> Result<RequestLogEntry, QuarantinedRow> {
    let key = column_i64(row, 0, "id")
        .map(|id| id.to_string())
        .unwrap_or_else(|_| "<unreadable rowid>".to_string());
    let quarantine = |reason: String| QuarantinedRow {
        table: "request_logs",
        key: key.clone(),
        reason,
    };

    let provider_id: ProviderId = column_text(row, 1, "provider_id")
        .and_then(|raw| raw.parse().map_err(|e| format!("provider_id is not a UUID: {e}")))
        .map_err(&quarantine)?;
    let status: RequestStatus = column_text(row, 3, "status")
        .and_then(|raw| raw.parse())
        .map_err(&quarantine)?;
    let timestamp = column_text(row, 5, "timestamp")
        .and_then(|raw| parse_timestamp(&raw, "timestamp"))
        .map_err(&quarantine)?;

    Ok(RequestLogEntry {
        provider_id,
        response_time_ms: column_f64(row, 2, "response_time").map_err(&quarantine)?,
        status,
        cost: column_f64(row, 4, "cost").map_err(&quarantine)?,
        timestamp,
    })
}

#[async_trait]
impl ProviderStore for SqliteStore {
    async fn load_providers(&self) -> Result<LoadedRows<Provider>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, type, endpoint, credential, models, rate_limit,
                    health_status, cost, priority, is_active
             FROM providers ORDER BY rowid",
        )?;
        let results = stmt
            .query_map([], |row| Ok(provider_from_row(row)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LoadedRows::from_results(results))
    }

    async fn save_provider(&self, provider: &Provider) -> Result<(), StoreError> {
        let models = serde_json::to_string(&provider.models)?;
        let rate_limit = serde_json::to_string(&provider.rate_limit)?;
        let health = serde_json::to_string(&provider.health)?;
        let cost = serde_json::to_string(&provider.cost)?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO providers (
                id, name, type, endpoint, credential, models, rate_limit,
                health_status, cost, priority, is_active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                type = excluded.type,
                endpoint = excluded.endpoint,
                credential = excluded.credential,
                models = excluded.models,
                rate_limit = excluded.rate_limit,
                health_status = excluded.health_status,
                cost = excluded.cost,
                priority = excluded.priority,
                is_active = excluded.is_active",
            params![
                provider.id.to_string(),
                provider.name,
                provider.kind.as_str(),
                provider.endpoint,
                provider.credential,
                models,
                rate_limit,
                health,
                cost,
                provider.priority as i64,
                provider.is_active,
            ],
        )?;
        Ok(())
    }

    async fn load_scaling_policies(&self) -> Result<LoadedRows<ScalingPolicy>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, trigger_metric, threshold, scale_action, cooldown_period, is_active
             FROM scaling_policies ORDER BY rowid",
        )?;
        let results = stmt
            .query_map([], |row| Ok(policy_from_row(row)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LoadedRows::from_results(results))
    }

    async fn save_scaling_policy(&self, policy: &ScalingPolicy) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scaling_policies (
                id, name, trigger_metric, threshold, scale_action, cooldown_period, is_active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                trigger_metric = excluded.trigger_metric,
                threshold = excluded.threshold,
                scale_action = excluded.scale_action,
                cooldown_period = excluded.cooldown_period,
                is_active = excluded.is_active",
            params![
                policy.id.to_string(),
                policy.name,
                policy.trigger_metric.as_str(),
                policy.threshold,
                policy.scale_action.as_str(),
                policy.cooldown_period_secs as i64,
                policy.is_active,
            ],
        )?;
        Ok(())
    }

    async fn append_request_log(&self, entry: &RequestLogEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO request_logs (provider_id, response_time, status, cost, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.provider_id.to_string(),
                entry.response_time_ms,
                entry.status.as_str(),
                entry.cost,
                timestamp_text(&entry.timestamp),
            ],
        )?;
        Ok(())
    }

    async fn request_logs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<LoadedRows<RequestLogEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, provider_id, response_time, status, cost, timestamp
             FROM request_logs WHERE timestamp >= ?1 ORDER BY id",
        )?;
        let results = stmt
            .query_map(params![timestamp_text(&since)], |row| Ok(log_from_row(row)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LoadedRows::from_results(results))
    }
}
