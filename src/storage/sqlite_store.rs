use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::engine::types::{FlowSnapshot, FlowStatus};
use crate::storage::{FlowFilter, FlowPage, FlowStore, Pagination, StoreError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS flows (
        flow_id TEXT PRIMARY KEY,
        flow_type TEXT NOT NULL,
        status TEXT NOT NULL,
        correlation_id TEXT,
        user_id TEXT,
        created_at INTEGER NOT NULL,
        version INTEGER NOT NULL,
        snapshot TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_flows_status ON flows (status)",
    "CREATE INDEX IF NOT EXISTS idx_flows_correlation ON flows (correlation_id)",
    "CREATE INDEX IF NOT EXISTS idx_flows_user ON flows (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_flows_created ON flows (created_at)",
];

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

enum Bind {
    Text(String),
    Int(i64),
}

/// SQLite-backed store. Snapshots are stored as JSON with the filterable
/// columns (status, correlation, user, created_at) denormalized and indexed;
/// CAS rides on `UPDATE … WHERE version = ?`.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(backend)?
            .create_if_missing(true);
        // A `:memory:` database exists per connection; keep the pool at one
        // connection so every handle sees the same data.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(backend)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    fn status_list(terminal: bool) -> String {
        FlowStatus::ALL
            .iter()
            .filter(|s| s.is_terminal() == terminal)
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn filter_clauses(filter: &FlowFilter) -> (String, Vec<Bind>) {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            binds.push(Bind::Text(status.to_string()));
        }
        if let Some(ref flow_type) = filter.flow_type {
            clauses.push("flow_type = ?");
            binds.push(Bind::Text(flow_type.clone()));
        }
        if let Some(ref user_id) = filter.user_id {
            clauses.push("user_id = ?");
            binds.push(Bind::Text(user_id.clone()));
        }
        if let Some(ref correlation_id) = filter.correlation_id {
            clauses.push("correlation_id = ?");
            binds.push(Bind::Text(correlation_id.clone()));
        }
        if let Some(after) = filter.created_after {
            clauses.push("created_at >= ?");
            binds.push(Bind::Int(after.timestamp_micros()));
        }
        if let Some(before) = filter.created_before {
            clauses.push("created_at < ?");
            binds.push(Bind::Int(before.timestamp_micros()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        (where_sql, binds)
    }

    fn parse_snapshot(flow_id: &str, data: &str) -> Result<FlowSnapshot, StoreError> {
        serde_json::from_str(data).map_err(|source| StoreError::Corrupt {
            flow_id: flow_id.to_string(),
            source,
        })
    }

    async fn stored_version(&self, flow_id: &str) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query("SELECT version FROM flows WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|r| r.get::<i64, _>("version") as u64))
    }
}

#[async_trait]
impl FlowStore for SqliteStore {
    async fn insert(&self, snapshot: &FlowSnapshot) -> Result<(), StoreError> {
        let data = serde_json::to_string(snapshot).map_err(|source| StoreError::Corrupt {
            flow_id: snapshot.flow_id.clone(),
            source,
        })?;
        let result = sqlx::query(
            "INSERT INTO flows (flow_id, flow_type, status, correlation_id, user_id, created_at, version, snapshot)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.flow_id)
        .bind(&snapshot.flow_type)
        .bind(snapshot.status.to_string())
        .bind(&snapshot.correlation_id)
        .bind(&snapshot.user_id)
        .bind(snapshot.created_at.timestamp_micros())
        .bind(snapshot.version as i64)
        .bind(&data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::AlreadyExists {
                    flow_id: snapshot.flow_id.clone(),
                })
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn update(
        &self,
        snapshot: &FlowSnapshot,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(snapshot).map_err(|source| StoreError::Corrupt {
            flow_id: snapshot.flow_id.clone(),
            source,
        })?;
        let result = sqlx::query(
            "UPDATE flows SET status = ?, version = ?, snapshot = ? WHERE flow_id = ? AND version = ?",
        )
        .bind(snapshot.status.to_string())
        .bind(snapshot.version as i64)
        .bind(&data)
        .bind(&snapshot.flow_id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return match self.stored_version(&snapshot.flow_id).await? {
                Some(actual) => Err(StoreError::VersionConflict {
                    flow_id: snapshot.flow_id.clone(),
                    expected: expected_version,
                    actual,
                }),
                None => Err(StoreError::NotFound {
                    flow_id: snapshot.flow_id.clone(),
                }),
            };
        }
        Ok(())
    }

    async fn load(&self, flow_id: &str) -> Result<Option<FlowSnapshot>, StoreError> {
        let row = sqlx::query("SELECT snapshot FROM flows WHERE flow_id = ?")
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let data: String = row.get("snapshot");
                Ok(Some(Self::parse_snapshot(flow_id, &data)?))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &FlowFilter, page: &Pagination) -> Result<FlowPage, StoreError> {
        let (where_sql, binds) = Self::filter_clauses(filter);

        let count_sql = format!("SELECT COUNT(*) AS n FROM flows{}", where_sql);
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = match bind {
                Bind::Text(s) => count_query.bind(s),
                Bind::Int(i) => count_query.bind(i),
            };
        }
        let total = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?
            .get::<i64, _>("n") as u64;

        let page_sql = format!(
            "SELECT flow_id, snapshot FROM flows{} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            where_sql
        );
        let mut page_query = sqlx::query(&page_sql);
        for bind in &binds {
            page_query = match bind {
                Bind::Text(s) => page_query.bind(s),
                Bind::Int(i) => page_query.bind(i),
            };
        }
        let rows = page_query
            .bind(page.limit as i64)
            .bind(page.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let flow_id: String = row.get("flow_id");
            let data: String = row.get("snapshot");
            items.push(Self::parse_snapshot(&flow_id, &data)?.summary());
        }

        Ok(FlowPage {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn list_non_terminal(&self) -> Result<Vec<FlowSnapshot>, StoreError> {
        let sql = format!(
            "SELECT flow_id, snapshot FROM flows WHERE status IN ({})",
            Self::status_list(false)
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let mut flows = Vec::with_capacity(rows.len());
        for row in rows {
            let flow_id: String = row.get("flow_id");
            let data: String = row.get("snapshot");
            flows.push(Self::parse_snapshot(&flow_id, &data)?);
        }
        Ok(flows)
    }

    async fn counts_by_status(&self) -> Result<BTreeMap<FlowStatus, u64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM flows GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            if let Ok(status) = status.parse::<FlowStatus>() {
                counts.insert(status, n as u64);
            }
        }
        Ok(counts)
    }

    async fn delete(&self, flow_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM flows WHERE flow_id = ?")
            .bind(flow_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!(
            "DELETE FROM flows WHERE created_at < ? AND status IN ({})",
            Self::status_list(true)
        );
        let result = sqlx::query(&sql)
            .bind(cutoff.timestamp_micros())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}
