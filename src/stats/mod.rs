use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::config::BucketsMap;
use crate::models::Result;

/// Request priority classes. New rows start at `Low`; the other levels are
/// assigned out of band by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
pub enum RequestPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// One row of the `request_stats` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RequestStat {
    pub id: i64,
    pub path: String,
    pub hits: i64,
    pub update_dt: DateTime<Utc>,
    pub errors: i64,
    pub priority: RequestPriority,
}

/// Hit accounting over a small SQLite table, keyed by the exact request
/// path. Sessions come from the pool per call and are released on all paths.
#[derive(Clone)]
pub struct StatService {
    pool: SqlitePool,
}

impl StatService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connects and makes sure the schema exists. An in-memory database
    /// must stay on a single never-reaped connection, every connection to
    /// `:memory:` is its own empty database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqlitePoolOptions::new();
        let pool = if url.contains(":memory:") {
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(url)
                .await?
        } else {
            options.connect(url).await?
        };

        let service = Self::new(pool);
        service.ensure_schema().await?;
        Ok(service)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS request_stats (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                hits INTEGER NOT NULL DEFAULT 0,
                update_dt TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                errors INTEGER NOT NULL DEFAULT 0,
                priority TEXT NOT NULL DEFAULT 'LOW'
                    CHECK (priority IN ('LOW', 'MEDIUM', 'HIGH', 'CRITICAL'))
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_request_stats_path
             ON request_stats (path)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies one observed response to the table: 200/304 bump the hit
    /// counter, 404 drops the row, everything else is a no-op.
    pub async fn handle_request(&self, path: &str, status: StatusCode) -> Result<()> {
        match status {
            StatusCode::NOT_FOUND => self.invalidate_hits(path).await,
            StatusCode::OK | StatusCode::NOT_MODIFIED => self.add_hit(path).await,
            _ => Ok(()),
        }
    }

    async fn add_hit(&self, path: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO request_stats (path, hits, update_dt) VALUES (?, 1, ?)
             ON CONFLICT(path) DO UPDATE
             SET hits = hits + 1, update_dt = excluded.update_dt",
        )
        .bind(path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate_hits(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM request_stats WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Option<RequestStat>> {
        let row = sqlx::query_as::<_, RequestStat>(
            "SELECT id, path, hits, update_dt, errors, priority
             FROM request_stats WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The `count` most requested paths; order among ties is unspecified.
    pub async fn top_requests(&self, count: u32) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM request_stats ORDER BY hits DESC LIMIT ?")
                .bind(count as i64)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(path,)| path).collect())
    }
}

/// Every first path segment the recorder cares about: all source buckets
/// plus all derived buckets.
pub fn known_buckets(buckets_map: &BucketsMap) -> HashSet<String> {
    buckets_map
        .all_source_buckets
        .iter()
        .chain(buckets_map.buckets.keys())
        .cloned()
        .collect()
}

#[derive(Clone)]
pub struct StatsLayerState {
    pub stats: StatService,
    pub known_buckets: Arc<HashSet<String>>,
}

/// Response observer. Recording happens in a background task once the
/// response is on its way; a recorder failure never reaches the client.
pub async fn stats_middleware(
    State(state): State<StatsLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let response = next.run(request).await;

    let first_segment = path.split('/').find(|segment| !segment.is_empty());
    if let Some(segment) = first_segment {
        if state.known_buckets.contains(segment) {
            let stats = state.stats.clone();
            let status = response.status();
            tokio::spawn(async move {
                if let Err(e) = stats.handle_request(&path, status).await {
                    tracing::warn!(path = %path, error = %e, "Failed to record request stats");
                }
            });
        }
    }

    response
}
