// Store module - SQLite persistence for pipelines and event/action logs
//
// The engine reads pipeline rows (list_active) at startup and appends to
// the log tables as traffic flows; it never mutates pipeline rows. Rows
// flagged is_template are never loaded, whatever their is_active flag
// says. Writes go through a worker task fed from a bus subscription, so
// logging can fall behind without slowing the executor.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bus::BusMessage;
use crate::events::{ActionResult, SignalEvent};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pipelines (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    nodes TEXT NOT NULL DEFAULT '[]',
    edges TEXT NOT NULL DEFAULT '[]',
    is_active INTEGER NOT NULL DEFAULT 1,
    is_template INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_pipelines_name ON pipelines(name);

CREATE TABLE IF NOT EXISTS event_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_name TEXT,
    event_type TEXT NOT NULL,
    event_data TEXT NOT NULL,
    event_metadata TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_logs_source ON event_logs(source_type);
CREATE INDEX IF NOT EXISTS idx_event_logs_time ON event_logs(timestamp);

CREATE TABLE IF NOT EXISTS action_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    result_id TEXT NOT NULL,
    pipeline_id INTEGER,
    node_id TEXT,
    status TEXT NOT NULL,
    message TEXT,
    result_data TEXT,
    error_message TEXT,
    execution_time_ms REAL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_action_logs_pipeline ON action_logs(pipeline_id);
CREATE INDEX IF NOT EXISTS idx_action_logs_time ON action_logs(timestamp);
";

/// One stored pipeline row, as handed to the executor at load time
#[derive(Debug, Clone)]
pub struct PipelineRecord {
    pub id: i64,
    pub name: String,
    pub nodes: Value,
    pub edges: Value,
}

pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .context("failed to open database pool")?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    /// A private in-memory database; pool capped at one connection so every
    /// handle sees the same data.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("failed to open in-memory pool")?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(())
    }

    /// Pipelines the executor should load: active and not templates.
    pub fn list_active(&self) -> Result<Vec<PipelineRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, nodes, edges FROM pipelines
             WHERE is_active = 1 AND is_template = 0
             ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, nodes, edges) = row?;
            let nodes: Value = serde_json::from_str(&nodes)
                .with_context(|| format!("pipeline {id}: corrupt nodes JSON"))?;
            let edges: Value = serde_json::from_str(&edges)
                .with_context(|| format!("pipeline {id}: corrupt edges JSON"))?;
            records.push(PipelineRecord {
                id,
                name,
                nodes,
                edges,
            });
        }
        Ok(records)
    }

    /// Insert a pipeline row. The engine itself never calls this; it exists
    /// for the external CRUD surface and for tests.
    pub fn insert_pipeline(
        &self,
        name: &str,
        nodes: &Value,
        edges: &Value,
        is_active: bool,
        is_template: bool,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO pipelines (name, nodes, edges, is_active, is_template)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                nodes.to_string(),
                edges.to_string(),
                is_active,
                is_template
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_event(&self, event: &SignalEvent) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO event_logs (event_id, source_type, source_name, event_type, event_data, event_metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id,
                event.source_type.as_str(),
                event.source_name,
                serde_json::to_string(&event.event_type)?.trim_matches('"'),
                Value::Object(event.data.clone()).to_string(),
                Value::Object(event.metadata.clone()).to_string(),
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn log_action(
        &self,
        result: &ActionResult,
        pipeline_id: i64,
        node_id: &str,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO action_logs (result_id, pipeline_id, node_id, status, message, result_data, error_message, execution_time_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                result.id,
                pipeline_id,
                node_id,
                serde_json::to_string(&result.status)?.trim_matches('"'),
                result.message,
                Value::Object(result.data.clone()).to_string(),
                result.error,
                result.execution_time_ms,
                result.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn event_log_count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM event_logs", [], |row| row.get(0))?)
    }

    pub fn action_log_count(&self) -> Result<i64> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM action_logs", [], |row| row.get(0))?)
    }
}

/// Log bus traffic until the bus closes. Runs as its own task so a slow
/// disk never backpressures the executor; the bus drops log messages for
/// this subscriber if it falls too far behind.
pub async fn run_logger(store: Arc<Store>, mut rx: mpsc::Receiver<BusMessage>) {
    while let Some(msg) = rx.recv().await {
        let outcome = match &msg {
            BusMessage::Signal(event) => store.log_event(event),
            BusMessage::Action {
                result,
                pipeline_id,
                node_id,
            } => store.log_action(result, *pipeline_id, node_id),
            BusMessage::PipelineStatus { .. } => Ok(()),
        };
        if let Err(err) = outcome {
            tracing::error!(error = %err, "failed to write log record");
        }
    }
    tracing::info!("store logger shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ActionResult, EventDraft, EventType, SourceType};
    use chrono::Utc;
    use serde_json::json;

    fn graph() -> (Value, Value) {
        (
            json!([{"id": "src", "type": "source", "data": {"source_type": "cpu"}}]),
            json!([]),
        )
    }

    #[test]
    fn test_list_active_excludes_inactive_and_templates() {
        let store = Store::open_in_memory().unwrap();
        let (nodes, edges) = graph();

        let active = store
            .insert_pipeline("active", &nodes, &edges, true, false)
            .unwrap();
        store
            .insert_pipeline("inactive", &nodes, &edges, false, false)
            .unwrap();
        // Active template must still not load
        store
            .insert_pipeline("template", &nodes, &edges, true, true)
            .unwrap();

        let records = store.list_active().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, active);
        assert_eq!(records[0].name, "active");
        assert_eq!(records[0].nodes, nodes);
    }

    #[test]
    fn test_event_and_action_logging() {
        let store = Store::open_in_memory().unwrap();

        let event = EventDraft::new(EventType::ThresholdCrossed)
            .with_data("cpu_percent", json!(91))
            .stamp(SourceType::Cpu, "cpu_ram_monitor", Utc::now());
        store.log_event(&event).unwrap();

        let result = ActionResult::success("ok", serde_json::Map::new());
        store.log_action(&result, 3, "act").unwrap();

        assert_eq!(store.event_log_count().unwrap(), 1);
        assert_eq!(store.action_log_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_logger_task_consumes_bus_traffic() {
        use crate::bus::EventBus;

        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = EventBus::new();
        let rx = bus.subscribe("store", 64);
        let handle = tokio::spawn(run_logger(store.clone(), rx));

        let event = EventDraft::new(EventType::ValueChanged)
            .stamp(SourceType::Network, "network_monitor", Utc::now());
        bus.publish(BusMessage::Signal(event));
        bus.publish(BusMessage::Action {
            result: ActionResult::skipped("gated"),
            pipeline_id: 1,
            node_id: "act".to_string(),
        });

        // Close the bus subscription by dropping the bus's sender side
        drop(bus);
        handle.await.unwrap();

        assert_eq!(store.event_log_count().unwrap(), 1);
        assert_eq!(store.action_log_count().unwrap(), 1);
    }
}
