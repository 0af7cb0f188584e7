//! Request/response telemetry sink.
//!
//! A bounded, append-mostly SQLite table. Eviction is strictly FIFO by row id
//! and mandatory, so the sink can never fill up. Body fields are truncated to
//! a fixed prefix before storage. When logging is disabled, `append` is a
//! no-op and callers skip body capture entirely.

use crate::error::{AppError, AppResult};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub const MAX_LOG_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default)]
pub struct RequestLogRecord {
    pub timestamp: String,
    pub method: String,
    /// Full path including query; summaries strip the query at read time.
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub account_id: String,
    pub error: Option<String>,
    pub model: Option<String>,
    pub request_headers: Option<String>,
    pub response_headers: Option<String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogSummary {
    pub id: i64,
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub account_id: String,
    pub error: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogDetail {
    pub id: i64,
    pub timestamp: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub account_id: String,
    pub error: Option<String>,
    pub model: Option<String>,
    pub request_headers: Option<String>,
    pub response_headers: Option<String>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

pub struct LogSink {
    conn: Mutex<Connection>,
    enabled: AtomicBool,
    max_logs: usize,
}

const FILTER_CLAUSE: &str = "(method LIKE ?1 OR path LIKE ?1 OR CAST(status AS TEXT) LIKE ?1 \
     OR account_id LIKE ?1 OR error LIKE ?1 OR model LIKE ?1)";
const ERRORS_CLAUSE: &str = "(status < 200 OR status >= 400 OR error IS NOT NULL)";

impl LogSink {
    pub fn open(path: &Path, enabled: bool, max_logs: usize) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, enabled, max_logs)
    }

    #[cfg(test)]
    pub fn in_memory(enabled: bool, max_logs: usize) -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, enabled, max_logs)
    }

    fn with_connection(conn: Connection, enabled: bool, max_logs: usize) -> AppResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS request_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                method TEXT NOT NULL,
                path TEXT NOT NULL,
                status INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                account_id TEXT NOT NULL,
                error TEXT,
                model TEXT,
                request_headers TEXT,
                response_headers TEXT,
                request_body TEXT,
                response_body TEXT,
                input_tokens INTEGER,
                output_tokens INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_request_logs_id ON request_logs (id DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_request_logs_status ON request_logs (status)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            enabled: AtomicBool::new(enabled),
            max_logs: max_logs.max(1),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn append(&self, mut record: RequestLogRecord) -> AppResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        record.request_body = record.request_body.map(|b| truncate_text(&b));
        record.response_body = record.response_body.map(|b| truncate_text(&b));

        let conn = lock_conn(&self.conn)?;
        conn.execute(
            "INSERT INTO request_logs (timestamp, method, path, status, duration_ms, account_id, \
             error, model, request_headers, response_headers, request_body, response_body, \
             input_tokens, output_tokens) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.timestamp,
                record.method,
                record.path,
                record.status as i64,
                record.duration_ms as i64,
                record.account_id,
                record.error,
                record.model,
                record.request_headers,
                record.response_headers,
                record.request_body,
                record.response_body,
                record.input_tokens,
                record.output_tokens,
            ],
        )?;
        conn.execute(
            "DELETE FROM request_logs WHERE id NOT IN \
             (SELECT id FROM request_logs ORDER BY id DESC LIMIT ?1)",
            params![self.max_logs as i64],
        )?;
        Ok(())
    }

    pub fn count(&self, filter: &str, errors_only: bool) -> AppResult<usize> {
        let conn = lock_conn(&self.conn)?;
        let mut clauses: Vec<&str> = Vec::new();
        if errors_only {
            clauses.push(ERRORS_CLAUSE);
        }
        if !filter.is_empty() {
            clauses.push(FILTER_CLAUSE);
        }
        let sql = if clauses.is_empty() {
            "SELECT COUNT(*) FROM request_logs".to_string()
        } else {
            format!(
                "SELECT COUNT(*) FROM request_logs WHERE {}",
                clauses.join(" AND ")
            )
        };
        let count: i64 = if filter.is_empty() {
            conn.query_row(&sql, [], |row| row.get(0))?
        } else {
            let pattern = format!("%{filter}%");
            conn.query_row(&sql, params![pattern], |row| row.get(0))?
        };
        Ok(count as usize)
    }

    /// Newest-first summaries, query-stripped paths.
    pub fn query(
        &self,
        filter: &str,
        errors_only: bool,
        limit: usize,
        offset: usize,
    ) -> AppResult<Vec<RequestLogSummary>> {
        let conn = lock_conn(&self.conn)?;
        let base = "SELECT id, timestamp, method, path, status, duration_ms, account_id, error, \
                    model FROM request_logs";
        let limit = limit as i64;
        let offset = offset as i64;

        let (sql, params_vec): (String, Vec<rusqlite::types::Value>) = if filter.is_empty() {
            if errors_only {
                (
                    format!("{base} WHERE {ERRORS_CLAUSE} ORDER BY id DESC LIMIT ?1 OFFSET ?2"),
                    vec![limit.into(), offset.into()],
                )
            } else {
                (
                    format!("{base} ORDER BY id DESC LIMIT ?1 OFFSET ?2"),
                    vec![limit.into(), offset.into()],
                )
            }
        } else {
            let pattern: rusqlite::types::Value = format!("%{filter}%").into();
            if errors_only {
                (
                    format!(
                        "{base} WHERE {ERRORS_CLAUSE} AND {FILTER_CLAUSE} \
                         ORDER BY id DESC LIMIT ?2 OFFSET ?3"
                    ),
                    vec![pattern, limit.into(), offset.into()],
                )
            } else {
                (
                    format!("{base} WHERE {FILTER_CLAUSE} ORDER BY id DESC LIMIT ?2 OFFSET ?3"),
                    vec![pattern, limit.into(), offset.into()],
                )
            }
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params_vec), |row| {
            Ok(RequestLogSummary {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                method: row.get(2)?,
                path: strip_query(row.get::<_, String>(3)?),
                status: row.get::<_, i64>(4)? as u16,
                duration_ms: row.get::<_, i64>(5)? as u64,
                account_id: row.get(6)?,
                error: row.get(7)?,
                model: row.get(8)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Full record including bodies; `None` once the row has been evicted.
    pub fn detail(&self, id: i64) -> AppResult<Option<RequestLogDetail>> {
        let conn = lock_conn(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, method, path, status, duration_ms, account_id, error, model, \
             request_headers, response_headers, request_body, response_body, input_tokens, \
             output_tokens FROM request_logs WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], |row| {
            Ok(RequestLogDetail {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                method: row.get(2)?,
                path: row.get(3)?,
                status: row.get::<_, i64>(4)? as u16,
                duration_ms: row.get::<_, i64>(5)? as u64,
                account_id: row.get(6)?,
                error: row.get(7)?,
                model: row.get(8)?,
                request_headers: row.get(9)?,
                response_headers: row.get(10)?,
                request_body: row.get(11)?,
                response_body: row.get(12)?,
                input_tokens: row.get(13)?,
                output_tokens: row.get(14)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) -> AppResult<()> {
        let conn = lock_conn(&self.conn)?;
        conn.execute("DELETE FROM request_logs", [])?;
        Ok(())
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| AppError::store("log sink lock poisoned"))
}

fn strip_query(path: String) -> String {
    match path.split_once('?') {
        Some((p, _)) => p.to_string(),
        None => path,
    }
}

pub fn truncate_body(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    let slice = if bytes.len() > MAX_LOG_BODY_BYTES {
        &bytes[..MAX_LOG_BODY_BYTES]
    } else {
        bytes
    };
    let mut text = String::from_utf8_lossy(slice).to_string();
    if bytes.len() > MAX_LOG_BODY_BYTES {
        text.push_str(&format!(
            "\n...truncated {} bytes",
            bytes.len() - MAX_LOG_BODY_BYTES
        ));
    }
    text
}

fn truncate_text(text: &str) -> String {
    if text.len() <= MAX_LOG_BODY_BYTES {
        return text.to_string();
    }
    truncate_body(text.as_bytes())
}

/// Serialize headers for capture, dropping credentials.
pub fn sanitize_headers<'a, I>(headers: I) -> Option<String>
where
    I: Iterator<Item = (&'a str, &'a [u8])>,
{
    let pairs: Vec<(String, String)> = headers
        .filter_map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if matches!(
                lower.as_str(),
                "authorization" | "x-api-key" | "cookie" | "proxy-authorization"
            ) {
                return None;
            }
            Some((
                name.to_string(),
                String::from_utf8_lossy(value).to_string(),
            ))
        })
        .collect();
    serde_json::to_string(&pairs).ok()
}

pub fn extract_model(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

pub fn extract_usage(body: &[u8]) -> (Option<i64>, Option<i64>) {
    if body.is_empty() {
        return (None, None);
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (None, None);
    };
    let Some(usage) = value.get("usage") else {
        return (None, None);
    };
    let input = usage.get("input_tokens").and_then(|v| v.as_i64());
    let output = usage.get("output_tokens").and_then(|v| v.as_i64());
    (input, output)
}
