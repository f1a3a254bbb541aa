//! Append-only audit trail
//!
//! One log per run. Every component records through a shared [`AuditLog`];
//! records carry a monotonically increasing sequence number and are never
//! rewritten. The JSON-lines file is the source of truth, and each record is
//! mirrored to `tracing` at the matching level.

mod reader;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::normalize::redact_json;

pub use reader::{AuditFilter, read_events};

/// Event names written by the kernel
pub mod events {
    pub const SCAN_STARTED: &str = "scan_started";
    pub const SCAN_COMPLETED: &str = "scan_completed";
    pub const AUTH_CHECK: &str = "auth_check";
    pub const AUTH_DENIED: &str = "auth_denied";
    pub const SCOPE_CHECK: &str = "scope_check";
    pub const SCOPE_BLOCKED: &str = "scope_blocked";
    pub const REACHABILITY_CHECK: &str = "reachability_check";
    pub const RATE_ADJUSTED: &str = "rate_adjusted";
    pub const ATTACK_MODE_REQUESTED: &str = "attack_mode_requested";
    pub const ATTACK_MODE_RISK_ACKNOWLEDGED: &str = "attack_mode_risk_acknowledged";
    pub const ATTACK_MODE_TOKEN_VERIFIED: &str = "attack_mode_token_verified";
    pub const ATTACK_MODE_APPROVED: &str = "attack_mode_approved";
    pub const ATTACK_MODE_REJECTED: &str = "attack_mode_rejected";
    pub const ATTACK_MODE_UNAVAILABLE: &str = "attack_mode_unavailable";
    pub const SESSION_EXPIRED: &str = "session_expired";
    pub const PLUGIN_SKIPPED: &str = "plugin_skipped";
    pub const PLUGIN_STARTED: &str = "plugin_started";
    pub const PLUGIN_COMPLETED: &str = "plugin_completed";
    pub const PLUGIN_FAILED: &str = "plugin_failed";
    pub const NODE_SKIPPED: &str = "node_skipped";
    pub const DEPENDENCY_MISSING: &str = "dependency_missing";
    pub const JOB_CANCELLED: &str = "job_cancelled";
    pub const TIMEBOX_EXCEEDED: &str = "timebox_exceeded";
    pub const FINDING_DROPPED: &str = "finding_dropped";
    pub const FINDINGS_NORMALIZED: &str = "findings_normalized";
    pub const FINDINGS_MERGED: &str = "findings_merged";
    pub const VERIFICATION_RERUN: &str = "verification_rerun";
    pub const GATE_EVALUATED: &str = "gate_evaluated";
    pub const REPORT_WRITTEN: &str = "report_written";
}

/// Audit severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Debug => "DEBUG",
            AuditLevel::Info => "INFO",
            AuditLevel::Warn => "WARN",
            AuditLevel::Error => "ERROR",
            AuditLevel::Critical => "CRITICAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => Some(AuditLevel::Debug),
            "INFO" => Some(AuditLevel::Info),
            "WARN" | "WARNING" => Some(AuditLevel::Warn),
            "ERROR" => Some(AuditLevel::Error),
            "CRITICAL" | "FATAL" => Some(AuditLevel::Critical),
            _ => None,
        }
    }
}

/// One audit record: `{ts, level, event, run_id, seq, ...payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub level: AuditLevel,
    pub event: String,
    pub run_id: String,
    pub seq: u64,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl AuditEvent {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

struct Inner {
    seq: u64,
    file: Option<File>,
    events: Vec<AuditEvent>,
}

/// Single-writer event log shared by every component of a run
pub struct AuditLog {
    run_id: String,
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Open (or create) the JSON-lines log at `path`. The file stays
    /// exclusively locked for the lifetime of the log.
    pub fn open(path: &Path, run_id: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create audit directory: {}", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log: {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("Audit log is locked by another run: {}", path.display()))?;

        Ok(Self {
            run_id: run_id.into(),
            path: Some(path.to_path_buf()),
            inner: Mutex::new(Inner {
                seq: 0,
                file: Some(file),
                events: Vec::new(),
            }),
        })
    }

    /// A log that only keeps records in memory
    pub fn in_memory(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            path: None,
            inner: Mutex::new(Inner {
                seq: 0,
                file: None,
                events: Vec::new(),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one record. Payload strings are redacted before they are
    /// written. A failed write is reported through `tracing` and does not
    /// lose the in-memory record.
    pub fn record(&self, level: AuditLevel, event: &str, payload: Value) -> u64 {
        let payload = match redact_json(payload) {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let record = AuditEvent {
            ts: Utc::now(),
            level,
            event: event.to_string(),
            run_id: self.run_id.clone(),
            seq: inner.seq,
            payload,
        };

        mirror_to_tracing(&record);

        if let Some(file) = inner.file.as_mut() {
            let written = serde_json::to_string(&record)
                .map_err(anyhow::Error::from)
                .and_then(|line| {
                    file.write_all(line.as_bytes())?;
                    file.write_all(b"\n")?;
                    file.flush()?;
                    Ok(())
                });
            if let Err(e) = written {
                tracing::error!("Failed to append audit record {}: {}", record.seq, e);
            }
        }

        let seq = record.seq;
        inner.events.push(record);
        seq
    }

    pub fn debug(&self, event: &str, payload: Value) -> u64 {
        self.record(AuditLevel::Debug, event, payload)
    }

    pub fn info(&self, event: &str, payload: Value) -> u64 {
        self.record(AuditLevel::Info, event, payload)
    }

    pub fn warn(&self, event: &str, payload: Value) -> u64 {
        self.record(AuditLevel::Warn, event, payload)
    }

    pub fn error(&self, event: &str, payload: Value) -> u64 {
        self.record(AuditLevel::Error, event, payload)
    }

    pub fn critical(&self, event: &str, payload: Value) -> u64 {
        self.record(AuditLevel::Critical, event, payload)
    }

    /// Snapshot of all records written so far, in sequence order
    pub fn events(&self) -> Vec<AuditEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.clone()
    }

    pub fn events_named(&self, event: &str) -> Vec<AuditEvent> {
        self.events().into_iter().filter(|e| e.event == event).collect()
    }

    pub fn count(&self, event: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.iter().filter(|e| e.event == event).count()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seq
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("run_id", &self.run_id)
            .field("path", &self.path)
            .field("seq", &self.last_seq())
            .finish()
    }
}

fn mirror_to_tracing(record: &AuditEvent) {
    let payload = Value::Object(record.payload.clone());
    match record.level {
        AuditLevel::Debug => {
            tracing::debug!(run_id = %record.run_id, seq = record.seq, "{} {}", record.event, payload)
        }
        AuditLevel::Info => {
            tracing::info!(run_id = %record.run_id, seq = record.seq, "{} {}", record.event, payload)
        }
        AuditLevel::Warn => {
            tracing::warn!(run_id = %record.run_id, seq = record.seq, "{} {}", record.event, payload)
        }
        AuditLevel::Error | AuditLevel::Critical => {
            tracing::error!(
                run_id = %record.run_id,
                seq = record.seq,
                level = record.level.as_str(),
                "{} {}",
                record.event,
                payload
            )
        }
    }
}
