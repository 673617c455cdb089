//! Append-only execution ledger.
//!
//! Every decision the executor takes lands here as a [`LedgerEntry`] with a
//! strictly increasing id, so a run can be audited, diffed against a replay,
//! or resumed from a stored prefix. Entries are never mutated after append;
//! external observers subscribe through [`LedgerSink`] and cannot write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// The closed set of event types a run can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEventType {
    /// A plan was admitted for execution
    PlanSelected,
    /// An edge guard was evaluated
    GuardEval,
    /// A task began executing
    TaskStart,
    /// A task attempt failed and a retry was scheduled
    TaskRetry,
    /// A task reached a terminal status
    TaskEnd,
    /// Policy pre-check verdict
    PolicyPre,
    /// Policy post-check verdict
    PolicyPost,
    /// A verification assertion was evaluated
    Verification,
    /// One nucleus LLM round completed
    NucleusInference,
    /// A retrieval directive changed status
    ContextInternalized,
    /// An error was recorded
    Error,
    /// A checkpoint was persisted
    CheckpointWritten,
    /// Execution resumed from a checkpoint
    TaskResumed,
}

impl std::fmt::Display for LedgerEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PlanSelected => "PLAN_SELECTED",
            Self::GuardEval => "GUARD_EVAL",
            Self::TaskStart => "TASK_START",
            Self::TaskRetry => "TASK_RETRY",
            Self::TaskEnd => "TASK_END",
            Self::PolicyPre => "POLICY_PRE",
            Self::PolicyPost => "POLICY_POST",
            Self::Verification => "VERIFICATION",
            Self::NucleusInference => "NUCLEUS_INFERENCE",
            Self::ContextInternalized => "CONTEXT_INTERNALIZED",
            Self::Error => "ERROR",
            Self::CheckpointWritten => "CHECKPOINT_WRITTEN",
            Self::TaskResumed => "TASK_RESUMED",
        };
        write!(f, "{}", s)
    }
}

/// A single immutable ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Strictly increasing within a run
    pub id: u64,
    /// When the entry was appended
    pub ts: DateTime<Utc>,
    /// Event type from the closed set
    #[serde(rename = "type")]
    pub event_type: LedgerEventType,
    /// Event-specific payload
    pub details: Value,
}

impl LedgerEntry {
    /// Read a detail field.
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    /// Format as a single-line log entry.
    pub fn as_log_line(&self) -> String {
        format!(
            "[{}] #{} {}: {}",
            self.ts.format("%H:%M:%S%.3f"),
            self.id,
            self.event_type,
            self.details
        )
    }
}

/// Push observer notified on each append. Observers cannot mutate entries.
pub trait LedgerSink: Send + Sync {
    fn on_append(&self, entry: &LedgerEntry);
}

/// Serialization formats for ledger export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerExportFormat {
    /// JSON Lines (one entry per line) - the wire format
    JsonLines,
    /// Pretty-printed JSON array
    JsonPretty,
    /// Compact JSON array
    JsonCompact,
    /// Markdown summary
    Markdown,
}

/// Append-only, single-writer event log.
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    next_id: u64,
    sinks: Vec<Arc<dyn LedgerSink>>,
}

impl Ledger {
    /// Create an empty ledger starting at id 1.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            sinks: Vec::new(),
        }
    }

    /// Rebuild a ledger from a stored prefix; the id counter continues past
    /// the highest restored id.
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        let next_id = entries.iter().map(|e| e.id).max().unwrap_or(0) + 1;
        Self {
            entries,
            next_id,
            sinks: Vec::new(),
        }
    }

    /// Append an entry, assigning the next id and the current timestamp.
    pub fn append(&mut self, event_type: LedgerEventType, details: Value) -> LedgerEntry {
        let entry = LedgerEntry {
            id: self.next_id,
            ts: Utc::now(),
            event_type,
            details,
        };
        self.next_id += 1;
        for sink in &self.sinks {
            sink.on_append(&entry);
        }
        self.entries.push(entry.clone());
        entry
    }

    /// All entries in append order.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Stable snapshot of the current entries.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries.clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register a push observer.
    pub fn subscribe(&mut self, sink: Arc<dyn LedgerSink>) {
        self.sinks.push(sink);
    }

    /// Subscribe as a stream: every subsequent append is forwarded to the
    /// returned receiver, which implements [`futures::Stream`].
    pub fn stream(&mut self) -> futures::channel::mpsc::UnboundedReceiver<LedgerEntry> {
        struct ChannelSink(futures::channel::mpsc::UnboundedSender<LedgerEntry>);

        impl LedgerSink for ChannelSink {
            fn on_append(&self, entry: &LedgerEntry) {
                // receiver may be dropped; appends must never fail
                let _ = self.0.unbounded_send(entry.clone());
            }
        }

        let (tx, rx) = futures::channel::mpsc::unbounded();
        self.subscribe(Arc::new(ChannelSink(tx)));
        rx
    }

    /// Serialize as JSONL, one entry per line.
    pub fn to_jsonl(&self) -> String {
        export_entries(&self.entries, LedgerExportFormat::JsonLines)
    }

    /// Serialize in the requested format.
    pub fn export(&self, format: LedgerExportFormat) -> String {
        export_entries(&self.entries, format)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("entries", &self.entries.len())
            .field("next_id", &self.next_id)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Shared single-writer handle used by the scheduler and the nucleus.
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Wrap a ledger for shared append access.
pub fn shared(ledger: Ledger) -> SharedLedger {
    Arc::new(Mutex::new(ledger))
}

/// Append through a shared handle.
pub(crate) fn append_shared(
    ledger: &SharedLedger,
    event_type: LedgerEventType,
    details: Value,
) -> LedgerEntry {
    ledger
        .lock()
        .expect("ledger lock poisoned")
        .append(event_type, details)
}

/// Serialize a list of entries to the specified format.
pub fn export_entries(entries: &[LedgerEntry], format: LedgerExportFormat) -> String {
    match format {
        LedgerExportFormat::JsonLines => entries
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n"),
        LedgerExportFormat::JsonPretty => {
            serde_json::to_string_pretty(entries).unwrap_or_else(|_| "[]".to_string())
        }
        LedgerExportFormat::JsonCompact => {
            serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string())
        }
        LedgerExportFormat::Markdown => entries_to_markdown(entries),
    }
}

fn entries_to_markdown(entries: &[LedgerEntry]) -> String {
    let mut md = String::from("# Execution Ledger\n\n");
    for entry in entries {
        md.push_str(&format!(
            "**{}** `#{}` `{}`\n",
            entry.event_type, entry.id, entry.ts
        ));
        md.push_str(&format!("> {}\n\n", entry.details));
    }
    md
}
