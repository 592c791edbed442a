use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::types::{ToolError, ToolErrorCode, ToolOutcome};

pub const UNLIMITED_WARNING: &str = "Unlimited output requested (line_limit=-1). This may \
    consume a large number of tokens; prefer a bounded line_limit with read_output for paging.";

#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    pub id: String,
    pub tool_name: String,
    pub timestamp: String,
    pub stdout: String,
    pub stderr: String,
    pub result_repr: Option<String>,
    pub metadata: Map<String, Value>,
}

impl OutputRecord {
    /// stdout followed by stderr, with a newline between them when stdout
    /// does not already end in one.
    pub fn combined_text(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        text.push_str(&self.stdout);
        if !self.stderr.is_empty() && !self.stdout.is_empty() && !self.stdout.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.stderr);
        text
    }
}

#[derive(Debug, Default)]
struct OutputStoreState {
    next_id: u64,
    records: BTreeMap<u64, OutputRecord>,
}

/// FIFO-bounded store of execution outputs keyed by monotonic ids. Reads do
/// not refresh entries; eviction order is insertion order only.
pub struct OutputStore {
    capacity: Option<usize>,
    state: Mutex<OutputStoreState>,
}

impl OutputStore {
    /// `max_items <= 0` disables eviction.
    pub fn new(max_items: i64) -> Self {
        Self {
            capacity: usize::try_from(max_items).ok().filter(|limit| *limit > 0),
            state: Mutex::new(OutputStoreState::default()),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub async fn store(
        &self,
        tool_name: &str,
        stdout: &str,
        stderr: &str,
        result_repr: Option<String>,
        metadata: Map<String, Value>,
    ) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let key = state.next_id;
        let id = key.to_string();
        state.records.insert(
            key,
            OutputRecord {
                id: id.clone(),
                tool_name: tool_name.to_owned(),
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
                result_repr,
                metadata,
            },
        );
        if let Some(capacity) = self.capacity {
            while state.records.len() > capacity {
                state.records.pop_first();
            }
        }
        id
    }

    pub async fn get(&self, id: &str) -> Option<OutputRecord> {
        let key = id.trim().parse::<u64>().ok()?;
        let state = self.state.lock().await;
        state.records.get(&key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    /// Returns lines `[start, end)` of the stored output; `end < 0` means the
    /// end of the text. Out-of-range bounds clamp rather than fail.
    pub async fn read(&self, id: &str, start: i64, end: i64) -> ToolOutcome<Value> {
        let record = self.get(id).await.ok_or_else(|| ToolError {
            code: ToolErrorCode::NotFound,
            message: format!("Output ID '{id}' not found"),
            name: None,
        })?;
        let text = record.combined_text();
        let lines = text.split_inclusive('\n').collect::<Vec<_>>();
        let total = lines.len() as i64;
        let start = start.clamp(0, total);
        let end = if end < 0 { total } else { end.clamp(start, total) };
        let selected = &lines[start as usize..end as usize];
        Ok(json!({
            "status": "ok",
            "output_id": record.id,
            "tool_name": record.tool_name,
            "timestamp": record.timestamp,
            "result_repr": record.result_repr,
            "lines": selected,
            "line_range": { "start": start, "end": end },
            "total_lines": total,
            "metadata": record.metadata,
        }))
    }
}

/// Keeps the first `line_limit` lines of `text`; a negative limit keeps
/// everything. Returns the kept text and whether anything was cut.
pub fn truncate_output(text: &str, line_limit: i64) -> (String, bool) {
    let Ok(limit) = usize::try_from(line_limit) else {
        return (text.to_owned(), false);
    };
    let lines = text.split_inclusive('\n').collect::<Vec<_>>();
    if lines.len() <= limit {
        return (text.to_owned(), false);
    }
    (lines[..limit].concat(), true)
}
