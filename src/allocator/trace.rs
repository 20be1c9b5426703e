//! Allocation history
//!
//! When history recording is enabled each device keeps a bounded ring of
//! [`TraceEntry`] values describing allocator transitions, optionally with a
//! captured context (by default a backtrace) attached.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::acl_backend::DeviceIndex;
use crate::stream::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceAction {
    Alloc,
    FreeRequested,
    FreeCompleted,
    SegmentAlloc,
    SegmentFree,
    /// `addr` holds the device's free bytes at the time of the failure.
    Oom,
}

/// How much context to capture. Levels are cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordContext {
    #[default]
    Never,
    /// Context of live blocks, reported in snapshots.
    State,
    /// Also attach it to allocation trace entries.
    Alloc,
    /// Also capture it on frees.
    All,
}

/// Produces an opaque description of the calling context.
pub type ContextRecorder = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub action: TraceAction,
    pub device: DeviceIndex,
    pub addr: usize,
    pub size: usize,
    pub stream: StreamId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

pub(crate) struct AllocationHistory {
    enabled: bool,
    when: RecordContext,
    max_entries: usize,
    recorder: Option<ContextRecorder>,
    entries: VecDeque<TraceEntry>,
}

impl fmt::Debug for AllocationHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationHistory")
            .field("enabled", &self.enabled)
            .field("when", &self.when)
            .field("max_entries", &self.max_entries)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl AllocationHistory {
    pub fn new(max_entries: usize) -> Self {
        AllocationHistory {
            enabled: false,
            when: RecordContext::Never,
            max_entries: max_entries.max(1),
            recorder: None,
            entries: VecDeque::new(),
        }
    }

    /// Turning history off drops the recorded entries.
    pub fn configure(
        &mut self,
        enabled: bool,
        recorder: Option<ContextRecorder>,
        max_entries: usize,
        when: RecordContext,
    ) {
        self.enabled = enabled;
        self.max_entries = max_entries.max(1);
        if enabled {
            self.when = when;
            self.recorder = recorder;
            while self.entries.len() > self.max_entries {
                self.entries.pop_front();
            }
        } else {
            self.when = RecordContext::Never;
            self.recorder = None;
            self.entries.clear();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn when(&self) -> RecordContext {
        self.when
    }

    /// Capture context if the configured level covers `level`.
    pub fn capture(&self, level: RecordContext) -> Option<String> {
        if !self.enabled || self.when < level || level == RecordContext::Never {
            return None;
        }
        Some(match &self.recorder {
            Some(recorder) => recorder(),
            None => std::backtrace::Backtrace::force_capture().to_string(),
        })
    }

    pub fn record(&mut self, entry: TraceEntry) {
        if !self.enabled {
            return;
        }
        if self.entries.len() == self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.iter().cloned().collect()
    }
}
