//! Trace event definitions consumed by the graph builder.
//!
//! Events follow the Chrome trace event format. Only the fields the
//! dependency graph needs are modelled; everything else is ignored on
//! deserialization.

use serde::{Deserialize, Serialize};

use crate::types::Microseconds;

/// Names of top-level scheduler tasks that become CPU nodes.
pub const SCHEDULABLE_TASK_NAMES: [&str; 4] = [
    "RunTask",
    "ThreadControllerImpl::DoWork",
    "ThreadControllerImpl::RunTask",
    "TaskQueueManager::ProcessTaskFromWorkQueue",
];

/// A single trace event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Event name (e.g. `RunTask`, `EvaluateScript`)
    pub name: String,
    /// Comma separated categories
    #[serde(default)]
    pub cat: String,
    /// Phase
    #[serde(default)]
    pub ph: String,
    /// Start timestamp in microseconds
    pub ts: Microseconds,
    /// Duration in microseconds for complete events
    #[serde(default)]
    pub dur: Option<Microseconds>,
    /// Process id
    #[serde(default)]
    pub pid: i64,
    /// Thread id
    #[serde(default)]
    pub tid: i64,
    /// Event arguments
    #[serde(default)]
    pub args: TraceEventArgs,
}

/// Arguments attached to a trace event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceEventArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TraceEventData>,
}

/// The `args.data` payload used for causality linking.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEventData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<CallFrame>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_state: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_sheet_url: Option<String>,
}

/// One frame of a JavaScript stack.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub line_number: i64,
    #[serde(default)]
    pub column_number: i64,
}

impl TraceEvent {
    /// Creates an event with a name and timestamp.
    pub fn new(name: impl Into<String>, ts: Microseconds) -> Self {
        Self {
            name: name.into(),
            ph: "X".to_string(),
            ts,
            ..Default::default()
        }
    }

    /// Creates a complete (`X`) event with a duration.
    pub fn complete(name: impl Into<String>, ts: Microseconds, dur: Microseconds) -> Self {
        Self::new(name, ts).with_duration(dur)
    }

    /// Sets the duration.
    pub fn with_duration(mut self, dur: Microseconds) -> Self {
        self.dur = Some(dur);
        self
    }

    /// Sets the thread id.
    pub fn with_tid(mut self, tid: i64) -> Self {
        self.tid = tid;
        self
    }

    /// Sets the `args.data` payload.
    pub fn with_data(mut self, data: TraceEventData) -> Self {
        self.args.data = Some(data);
        self
    }

    /// Returns the `args.data` payload, if any.
    pub fn data(&self) -> Option<&TraceEventData> {
        self.args.data.as_ref()
    }

    /// Duration in microseconds, zero when absent.
    pub fn duration(&self) -> Microseconds {
        self.dur.unwrap_or(0.0)
    }

    /// Whether this is a top-level scheduler task.
    pub fn is_schedulable_task(&self) -> bool {
        SCHEDULABLE_TASK_NAMES.contains(&self.name.as_str())
    }

    /// URLs of the stack trace frames that carry one.
    pub fn stack_trace_urls(&self) -> Vec<&str> {
        self.data()
            .and_then(|d| d.stack_trace.as_ref())
            .map(|frames| {
                frames
                    .iter()
                    .map(|f| f.url.as_str())
                    .filter(|u| !u.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl TraceEventData {
    /// Data payload with a URL.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// URLs identifying the navigation being analyzed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageUrls {
    /// URL the navigation was started with (root of the graph)
    pub requested_url: String,
    /// Final URL after redirects (main document)
    pub main_document_url: String,
}

impl PageUrls {
    pub fn new(requested_url: impl Into<String>, main_document_url: impl Into<String>) -> Self {
        Self {
            requested_url: requested_url.into(),
            main_document_url: main_document_url.into(),
        }
    }
}

/// Key timestamps of a processed navigation, in trace microseconds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationTimestamps {
    pub time_origin: Microseconds,
    #[serde(default)]
    pub first_contentful_paint: Option<Microseconds>,
    #[serde(default)]
    pub largest_contentful_paint: Option<Microseconds>,
}

/// A navigation whose paint anchors have already been resolved.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedNavigation {
    pub timestamps: NavigationTimestamps,
}

impl ProcessedNavigation {
    pub fn new(time_origin: Microseconds) -> Self {
        Self {
            timestamps: NavigationTimestamps {
                time_origin,
                ..Default::default()
            },
        }
    }

    pub fn with_first_contentful_paint(mut self, ts: Microseconds) -> Self {
        self.timestamps.first_contentful_paint = Some(ts);
        self
    }

    pub fn with_largest_contentful_paint(mut self, ts: Microseconds) -> Self {
        self.timestamps.largest_contentful_paint = Some(ts);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedulable_task() {
        assert!(TraceEvent::complete("RunTask", 0.0, 10.0).is_schedulable_task());
        assert!(TraceEvent::complete("ThreadControllerImpl::RunTask", 0.0, 10.0).is_schedulable_task());
        assert!(!TraceEvent::complete("Layout", 0.0, 10.0).is_schedulable_task());
    }

    #[test]
    fn test_stack_trace_urls_skip_empty() {
        let evt = TraceEvent::new("TimerInstall", 5.0).with_data(TraceEventData {
            stack_trace: Some(vec![
                CallFrame { url: "https://a.test/app.js".into(), ..Default::default() },
                CallFrame::default(),
            ]),
            ..Default::default()
        });
        assert_eq!(evt.stack_trace_urls(), vec!["https://a.test/app.js"]);
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{
            "name": "EvaluateScript",
            "ts": 1500,
            "dur": 200,
            "tid": 7,
            "args": {"data": {"url": "https://a.test/app.js", "stackTrace": [{"url": "https://a.test/x.js"}]}}
        }"#;
        let evt: TraceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(evt.tid, 7);
        assert_eq!(evt.duration(), 200.0);
        assert_eq!(evt.data().unwrap().url.as_deref(), Some("https://a.test/app.js"));
        assert_eq!(evt.stack_trace_urls(), vec!["https://a.test/x.js"]);
    }

    #[test]
    fn test_navigation_builder() {
        let nav = ProcessedNavigation::new(1000.0)
            .with_first_contentful_paint(5000.0)
            .with_largest_contentful_paint(9000.0);
        assert_eq!(nav.timestamps.first_contentful_paint, Some(5000.0));
        assert_eq!(nav.timestamps.largest_contentful_paint, Some(9000.0));
    }
}
