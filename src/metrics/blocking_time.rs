//! Main-thread blocking time.

use serde::{Deserialize, Serialize};

use crate::simulator::NodeTiming;
use crate::trace::TraceEvent;
use crate::types::{Microseconds, Milliseconds};

/// Tasks block input only for the part of their duration above this.
pub const BLOCKING_TIME_THRESHOLD: Milliseconds = 50.0;

/// A main-thread task span in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskSpan {
    pub start: Milliseconds,
    pub end: Milliseconds,
    pub duration: Milliseconds,
}

impl TaskSpan {
    pub fn new(start: Milliseconds, end: Milliseconds) -> Self {
        Self {
            start,
            end,
            duration: end - start,
        }
    }

    /// Span of a recorded task relative to `time_origin`.
    pub fn from_trace_event(event: &TraceEvent, time_origin: Microseconds) -> Self {
        let start = (event.ts - time_origin) / 1000.0;
        Self::new(start, start + event.duration() / 1000.0)
    }
}

impl From<NodeTiming> for TaskSpan {
    fn from(timing: NodeTiming) -> Self {
        Self {
            start: timing.start_time,
            end: timing.end_time,
            duration: timing.duration,
        }
    }
}

/// Sum of the time tasks spent blocking beyond the threshold between
/// `start_time_ms` and `end_time_ms`.
///
/// Tasks are clipped to the window before the threshold is subtracted, so a
/// 150ms task half covered by the window contributes 25ms.
pub fn calculate_sum_of_blocking_time(
    events: &[TaskSpan],
    start_time_ms: Milliseconds,
    end_time_ms: Milliseconds,
) -> Milliseconds {
    if end_time_ms <= start_time_ms {
        return 0.0;
    }

    let mut sum = 0.0;
    for event in events {
        if event.duration < BLOCKING_TIME_THRESHOLD {
            continue;
        }
        if event.end < start_time_ms || event.start > end_time_ms {
            continue;
        }
        let clipped_start = event.start.max(start_time_ms);
        let clipped_end = event.end.min(end_time_ms);
        let clipped_duration = clipped_end - clipped_start;
        if clipped_duration < BLOCKING_TIME_THRESHOLD {
            continue;
        }
        sum += clipped_duration - BLOCKING_TIME_THRESHOLD;
    }
    sum
}
