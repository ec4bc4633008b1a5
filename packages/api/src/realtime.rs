//! Real-time event formatting for Server-Sent Events.

use queue_core::JobEvent;

/// SSE event name of a job event.
pub fn sse_event_name(event: &JobEvent) -> &'static str {
    match event {
        JobEvent::Snapshot { .. } => "snapshot",
        JobEvent::StatusChanged { .. } => "status_changed",
        JobEvent::Complete { .. } => "complete",
    }
}

/// Helper to format an event for SSE.
pub fn format_sse_event(event: &JobEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", sse_event_name(event), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::{JobId, JobStatus};

    #[test]
    fn test_format_sse_event() {
        let event = JobEvent::complete(JobId::new(), JobStatus::Failed, Some("boom".into()));
        let frame = format_sse_event(&event);

        assert!(frame.starts_with("event: complete\ndata: {"));
        assert!(frame.ends_with("\n\n"));
        let json = frame
            .lines()
            .nth(1)
            .and_then(|l| l.strip_prefix("data: "))
            .unwrap();
        let parsed: JobEvent = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, event);
    }
}
