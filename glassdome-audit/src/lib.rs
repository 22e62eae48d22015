//! Structured audit trail for lifecycle events.
//!
//! Distinct from the diagnostic `tracing` log: this records a bounded,
//! queryable history of lifecycle milestones (spare acquired, VM created,
//! drift detected) with the resource ids involved. Modeled on mvirt-log's
//! `AuditLogger`, but in-process rather than shipped to a separate log
//! service over gRPC - Glassdome runs as a single process.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Severity of an audit event. Mirrors mvirt-log's `LogLevel` but trimmed
/// to the levels this crate actually emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Audit,
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub object_ids: Vec<String>,
}

/// Receives audit events as they are logged. Implementations MUST NOT
/// block the caller for long; the logger invokes sinks fire-and-forget.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn sink(&self, event: &AuditEvent);
}

/// In-process audit logger: always records locally via `tracing` and a
/// bounded ring buffer, optionally forwards to a pluggable sink.
pub struct AuditLogger {
    component: String,
    history: Mutex<VecDeque<AuditEvent>>,
    max_history: usize,
    sink: Option<Arc<dyn AuditSink>>,
}

impl AuditLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            history: Mutex::new(VecDeque::new()),
            max_history: 1000,
            sink: None,
        }
    }

    /// Create a logger that discards events after tracing/history (no sink).
    pub fn new_noop() -> Self {
        Self::new("noop")
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>, object_ids: Vec<String>) {
        let message = message.into();

        match level {
            LogLevel::Debug => {
                tracing::debug!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Info => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            LogLevel::Audit => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
        }

        let event = AuditEvent {
            timestamp: Utc::now(),
            level,
            message,
            object_ids,
        };

        {
            let mut history = self.history.lock().await;
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        if let Some(sink) = &self.sink {
            sink.sink(&event).await;
        }
    }

    fn log_async(self: &Arc<Self>, level: LogLevel, message: String, object_ids: Vec<String>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.log(level, message, object_ids).await;
        });
    }

    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let history = self.history.lock().await;
        history.iter().rev().take(limit).rev().cloned().collect()
    }

    // --- Lab lifecycle -----------------------------------------------

    pub fn lab_deployed(self: &Arc<Self>, lab_id: &str, vm_count: usize) {
        self.log_async(
            LogLevel::Audit,
            format!("Lab deployed: {lab_id} ({vm_count} VMs)"),
            vec![lab_id.to_string()],
        );
    }

    pub fn lab_deploy_failed(self: &Arc<Self>, lab_id: &str, error: &str) {
        self.log_async(
            LogLevel::Warn,
            format!("Lab deploy failed: {lab_id}: {error}"),
            vec![lab_id.to_string()],
        );
    }

    // --- Hot spare pool ------------------------------------------------

    pub fn spare_provisioned(self: &Arc<Self>, spare_id: &str, os_family: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("Spare provisioned: {spare_id} ({os_family})"),
            vec![spare_id.to_string()],
        );
    }

    pub fn spare_acquired(self: &Arc<Self>, spare_id: &str, mission_id: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("Spare acquired: {spare_id} by mission {mission_id}"),
            vec![spare_id.to_string(), mission_id.to_string()],
        );
    }

    pub fn spare_released(self: &Arc<Self>, spare_id: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("Spare released: {spare_id}"),
            vec![spare_id.to_string()],
        );
    }

    pub fn spare_provisioning_failed(self: &Arc<Self>, spare_id: &str, error: &str) {
        self.log_async(
            LogLevel::Warn,
            format!("Spare provisioning failed: {spare_id}: {error}"),
            vec![spare_id.to_string()],
        );
    }

    // --- VM / network --------------------------------------------------

    pub fn vm_created(self: &Arc<Self>, vm_id: &str, name: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("VM created: {name} ({vm_id})"),
            vec![vm_id.to_string()],
        );
    }

    pub fn vm_deleted(self: &Arc<Self>, vm_id: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("VM deleted: {vm_id}"),
            vec![vm_id.to_string()],
        );
    }

    pub fn network_allocated(self: &Arc<Self>, lab_id: &str, cidr: &str) {
        self.log_async(
            LogLevel::Audit,
            format!("Network allocated for lab {lab_id}: {cidr}"),
            vec![lab_id.to_string()],
        );
    }

    // --- Reconciler ------------------------------------------------------

    pub fn drift_detected(self: &Arc<Self>, resource_id: &str, detail: &str) {
        self.log_async(
            LogLevel::Warn,
            format!("Drift detected on {resource_id}: {detail}"),
            vec![resource_id.to_string()],
        );
    }
}

pub fn create_audit_logger(component: impl Into<String>) -> Arc<AuditLogger> {
    Arc::new(AuditLogger::new(component))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_logger_does_not_panic() {
        let logger = Arc::new(AuditLogger::new_noop());
        logger.lab_deployed("lab-1", 3);
        logger.spare_acquired("spare-1", "mission-1");
        logger.spare_released("spare-1");
        logger.vm_created("vm-1", "web-01");
        logger.vm_deleted("vm-1");
        logger.network_allocated("lab-1", "10.1.0.0/16");
        logger.drift_detected("vm-1", "ip changed");
        // give spawned tasks a chance to run
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn history_is_bounded_and_queryable() {
        let logger = Arc::new(AuditLogger::new("test"));
        for i in 0..5 {
            logger.log(LogLevel::Info, format!("event {i}"), vec![]).await;
        }
        let recent = logger.recent(3).await;
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[2].message, "event 4");
    }

    struct CollectingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait::async_trait]
    impl AuditSink for CollectingSink {
        async fn sink(&self, event: &AuditEvent) {
            self.events.lock().await.push(event.clone());
        }
    }

    #[tokio::test]
    async fn sink_receives_logged_events() {
        let sink = Arc::new(CollectingSink {
            events: Mutex::new(Vec::new()),
        });
        let logger = AuditLogger::new("test").with_sink(sink.clone());
        logger.log(LogLevel::Audit, "hello", vec!["a".into()]).await;
        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "hello");
    }
}
