use crate::db::Database;
use crate::models::SecurityEvent;

/// Writes audit events to the security log.
///
/// Recording is durable-by-default: callers on the pipeline's mutating
/// paths await the insert before responding. Paths that must not fail the
/// request on audit errors use [`record_best_effort`].
///
/// [`record_best_effort`]: EventRecorder::record_best_effort
#[derive(Clone)]
pub struct EventRecorder {
    db: Database,
}

impl EventRecorder {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn record(&self, event: SecurityEvent) -> crate::error::Result<()> {
        tracing::info!(
            event_type = event.event_type.as_str(),
            user_id = ?event.user_id,
            ip = ?event.ip_address,
            "Security event"
        );
        self.db.insert_security_event(&event).await
    }

    /// Record without surfacing storage errors to the caller.
    pub async fn record_best_effort(&self, event: SecurityEvent) {
        let event_type = event.event_type.as_str();
        if let Err(e) = self.record(event).await {
            tracing::error!(event_type = event_type, error = %e, "Failed to persist security event");
        }
    }
}
