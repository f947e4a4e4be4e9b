//! Notifications
//!
//! Fire-and-forget lifecycle events. Subscribers (chat relays, mail, the
//! built-in tracing mirror) observe outcomes but never take part in control
//! flow: publishing cannot fail and nobody waits for delivery.

use keel_core::domain::rollback::RollbackStatus;
use keel_core::domain::run::RunStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Engine lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "run.started")]
    RunStarted {
        run_id: Uuid,
        project_id: Uuid,
        run_number: i64,
        branch: String,
        commit_sha: String,
    },
    #[serde(rename = "run.completed")]
    RunCompleted {
        run_id: Uuid,
        project_id: Uuid,
        run_number: i64,
    },
    #[serde(rename = "run.failed")]
    RunFailed {
        run_id: Uuid,
        project_id: Uuid,
        run_number: i64,
        status: RunStatus,
        error: Option<String>,
    },
    #[serde(rename = "rollback.started")]
    RollbackStarted {
        plan_id: Uuid,
        project_id: Uuid,
        source_deployment_id: Uuid,
        target_deployment_id: Uuid,
        server_ids: Vec<String>,
    },
    #[serde(rename = "rollback.completed")]
    RollbackCompleted {
        plan_id: Uuid,
        project_id: Uuid,
        record_id: Uuid,
        status: RollbackStatus,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "run.started",
            Event::RunCompleted { .. } => "run.completed",
            Event::RunFailed { .. } => "run.failed",
            Event::RollbackStarted { .. } => "rollback.started",
            Event::RollbackCompleted { .. } => "rollback.completed",
        }
    }
}

/// Publish/subscribe hub for engine events
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Event>,
}

impl Notifier {
    /// # Arguments
    /// * `capacity` - Events buffered per subscriber before it starts lagging
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Sends an event to every current subscriber
    pub fn publish(&self, event: Event) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Mirrors every event to tracing until the notifier is dropped
pub fn spawn_log_subscriber(notifier: &Notifier) -> JoinHandle<()> {
    let mut receiver = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    info!(event = event.name(), "{}", payload);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Notification subscriber lagged, {} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
