//! Pipeline event bus - synchronous pub/sub for run observability
//!
//! The executor broadcasts lifecycle events here; history/UI
//! collaborators subscribe. Delivery is synchronous, in registration
//! order, and events with no subscribers are dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Overall result status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "success"),
            RunStatus::Failure => write!(f, "failure"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Output stream of a step log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// Lifecycle events emitted during a pipeline run.
///
/// `PipelineDecision` is the one inbound event: the executor consumes
/// it as human approval feedback rather than producing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    PipelineStart {
        run_id: String,
        name: String,
        total_steps: usize,
    },
    #[serde(rename_all = "camelCase")]
    PipelineEnd {
        run_id: String,
        success: bool,
        status: RunStatus,
    },
    #[serde(rename_all = "camelCase")]
    PipelinePause { run_id: String },
    #[serde(rename_all = "camelCase")]
    PipelineResume { run_id: String },
    #[serde(rename_all = "camelCase")]
    StepStart {
        run_id: String,
        intent_id: String,
        step_id: String,
        index: usize,
        description: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StepEnd {
        run_id: String,
        intent_id: String,
        step_id: String,
        index: usize,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    StepLog {
        run_id: String,
        intent_id: String,
        step_id: String,
        text: String,
        stream: LogStream,
    },
    #[serde(rename_all = "camelCase")]
    ApprovalReviewReady {
        run_id: String,
        step_id: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    PipelineDecision { run_id: String, approved: bool },
    #[serde(rename_all = "camelCase")]
    GithubPullRequestCreated { run_id: String, url: String },
}

type Listener = Arc<dyn Fn(&PipelineEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Process-scoped synchronous event channel
#[derive(Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe; the listener is delivered every event until the
    /// returned subscription is disposed or dropped.
    pub fn on<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to all current subscribers, in registration
    /// order. Dropped when there are none.
    pub fn emit(&self, event: PipelineEvent) {
        let listeners: Vec<Listener> = {
            let inner = self.inner.lock().expect("event bus poisoned");
            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Handle to an event subscription; unsubscribes on drop
pub struct Subscription {
    id: u64,
    inner: Weak<Mutex<BusInner>>,
}

impl Subscription {
    /// Explicitly unsubscribe
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().expect("event bus poisoned");
            inner.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
