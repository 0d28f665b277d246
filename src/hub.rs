//! Fan-out of task events to connected observers.
//!
//! Observers are handed a bounded queue; the hub never awaits an observer.
//! Broadcasts iterate a snapshot of the observer set so attach/detach may
//! happen concurrently, and an observer whose queue is closed or full is
//! detached rather than allowed to stall task execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use crate::types::{LogLevel, TaskResult, TaskStatus};

/// Per-observer queue depth. An observer this far behind is dropped.
const OBSERVER_QUEUE_CAPACITY: usize = 256;

pub type ObserverId = u64;

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    observers: Mutex<HashMap<ObserverId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register an observer; the receiver yields serialized event payloads.
    pub fn attach(&self) -> (ObserverId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OBSERVER_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn detach(&self, id: ObserverId) {
        self.inner.observers.lock().unwrap().remove(&id);
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().unwrap().len()
    }

    /// Deliver an event to every currently attached observer. One observer's
    /// failure never aborts the broadcast.
    pub fn broadcast(&self, task_id: i64, payload: Value) {
        let mut object = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        object.insert("task_id".to_string(), json!(task_id));
        let message = Value::Object(object).to_string();

        let snapshot: Vec<(ObserverId, mpsc::Sender<String>)> = self
            .inner
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.try_send(message.clone()).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            tracing::debug!(observer_id = id, "dropping unresponsive observer");
            self.detach(id);
        }
    }

    pub fn broadcast_state(&self, task_id: i64, status: TaskStatus) {
        self.broadcast(task_id, json!({ "type": "state", "status": status }));
    }

    pub fn broadcast_output(
        &self,
        task_id: i64,
        severity: LogLevel,
        message: &str,
        raw: Option<&str>,
    ) {
        let mut payload = json!({
            "type": "output",
            "severity": severity,
            "message": message,
        });
        if let Some(raw) = raw {
            payload["raw"] = json!(raw);
        }
        self.broadcast(task_id, payload);
    }

    pub fn broadcast_complete(&self, task_id: i64, result: &TaskResult) {
        self.broadcast(
            task_id,
            json!({
                "type": "complete",
                "status": result.status,
                "exit_code": result.exit_code,
                "input_tokens": result.input_tokens,
                "output_tokens": result.output_tokens,
                "cost": result.cost_usd,
            }),
        );
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
