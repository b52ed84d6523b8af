use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{json, Value};

use quest_contracts::events::EventWriter;

pub const TIMER_EVENT: &str = "timer_event";
pub const TIMER_DELAY: Duration = Duration::from_secs(15);

pub fn timer_event_args() -> Vec<Value> {
    vec![json!("Hello from the backend!"), json!(true), json!(2)]
}

/// A background thread that waits, then emits one event unless cancelled.
#[derive(Debug)]
pub struct ScheduledEmit {
    cancel: Sender<()>,
    handle: JoinHandle<bool>,
}

impl ScheduledEmit {
    pub fn spawn(events: EventWriter, delay: Duration, event: &str, args: Vec<Value>) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        let event = event.to_string();
        let handle = thread::spawn(move || match cancelled.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => match events.emit(&event, args) {
                Ok(_) => {
                    tracing::info!("emitted {event}");
                    true
                }
                Err(err) => {
                    tracing::error!("failed to emit {event}: {err:#}");
                    false
                }
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        });
        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task if it is still waiting. Returns whether the event was emitted.
    pub fn cancel(self) -> bool {
        let _ = self.cancel.send(());
        self.handle.join().unwrap_or(false)
    }

    /// Block until the task finishes on its own.
    pub fn wait(self) -> bool {
        let Self { cancel, handle } = self;
        let emitted = handle.join().unwrap_or(false);
        drop(cancel);
        emitted
    }
}
