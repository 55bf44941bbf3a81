//! Dispatch table for id-less messages.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub type PushHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Push handlers keyed by message kind, fixed at construction.
#[derive(Clone, Default)]
pub struct PushRouter {
    handlers: HashMap<String, PushHandler>,
}

impl PushRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, msg: &str, handler: F) -> Self
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.handlers.insert(msg.to_string(), Arc::new(handler));
        self
    }

    /// Run the handler for `msg`. Returns false when none is registered.
    pub fn dispatch(&self, msg: &str, value: Option<Value>) -> bool {
        match self.handlers.get(msg) {
            Some(handler) => {
                debug!(msg, "push received");
                handler(value);
                true
            }
            None => {
                warn!(msg, "no handler for push");
                false
            }
        }
    }
}

impl std::fmt::Debug for PushRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRouter")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
