//! Single-slot event registry behind `lx.on` / `lx.send`.

use std::collections::HashMap;

/// Maps an event name to exactly one handler.
///
/// Registering under a name that already has a handler replaces it; there is
/// no way to unregister. Looking up an unknown name is not an error.
#[derive(Debug)]
pub struct EventBus<H> {
    handlers: HashMap<String, H>,
}

impl<H> Default for EventBus<H> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<H> EventBus<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handler` under `name`, returning the handler it displaced.
    pub fn register(&mut self, name: impl Into<String>, handler: H) -> Option<H> {
        let name = name.into();
        let replaced = self.handlers.insert(name.clone(), handler);
        if replaced.is_some() {
            tracing::debug!(event = %name, "handler replaced");
        } else {
            tracing::debug!(event = %name, "handler registered");
        }
        replaced
    }

    pub fn handler(&self, name: &str) -> Option<&H> {
        self.handlers.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Drop every handler. Only used on teardown.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}
