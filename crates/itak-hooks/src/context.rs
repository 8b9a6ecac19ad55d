//! The mutable context handed through a hook chain.

use itak_core::{LifecyclePoint, SessionKey};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Context for one hook invocation. Each handler receives the previous
/// handler's output and returns its (possibly modified) successor.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// The lifecycle point being dispatched.
    pub point: LifecyclePoint,
    /// Invocation id shared by the whole chain.
    pub invocation_id: Uuid,
    /// The session in scope, when there is one.
    pub session: Option<SessionKey>,
    /// Free-form chain data. Handlers read and mutate entries here.
    pub data: Map<String, Value>,
}

impl HookContext {
    /// Create a context for a lifecycle point.
    #[must_use]
    pub fn new(point: LifecyclePoint) -> Self {
        Self {
            point,
            invocation_id: Uuid::new_v4(),
            session: None,
            data: Map::new(),
        }
    }

    /// Attach the session in scope.
    #[must_use]
    pub fn with_session(mut self, session: SessionKey) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Read a data entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Read a data entry as a string.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Insert a data entry.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_round_trip() {
        let mut ctx = HookContext::new(LifecyclePoint::ToolExecuteBefore)
            .with_data("tool", Value::String("code_exec".into()));
        assert_eq!(ctx.get_str("tool"), Some("code_exec"));
        ctx.set("blocked", Value::Bool(true));
        assert_eq!(ctx.get("blocked"), Some(&Value::Bool(true)));
    }
}
