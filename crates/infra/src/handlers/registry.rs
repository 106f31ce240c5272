use std::sync::Arc;

use thiserror::Error;

use jobsweep_events::ChangeHandler;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handler '{0}' is already registered")]
    DuplicateName(String),

    #[error("handler name must not be empty")]
    EmptyName,
}

/// Ordered set of change handlers, assembled once at startup.
///
/// The dispatcher offers every event to every registered handler. Adding a
/// handler needs no dispatcher change.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ChangeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ChangeHandler>) -> Result<(), RegistryError> {
        let name = handler.name();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.iter().any(|h| h.name() == name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        self.handlers.push(handler);
        Ok(())
    }

    /// Builder-style [`HandlerRegistry::register`].
    pub fn with(mut self, handler: Arc<dyn ChangeHandler>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn handlers(&self) -> &[Arc<dyn ChangeHandler>] {
        &self.handlers
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobsweep_events::{ChangeEvent, HandlerOutcome};

    struct Named(&'static str);

    #[async_trait]
    impl ChangeHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _event: &ChangeEvent) -> HandlerOutcome {
            HandlerOutcome::Skipped
        }
    }

    #[test]
    fn keeps_registration_order_and_rejects_duplicates() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Named("b")))
            .unwrap()
            .with(Arc::new(Named("a")))
            .unwrap();
        assert_eq!(registry.names(), vec!["b", "a"]);

        let mut registry = registry;
        assert_eq!(
            registry.register(Arc::new(Named("a"))),
            Err(RegistryError::DuplicateName("a".to_string()))
        );
        assert_eq!(registry.register(Arc::new(Named(""))), Err(RegistryError::EmptyName));
        assert_eq!(registry.len(), 2);
    }
}
