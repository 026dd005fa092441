//! Saga definition registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};

/// Catalog of saga definitions keyed by saga type name.
///
/// Registration takes `&mut self`, so all definitions are added while the
/// registry is still exclusively owned. Once it is wrapped in an `Arc` and
/// handed to a coordinator it can only be read, and lookups need no locking.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<SagaDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a definition under its own name.
    ///
    /// Steps after the first that have no compensating action are accepted
    /// but reported, since a failure after them leaves partial work behind.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        if self.definitions.contains_key(definition.name()) {
            return Err(SagaError::DuplicateDefinition(definition.name().to_string()));
        }
        definition.validate()?;

        let irreversible = definition.irreversible_steps();
        if !irreversible.is_empty() {
            let names: Vec<&str> = irreversible
                .iter()
                .filter_map(|&i| definition.step(i).map(|s| s.name.as_str()))
                .collect();
            tracing::warn!(
                saga_type = definition.name(),
                steps = ?names,
                "saga definition has non-first steps without compensation; \
                 a later failure cannot fully roll back"
            );
        }

        tracing::debug!(
            saga_type = definition.name(),
            steps = definition.len(),
            "saga definition registered"
        );
        self.definitions
            .insert(definition.name().to_string(), Arc::new(definition));
        Ok(())
    }

    /// Builder-style registration for startup code.
    pub fn with(mut self, definition: SagaDefinition) -> Result<Self> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn lookup(&self, saga_type: &str) -> Result<Arc<SagaDefinition>> {
        self.definitions
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    pub fn contains(&self, saga_type: &str) -> bool {
        self.definitions.contains_key(saga_type)
    }

    /// Registered saga type names in alphabetical order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
