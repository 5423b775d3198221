use std::collections::HashMap;
use std::sync::Arc;
use weavecore::{BuildError, UnitOfWork, Value, WorkError};

/// Factory trait for creating units of work from declarative config
pub trait StepFactory: Send + Sync {
    /// Create a new unit of work with the given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn UnitOfWork>, WorkError>;

    /// Step type identifier
    fn kind(&self) -> &str;

    /// Optional: description and accepted config fields
    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Metadata about a step type
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
    pub config: Vec<ConfigField>,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            config: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigField {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl ConfigField {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Registry of available step types
pub struct StepRegistry {
    factories: HashMap<String, Arc<dyn StepFactory>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a step factory
    pub fn register(&mut self, factory: Arc<dyn StepFactory>) {
        let kind = factory.kind().to_string();
        tracing::debug!("Registering step type: {}", kind);
        self.factories.insert(kind, factory);
    }

    /// Create a unit of work from a step type and config
    pub fn create(
        &self,
        kind: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Arc<dyn UnitOfWork>, BuildError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| BuildError::UnknownStepType(kind.to_string()))?;

        factory
            .create(config)
            .map_err(|e| BuildError::Invalid(format!("Failed to create '{}' step: {}", kind, e)))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// All registered step types, sorted
    pub fn list_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn metadata(&self, kind: &str) -> Option<StepMetadata> {
        self.factories.get(kind).map(|f| f.metadata())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
