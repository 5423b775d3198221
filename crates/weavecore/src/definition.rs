use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Declarative description of a workflow, as stored in workflow files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Keys the caller is expected to supply in the initial state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial_keys: Vec<String>,
    pub root: NodeDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeDefinition {
    Step(StepDefinition),
    Sequential {
        name: String,
        children: Vec<NodeDefinition>,
    },
    Parallel {
        name: String,
        children: Vec<NodeDefinition>,
    },
    Loop {
        name: String,
        children: Vec<NodeDefinition>,
        /// Falls back to the runtime's default cap when omitted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker_key: Option<String>,
        /// Clear the marker on every entry
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        reset_marker: bool,
    },
    Branch {
        name: String,
        route_key: String,
        routes: BTreeMap<String, NodeDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Box<NodeDefinition>>,
    },
}

impl NodeDefinition {
    pub fn name(&self) -> &str {
        match self {
            NodeDefinition::Step(step) => &step.name,
            NodeDefinition::Sequential { name, .. }
            | NodeDefinition::Parallel { name, .. }
            | NodeDefinition::Loop { name, .. }
            | NodeDefinition::Branch { name, .. } => name,
        }
    }
}

/// Step declaration: identity, data dependencies and the unit of work to
/// instantiate from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, Value>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            output_key: None,
            inputs: Vec::new(),
            optional_inputs: Vec::new(),
            config: HashMap::new(),
        }
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>) -> Self {
        self.inputs.push(key.into());
        self
    }

    pub fn with_optional_input(mut self, key: impl Into<String>) -> Self {
        self.optional_inputs.push(key.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

impl From<StepDefinition> for NodeDefinition {
    fn from(step: StepDefinition) -> Self {
        NodeDefinition::Step(step)
    }
}
