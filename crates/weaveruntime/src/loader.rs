use crate::registry::StepRegistry;
use std::path::Path;
use weavecore::{
    BranchNode, BuildError, Composition, FlowError, LoopNode, NodeDefinition, Step,
    StepDefinition, Workflow, WorkflowDefinition,
};

/// Turns declarative definitions into validated composition trees.
pub struct WorkflowLoader<'a> {
    registry: &'a StepRegistry,
    default_max_iterations: u32,
}

impl<'a> WorkflowLoader<'a> {
    pub fn new(registry: &'a StepRegistry, default_max_iterations: u32) -> Self {
        Self {
            registry,
            default_max_iterations,
        }
    }

    pub fn load(&self, definition: &WorkflowDefinition) -> Result<Workflow, BuildError> {
        let root = self.build_node(&definition.root)?;
        let mut workflow = Workflow::new(definition.name.clone(), root);
        workflow.description = definition.description.clone();
        Ok(workflow)
    }

    fn build_node(&self, definition: &NodeDefinition) -> Result<Composition, BuildError> {
        match definition {
            NodeDefinition::Step(step) => Ok(Composition::Step(self.build_step(step)?)),
            NodeDefinition::Sequential { name, children } => {
                Composition::sequential(name.clone(), self.build_children(children)?)
            }
            NodeDefinition::Parallel { name, children } => {
                Composition::parallel(name.clone(), self.build_children(children)?)
            }
            NodeDefinition::Loop {
                name,
                children,
                max_iterations,
                marker_key,
                reset_marker,
            } => {
                let cap = max_iterations.unwrap_or(self.default_max_iterations);
                let mut node = LoopNode::new(name.clone(), self.build_children(children)?, cap)?;
                if let Some(key) = marker_key {
                    node = node.with_marker_key(key.clone());
                }
                if *reset_marker {
                    node = node.with_marker_reset();
                }
                Ok(node.into())
            }
            NodeDefinition::Branch {
                name,
                route_key,
                routes,
                default,
            } => {
                let routes = routes
                    .iter()
                    .map(|(route, child)| Ok((route.clone(), self.build_node(child)?)))
                    .collect::<Result<Vec<_>, BuildError>>()?;
                let default = default
                    .as_deref()
                    .map(|child| self.build_node(child))
                    .transpose()?;
                Ok(BranchNode::new(name.clone(), route_key.clone(), routes, default)?.into())
            }
        }
    }

    fn build_children(&self, children: &[NodeDefinition]) -> Result<Vec<Composition>, BuildError> {
        children.iter().map(|child| self.build_node(child)).collect()
    }

    fn build_step(&self, definition: &StepDefinition) -> Result<Step, BuildError> {
        let work = self.registry.create(&definition.kind, &definition.config)?;
        let mut step = Step::new(definition.name.clone(), work)
            .with_inputs(definition.inputs.iter().cloned());
        if let Some(key) = &definition.output_key {
            step = step.with_output_key(key.clone());
        }
        for key in &definition.optional_inputs {
            step = step.with_optional_input(key.clone());
        }
        Ok(step)
    }
}

/// Read a workflow definition from a JSON file
pub fn read_definition(path: impl AsRef<Path>) -> Result<WorkflowDefinition, FlowError> {
    let json = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&json)?)
}
