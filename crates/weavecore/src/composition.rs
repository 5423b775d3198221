use crate::{BuildError, Step};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

pub type WorkflowId = Uuid;

/// Node of a composition tree. Built once through the validating
/// constructors and never mutated afterwards.
#[derive(Debug)]
pub enum Composition {
    Step(Step),
    Sequential(SequentialNode),
    Parallel(ParallelNode),
    Loop(LoopNode),
    Branch(BranchNode),
}

impl Composition {
    pub fn sequential(
        name: impl Into<String>,
        children: Vec<Composition>,
    ) -> Result<Self, BuildError> {
        Ok(Composition::Sequential(SequentialNode::new(name, children)?))
    }

    pub fn parallel(
        name: impl Into<String>,
        children: Vec<Composition>,
    ) -> Result<Self, BuildError> {
        Ok(Composition::Parallel(ParallelNode::new(name, children)?))
    }

    pub fn looped(
        name: impl Into<String>,
        children: Vec<Composition>,
        max_iterations: u32,
    ) -> Result<Self, BuildError> {
        Ok(Composition::Loop(LoopNode::new(name, children, max_iterations)?))
    }

    pub fn name(&self) -> &str {
        match self {
            Composition::Step(step) => step.name(),
            Composition::Sequential(node) => &node.name,
            Composition::Parallel(node) => &node.name,
            Composition::Loop(node) => &node.name,
            Composition::Branch(node) => &node.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Composition::Step(_) => "step",
            Composition::Sequential(_) => "sequential",
            Composition::Parallel(_) => "parallel",
            Composition::Loop(_) => "loop",
            Composition::Branch(_) => "branch",
        }
    }

    /// Direct children in declaration order.
    pub fn children(&self) -> Vec<&Composition> {
        match self {
            Composition::Step(_) => Vec::new(),
            Composition::Sequential(node) => node.children.iter().map(|c| &**c).collect(),
            Composition::Parallel(node) => node.children.iter().map(|c| &**c).collect(),
            Composition::Loop(node) => node.children.iter().map(|c| &**c).collect(),
            Composition::Branch(node) => node
                .routes
                .values()
                .chain(node.default.iter())
                .map(|c| &**c)
                .collect(),
        }
    }

    /// Every key this subtree can write, including loop markers.
    pub fn output_keys(&self) -> BTreeSet<String> {
        match self {
            Composition::Step(step) => step.output_key().map(str::to_string).into_iter().collect(),
            Composition::Loop(node) => {
                let mut keys = union_outputs(&node.children);
                keys.insert(node.marker_key.clone());
                keys
            }
            other => other
                .children()
                .into_iter()
                .flat_map(Composition::output_keys)
                .collect(),
        }
    }

    /// Required keys this subtree reads from state it was handed, paired
    /// with the step that reads them. Keys produced earlier inside the same
    /// sequential or loop body are not external.
    pub fn external_inputs(&self) -> Vec<(String, String)> {
        match self {
            Composition::Step(step) => step
                .inputs()
                .iter()
                .map(|key| (key.clone(), step.name().to_string()))
                .collect(),
            Composition::Sequential(SequentialNode { children, .. })
            | Composition::Loop(LoopNode { children, .. }) => {
                let mut produced = BTreeSet::new();
                let mut external = Vec::new();
                for child in children {
                    for (key, consumer) in child.external_inputs() {
                        if !produced.contains(&key) {
                            external.push((key, consumer));
                        }
                    }
                    produced.extend(child.output_keys());
                }
                external
            }
            Composition::Parallel(node) => node
                .children
                .iter()
                .flat_map(|child| child.external_inputs())
                .collect(),
            Composition::Branch(node) => {
                let mut external = vec![(node.route_key.clone(), node.name.clone())];
                for child in node.routes.values().chain(node.default.iter()) {
                    external.extend(child.external_inputs());
                }
                external
            }
        }
    }

    /// All steps of the subtree, depth first in declaration order.
    pub fn steps(&self) -> Vec<&Step> {
        match self {
            Composition::Step(step) => vec![step],
            other => other
                .children()
                .into_iter()
                .flat_map(Composition::steps)
                .collect(),
        }
    }
}

impl From<Step> for Composition {
    fn from(step: Step) -> Self {
        Composition::Step(step)
    }
}

fn union_outputs(children: &[Arc<Composition>]) -> BTreeSet<String> {
    children.iter().flat_map(|c| c.output_keys()).collect()
}

fn wrap(children: Vec<Composition>) -> Vec<Arc<Composition>> {
    children.into_iter().map(Arc::new).collect()
}

/// Runs children in order; each sees everything merged before it.
#[derive(Debug)]
pub struct SequentialNode {
    pub(crate) name: String,
    pub(crate) children: Vec<Arc<Composition>>,
}

impl SequentialNode {
    pub fn new(name: impl Into<String>, children: Vec<Composition>) -> Result<Self, BuildError> {
        let name = name.into();
        if children.is_empty() {
            return Err(BuildError::EmptyComposite(name));
        }
        Ok(Self {
            name,
            children: wrap(children),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Arc<Composition>] {
        &self.children
    }
}

/// Runs children concurrently against one snapshot and merges their
/// outputs after all of them finish.
#[derive(Debug)]
pub struct ParallelNode {
    pub(crate) name: String,
    pub(crate) children: Vec<Arc<Composition>>,
}

impl ParallelNode {
    /// Fails when two children write the same key, or when a child requires
    /// a key that a sibling produces.
    pub fn new(name: impl Into<String>, children: Vec<Composition>) -> Result<Self, BuildError> {
        let name = name.into();
        if children.is_empty() {
            return Err(BuildError::EmptyComposite(name));
        }

        let mut owners: BTreeMap<String, usize> = BTreeMap::new();
        for (idx, child) in children.iter().enumerate() {
            for key in child.output_keys() {
                if let Some(&first) = owners.get(&key) {
                    return Err(BuildError::OutputKeyCollision {
                        node: name,
                        key,
                        first: children[first].name().to_string(),
                        second: child.name().to_string(),
                    });
                }
                owners.insert(key, idx);
            }
        }

        for (idx, child) in children.iter().enumerate() {
            for (key, consumer) in child.external_inputs() {
                match owners.get(&key) {
                    Some(&producer) if producer != idx => {
                        return Err(BuildError::SiblingDependency {
                            node: name,
                            key,
                            consumer,
                            producer: children[producer].name().to_string(),
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            name,
            children: wrap(children),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Arc<Composition>] {
        &self.children
    }
}

/// Repeats its body until a step signals termination or the cap is reached.
///
/// The marker key stays `true` after a signal and is never cleared by
/// default, so a loop entered again from an enclosing loop starts with the
/// marker already set. Steps that skip their work once the marker is set
/// then never signal again and the loop runs to its cap. Use
/// [`LoopNode::with_marker_reset`] for loops that are re-entered.
#[derive(Debug)]
pub struct LoopNode {
    pub(crate) name: String,
    pub(crate) children: Vec<Arc<Composition>>,
    pub(crate) max_iterations: u32,
    pub(crate) marker_key: String,
    pub(crate) reset_marker: bool,
}

impl LoopNode {
    pub fn new(
        name: impl Into<String>,
        children: Vec<Composition>,
        max_iterations: u32,
    ) -> Result<Self, BuildError> {
        let name = name.into();
        if max_iterations == 0 {
            return Err(BuildError::InvalidIterationCap { node: name });
        }
        if children.is_empty() {
            return Err(BuildError::EmptyComposite(name));
        }
        let marker_key = Self::default_marker_key(&name);
        Ok(Self {
            name,
            children: wrap(children),
            max_iterations,
            marker_key,
            reset_marker: false,
        })
    }

    /// Key the loop sets to `true` once a body step signals termination.
    pub fn default_marker_key(name: &str) -> String {
        format!("{}.terminated", name)
    }

    pub fn with_marker_key(mut self, key: impl Into<String>) -> Self {
        self.marker_key = key.into();
        self
    }

    /// Set the marker to `false` every time the loop is entered.
    pub fn with_marker_reset(mut self) -> Self {
        self.reset_marker = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn children(&self) -> &[Arc<Composition>] {
        &self.children
    }

    pub fn resets_marker(&self) -> bool {
        self.reset_marker
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn marker_key(&self) -> &str {
        &self.marker_key
    }
}

impl From<LoopNode> for Composition {
    fn from(node: LoopNode) -> Self {
        Composition::Loop(node)
    }
}

/// Dispatches on a routing value a previous step wrote into state.
#[derive(Debug)]
pub struct BranchNode {
    pub(crate) name: String,
    pub(crate) route_key: String,
    pub(crate) routes: BTreeMap<String, Arc<Composition>>,
    pub(crate) default: Option<Arc<Composition>>,
}

impl BranchNode {
    pub fn new(
        name: impl Into<String>,
        route_key: impl Into<String>,
        routes: Vec<(String, Composition)>,
        default: Option<Composition>,
    ) -> Result<Self, BuildError> {
        let name = name.into();
        if routes.is_empty() && default.is_none() {
            return Err(BuildError::EmptyComposite(name));
        }
        let mut table = BTreeMap::new();
        for (route, child) in routes {
            if table.insert(route.clone(), Arc::new(child)).is_some() {
                return Err(BuildError::Invalid(format!(
                    "branch '{}' declares route '{}' twice",
                    name, route
                )));
            }
        }
        Ok(Self {
            name,
            route_key: route_key.into(),
            routes: table,
            default: default.map(Arc::new),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    pub fn route(&self, value: &str) -> Option<&Arc<Composition>> {
        self.routes.get(value).or(self.default.as_ref())
    }
}

impl From<BranchNode> for Composition {
    fn from(node: BranchNode) -> Self {
        Composition::Branch(node)
    }
}

/// A named, validated composition tree, reusable across runs.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: Option<String>,
    root: Arc<Composition>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, root: impl Into<Composition>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            root: Arc::new(root.into()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn root(&self) -> &Arc<Composition> {
        &self.root
    }

    pub fn steps(&self) -> Vec<&Step> {
        self.root.steps()
    }
}
