use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::BTreeMap;
use weavecore::{Composition, Workflow};

const INITIAL_STATE: &str = "initial state";

/// A required input that no earlier step and no initial key can supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedInput {
    pub step: String,
    pub key: String,
}

/// Producer/consumer graph of the keys flowing through a workflow.
///
/// Nodes are steps (plus synthetic nodes for the initial state, loop
/// markers and branch routing); an edge `a -> b` labelled `k` means `b`
/// reads key `k` last written by `a`.
pub struct DataflowGraph {
    graph: DiGraph<String, String>,
    unresolved: Vec<UnresolvedInput>,
}

impl DataflowGraph {
    pub fn analyze(workflow: &Workflow, initial_keys: &[String]) -> Self {
        let mut builder = Builder::default();
        let mut available = Producers::new();

        if !initial_keys.is_empty() {
            let idx = builder.graph.add_node(INITIAL_STATE.to_string());
            for key in initial_keys {
                available.insert(key.clone(), vec![idx]);
            }
        }

        builder.walk(workflow.root(), &mut available);

        Self {
            graph: builder.graph,
            unresolved: builder.unresolved,
        }
    }

    pub fn unresolved(&self) -> &[UnresolvedInput] {
        &self.unresolved
    }

    pub fn is_satisfied(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// `(producer, consumer, key)` triples
    pub fn edges(&self) -> Vec<(String, String, String)> {
        self.graph
            .edge_references()
            .map(|edge| {
                (
                    self.graph[edge.source()].clone(),
                    self.graph[edge.target()].clone(),
                    edge.weight().clone(),
                )
            })
            .collect()
    }

    /// Graphviz rendering
    pub fn to_dot(&self) -> String {
        format!("{}", Dot::new(&self.graph))
    }
}

type Producers = BTreeMap<String, Vec<NodeIndex>>;

#[derive(Default)]
struct Builder {
    graph: DiGraph<String, String>,
    unresolved: Vec<UnresolvedInput>,
    reads: Vec<(NodeIndex, String)>,
}

impl Builder {
    fn walk(&mut self, node: &Composition, available: &mut Producers) {
        match node {
            Composition::Step(step) => {
                let idx = self.graph.add_node(step.name().to_string());
                for key in step.inputs() {
                    self.read(idx, step.name(), key, available, true);
                }
                for key in step.optional_inputs() {
                    self.read(idx, step.name(), key, available, false);
                }
                if let Some(key) = step.output_key() {
                    available.insert(key.to_string(), vec![idx]);
                }
            }
            Composition::Sequential(seq) => {
                for child in seq.children() {
                    self.walk(child, available);
                }
            }
            Composition::Loop(lp) => {
                let first_read = self.reads.len();
                let first_node = self.graph.node_count();
                for child in lp.children() {
                    self.walk(child, available);
                }

                // Values written late in the body feed earlier readers on the next pass.
                let feedback: Vec<(NodeIndex, NodeIndex, String)> = self.reads[first_read..]
                    .iter()
                    .flat_map(|(reader, key)| {
                        available
                            .get(key)
                            .into_iter()
                            .flatten()
                            .filter(|producer| {
                                producer.index() >= first_node && producer.index() > reader.index()
                            })
                            .map(|producer| (*producer, *reader, key.clone()))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                for (producer, reader, key) in feedback {
                    self.graph.add_edge(producer, reader, key);
                }

                let marker = self.graph.add_node(format!("loop {}", lp.name()));
                available.insert(lp.marker_key().to_string(), vec![marker]);
            }
            Composition::Parallel(_) => {
                self.walk_alternatives(node.children(), available);
            }
            Composition::Branch(branch) => {
                let idx = self.graph.add_node(format!("branch {}", branch.name()));
                self.read(idx, branch.name(), branch.route_key(), available, true);
                self.walk_alternatives(node.children(), available);
            }
        }
    }

    /// Walk children that all start from the same view of state and merge
    /// whatever each of them produced.
    fn walk_alternatives(&mut self, children: Vec<&Composition>, available: &mut Producers) {
        let entry = available.clone();
        let mut produced = Producers::new();
        for child in children {
            let mut branch = entry.clone();
            self.walk(child, &mut branch);
            for (key, producers) in branch {
                if entry.get(&key) != Some(&producers) {
                    produced.entry(key).or_default().extend(producers);
                }
            }
        }
        available.extend(produced);
    }

    fn read(
        &mut self,
        reader: NodeIndex,
        name: &str,
        key: &str,
        available: &Producers,
        required: bool,
    ) {
        self.reads.push((reader, key.to_string()));
        match available.get(key) {
            Some(producers) => {
                for producer in producers {
                    self.graph.add_edge(*producer, reader, key.to_string());
                }
            }
            None if required => self.unresolved.push(UnresolvedInput {
                step: name.to_string(),
                key: key.to_string(),
            }),
            None => {}
        }
    }
}
