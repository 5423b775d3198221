use std::collections::HashMap;
use std::sync::Arc;
use weaveruntime::{DataflowGraph, RuntimeConfig, StepFactory, StepRegistry, WeaveRuntime};
use weavecore::{
    BuildError, NodeDefinition, SharedState, StepContext, StepDefinition, StepOutput, UnitOfWork,
    Value, WorkError, WorkflowDefinition,
};

/// Writes the configured text.
struct Echo(String);

#[async_trait::async_trait]
impl UnitOfWork for Echo {
    fn kind(&self) -> &str {
        "test.echo"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, WorkError> {
        Ok(StepOutput::value(self.0.clone()))
    }
}

struct EchoFactory;

impl StepFactory for EchoFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Arc<dyn UnitOfWork>, WorkError> {
        let text = config
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkError::Configuration("missing 'text'".into()))?;
        Ok(Arc::new(Echo(text.to_string())))
    }

    fn kind(&self) -> &str {
        "test.echo"
    }
}

fn runtime() -> WeaveRuntime {
    let mut registry = StepRegistry::new();
    registry.register(Arc::new(EchoFactory));
    WeaveRuntime::with_registry(Arc::new(registry), RuntimeConfig::default())
}

fn echo(name: &str, key: &str, text: &str) -> StepDefinition {
    StepDefinition::new(name, "test.echo")
        .with_output_key(key)
        .with_config("text", text)
}

fn briefing() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "ResearchSystem".into(),
        description: None,
        initial_keys: vec!["user_query".into()],
        root: NodeDefinition::Sequential {
            name: "ResearchSystem".into(),
            children: vec![
                NodeDefinition::Parallel {
                    name: "ParallelResearchTeam".into(),
                    children: vec![
                        echo("TechResearcher", "tech_research", "AI").with_input("user_query").into(),
                        echo("HealthResearcher", "health_research", "health").into(),
                    ],
                },
                echo("AggregatorAgent", "executive_summary", "summary")
                    .with_input("tech_research")
                    .with_input("health_research")
                    .into(),
            ],
        },
    }
}

#[tokio::test]
async fn loaded_definition_runs() {
    let runtime = runtime();
    let workflow = runtime.load(&briefing()).unwrap();
    let id = runtime.register_workflow(workflow).await;

    let report = runtime
        .execute_workflow(id, SharedState::from_query("daily briefing"))
        .await
        .unwrap();

    assert_eq!(report.state.get("executive_summary"), Some(&Value::from("summary")));
    assert_eq!(report.state.len(), 4);
}

#[test]
fn loop_without_cap_uses_runtime_default() {
    let def = WorkflowDefinition {
        name: "loop".into(),
        description: None,
        initial_keys: vec![],
        root: NodeDefinition::Loop {
            name: "Refine".into(),
            children: vec![echo("critic", "critique", "ok").into()],
            max_iterations: None,
            marker_key: None,
            reset_marker: false,
        },
    };

    let workflow = runtime().load(&def).unwrap();
    match workflow.root().as_ref() {
        weavecore::Composition::Loop(node) => assert_eq!(node.max_iterations(), 10),
        other => panic!("unexpected root {:?}", other),
    }
}

#[test]
fn unknown_step_type_is_a_build_error() {
    let def = WorkflowDefinition {
        name: "bad".into(),
        description: None,
        initial_keys: vec![],
        root: StepDefinition::new("x", "nope").into(),
    };
    assert_eq!(
        runtime().load(&def).unwrap_err(),
        BuildError::UnknownStepType("nope".into())
    );
}

#[test]
fn collision_in_definition_is_caught_at_load() {
    let def = WorkflowDefinition {
        name: "clash".into(),
        description: None,
        initial_keys: vec![],
        root: NodeDefinition::Parallel {
            name: "Team".into(),
            children: vec![echo("a", "same", "1").into(), echo("b", "same", "2").into()],
        },
    };
    assert!(matches!(
        runtime().load(&def).unwrap_err(),
        BuildError::OutputKeyCollision { .. }
    ));
}

#[test]
fn dataflow_links_producers_to_consumers() {
    let def = briefing();
    let workflow = runtime().load(&def).unwrap();
    let graph = DataflowGraph::analyze(&workflow, &def.initial_keys);

    assert!(graph.is_satisfied());
    let edges = graph.edges();
    assert!(edges.contains(&(
        "TechResearcher".to_string(),
        "AggregatorAgent".to_string(),
        "tech_research".to_string()
    )));
    assert!(edges.contains(&(
        "initial state".to_string(),
        "TechResearcher".to_string(),
        "user_query".to_string()
    )));
    assert!(graph.to_dot().contains("AggregatorAgent"));
}

#[test]
fn dataflow_reports_inputs_nobody_produces() {
    let def = briefing();
    let workflow = runtime().load(&def).unwrap();
    let graph = DataflowGraph::analyze(&workflow, &[]);

    let missing: Vec<_> = graph.unresolved().iter().map(|u| u.key.as_str()).collect();
    assert_eq!(missing, vec!["user_query"]);
}

#[test]
fn dataflow_adds_feedback_edges_inside_loops() {
    let def = WorkflowDefinition {
        name: "story".into(),
        description: None,
        initial_keys: vec!["current_story".into()],
        root: NodeDefinition::Loop {
            name: "Refine".into(),
            children: vec![
                echo("critic", "critique", "ok").with_input("current_story").into(),
                echo("refiner", "current_story", "new")
                    .with_input("critique")
                    .into(),
            ],
            max_iterations: Some(2),
            marker_key: None,
            reset_marker: false,
        },
    };
    let workflow = runtime().load(&def).unwrap();
    let graph = DataflowGraph::analyze(&workflow, &def.initial_keys);

    assert!(graph.edges().contains(&(
        "refiner".to_string(),
        "critic".to_string(),
        "current_story".to_string()
    )));
}

#[test]
fn loop_definition_can_opt_into_marker_reset() {
    let json = r#"{
        "name": "chapters",
        "root": {
            "type": "loop",
            "name": "Refine",
            "max_iterations": 3,
            "reset_marker": true,
            "children": [
                {"type": "step", "name": "critic", "kind": "test.echo",
                 "output_key": "critique", "config": {"text": "ok"}}
            ]
        }
    }"#;
    let def: WorkflowDefinition = serde_json::from_str(json).unwrap();
    let workflow = runtime().load(&def).unwrap();

    match workflow.root().as_ref() {
        weavecore::Composition::Loop(node) => {
            assert!(node.resets_marker());
            assert_eq!(node.marker_key(), "Refine.terminated");
        }
        other => panic!("unexpected root {:?}", other),
    }
}
