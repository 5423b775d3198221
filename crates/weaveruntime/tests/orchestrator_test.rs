use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use weaveruntime::{Executor, RunReport, WeaveRuntime};
use weavecore::{
    BranchNode, Composition, ExecutionEvent, FlowError, LoopNode, LoopOutcome, SharedState, Step,
    StepOutput, TerminationSignal, Value, WorkError, Workflow,
};

fn executor() -> Executor {
    let (sender, _) = broadcast::channel(256);
    Executor::new(sender)
}

async fn run(tree: Composition, state: SharedState) -> Result<RunReport, FlowError> {
    executor().run(&Workflow::new("test", tree), state).await
}

/// Step that writes a fixed string after an optional delay.
fn constant(name: &str, key: &str, value: &str, delay_ms: u64) -> Step {
    let value = value.to_string();
    Step::from_fn(name, move |_ctx| {
        let value = value.clone();
        async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            Ok(StepOutput::value(value))
        }
    })
    .with_output_key(key)
}

fn counting(name: &str, key: &str, counter: Arc<AtomicUsize>) -> Step {
    Step::from_fn(name, move |_ctx| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(StepOutput::value(format!("pass {}", n)))
        }
    })
    .with_output_key(key)
}

#[tokio::test]
async fn sequential_writer_sees_outline_output() {
    let seen = Arc::new(Mutex::new(None));
    let recorder = seen.clone();

    let outline = Step::from_fn("outline", |ctx| async move {
        let topic = ctx.require_str("topic")?.to_string();
        Ok::<_, WorkError>(StepOutput::value(format!("Outline about {}", topic)))
    })
    .with_input("topic")
    .with_output_key("blog_outline");

    let writer = Step::from_fn("writer", move |ctx| {
        let recorder = recorder.clone();
        async move {
            let outline = ctx.require_input("blog_outline")?.clone();
            *recorder.lock().unwrap() = Some(outline.clone());
            Ok::<_, WorkError>(StepOutput::value(format!("Draft following: {}", outline)))
        }
    })
    .with_input("blog_outline")
    .with_output_key("blog_draft");

    let tree = Composition::sequential("BlogPipeline", vec![outline.into(), writer.into()]).unwrap();
    let report = run(tree, SharedState::new().with("topic", "solar power"))
        .await
        .unwrap();

    let outline_value = report.state.get("blog_outline").cloned().unwrap();
    assert_eq!(outline_value, Value::from("Outline about solar power"));
    assert!(report.state.contains("blog_draft"));
    assert_eq!(seen.lock().unwrap().clone(), Some(outline_value));
    assert_eq!(report.steps_executed, 2);
}

#[tokio::test]
async fn sequential_step_sees_only_earlier_outputs() {
    let observed: Arc<Mutex<Vec<BTreeSet<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let keys = ["k0", "k1", "k2"];

    let children: Vec<Composition> = keys
        .iter()
        .map(|key| {
            let observed = observed.clone();
            let mut step = Step::from_fn(*key, move |ctx| {
                let observed = observed.clone();
                async move {
                    let present: BTreeSet<String> = ctx.inputs.keys().cloned().collect();
                    observed.lock().unwrap().push(present);
                    Ok(StepOutput::value("done"))
                }
            })
            .with_output_key(*key);
            for other in keys {
                step = step.with_optional_input(other);
            }
            Composition::from(step)
        })
        .collect();

    let tree = Composition::sequential("Ordered", children).unwrap();
    run(tree, SharedState::new()).await.unwrap();

    let observed = observed.lock().unwrap();
    let expected: Vec<BTreeSet<String>> = vec![
        BTreeSet::new(),
        ["k0"].iter().map(|s| s.to_string()).collect(),
        ["k0", "k1"].iter().map(|s| s.to_string()).collect(),
    ];
    assert_eq!(*observed, expected);
}

#[tokio::test]
async fn sequential_fails_fast_on_missing_input() {
    let later = Arc::new(AtomicUsize::new(0));

    let writer = Step::from_fn("writer", |_ctx| async { Ok(StepOutput::value("draft")) })
        .with_input("blog_outline")
        .with_output_key("blog_draft");

    let tree = Composition::sequential(
        "Broken",
        vec![writer.into(), counting("editor", "final_blog", later.clone()).into()],
    )
    .unwrap();

    let err = run(tree, SharedState::new().with("topic", "solar power"))
        .await
        .unwrap_err();

    match err {
        FlowError::MissingInput { step, key } => {
            assert_eq!(step, "writer");
            assert_eq!(key, "blog_outline");
        }
        other => panic!("expected MissingInput, got {:?}", other),
    }
    assert_eq!(later.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unit_of_work_errors_carry_step_name() {
    let failing = Step::from_fn("SummarizerAgent", |_ctx| async {
        Err::<StepOutput, _>(WorkError::Http {
            status: 503,
            message: "unavailable".into(),
        })
    })
    .with_output_key("final_summary");

    let err = run(failing.into(), SharedState::new()).await.unwrap_err();
    match err {
        FlowError::UnitOfWork { step, source } => {
            assert_eq!(step, "SummarizerAgent");
            assert!(matches!(source, WorkError::Http { status: 503, .. }));
        }
        other => panic!("expected UnitOfWork, got {:?}", other),
    }
}

fn research_team(reversed: bool) -> Composition {
    let mut children: Vec<Composition> = vec![
        constant("TechResearcher", "tech_research", "AI chips", 30).into(),
        constant("HealthResearcher", "health_research", "mRNA", 5).into(),
        constant("FinanceResearcher", "finance_research", "stablecoins", 15).into(),
    ];
    if reversed {
        children.reverse();
    }
    Composition::parallel("ParallelResearchTeam", children).unwrap()
}

#[tokio::test]
async fn parallel_merges_every_sibling_regardless_of_order() {
    let initial = SharedState::new().with("topic", "daily briefing");

    let forward = run(research_team(false), initial.clone()).await.unwrap();
    let reversed = run(research_team(true), initial.clone()).await.unwrap();

    let expected = initial
        .clone()
        .with("tech_research", "AI chips")
        .with("health_research", "mRNA")
        .with("finance_research", "stablecoins");

    assert_eq!(forward.state, expected);
    assert_eq!(reversed.state, expected);
}

#[tokio::test]
async fn parallel_merge_is_independent_of_completion_order() {
    let outputs = [
        ("TechResearcher", "tech_research", "AI chips"),
        ("HealthResearcher", "health_research", "mRNA"),
        ("FinanceResearcher", "finance_research", "stablecoins"),
        ("ClimateResearcher", "climate_research", "grid storage"),
    ];
    let initial = SharedState::new().with("topic", "daily briefing");
    let expected = outputs
        .iter()
        .fold(initial.clone(), |state, (_, key, value)| state.with(*key, *value));

    let mut rng = rand::thread_rng();
    for _ in 0..8 {
        let mut order: Vec<usize> = (0..outputs.len()).collect();
        order.shuffle(&mut rng);
        let children: Vec<Composition> = order
            .iter()
            .map(|&i| {
                let (name, key, value) = outputs[i];
                constant(name, key, value, rng.gen_range(0..25)).into()
            })
            .collect();

        let tree = Composition::parallel("ParallelResearchTeam", children).unwrap();
        let report = run(tree, initial.clone()).await.unwrap();
        assert_eq!(report.state, expected, "dispatch order {:?}", order);
    }
}

#[tokio::test]
async fn parallel_siblings_run_concurrently() {
    let tree = Composition::parallel(
        "Slow",
        vec![
            constant("a", "a", "1", 200).into(),
            constant("b", "b", "2", 200).into(),
            constant("c", "c", "3", 200).into(),
        ],
    )
    .unwrap();

    let start = std::time::Instant::now();
    run(tree, SharedState::new()).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(550));
}

#[tokio::test]
async fn parallel_waits_for_all_siblings_then_aggregates_failures() {
    let slow_done = Arc::new(AtomicUsize::new(0));
    let slow_counter = slow_done.clone();

    let slow = Step::from_fn("slow", move |_ctx| {
        let slow_counter = slow_counter.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            slow_counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::value("finished"))
        }
    })
    .with_output_key("slow");

    let fail = |name: &'static str, key: &str| {
        Step::from_fn(name, move |_ctx| async move {
            Err::<StepOutput, _>(WorkError::ExecutionFailed(format!("{} broke", name)))
        })
        .with_output_key(key)
    };

    let tree = Composition::parallel(
        "Team",
        vec![fail("first", "x").into(), slow.into(), fail("second", "y").into()],
    )
    .unwrap();

    let err = run(tree, SharedState::new()).await.unwrap_err();
    match err {
        FlowError::SiblingFailures { node, failures } => {
            assert_eq!(node, "Team");
            assert_eq!(failures.len(), 2);
            let steps: Vec<_> = failures.iter().filter_map(|f| f.step()).collect();
            assert_eq!(steps, vec!["first", "second"]);
        }
        other => panic!("expected SiblingFailures, got {:?}", other),
    }
    assert_eq!(slow_done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn loop_stops_on_the_signalling_pass() {
    let passes = Arc::new(AtomicUsize::new(0));
    let counter = passes.clone();

    let critic = Step::from_fn("critic", move |_ctx| {
        let counter = counter.clone();
        async move {
            let pass = counter.fetch_add(1, Ordering::SeqCst) + 1;
            let output = StepOutput::value(format!("critique {}", pass));
            if pass == 3 {
                Ok(output.with_signal(TerminationSignal::stop_with("good enough")))
            } else {
                Ok(output)
            }
        }
    })
    .with_output_key("critique");

    let tree: Composition = LoopNode::new("Refine", vec![critic.into()], 5).unwrap().into();
    let report = run(tree, SharedState::new()).await.unwrap();

    assert_eq!(passes.load(Ordering::SeqCst), 3);
    let lp = report.loop_report("Refine").unwrap();
    assert_eq!(lp.iterations, 3);
    assert_eq!(
        lp.outcome,
        LoopOutcome::TerminatedBySignal {
            message: Some("good enough".to_string())
        }
    );
    assert_eq!(report.state.get("Refine.terminated"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn loop_runs_to_cap_without_signal() {
    let passes = Arc::new(AtomicUsize::new(0));
    let tree = Composition::looped(
        "Refine",
        vec![counting("critic", "critique", passes.clone()).into()],
        4,
    )
    .unwrap();

    let report = run(tree, SharedState::new()).await.unwrap();

    assert_eq!(passes.load(Ordering::SeqCst), 4);
    let lp = report.loop_report("Refine").unwrap();
    assert_eq!(lp.iterations, 4);
    assert_eq!(lp.outcome, LoopOutcome::TerminatedByCap);
    assert!(!report.state.contains("Refine.terminated"));
    assert_eq!(report.state.get("critique"), Some(&Value::from("pass 4")));
}

/// Refiner that skips its side effect once the loop marker is set.
fn refiner(marker: &str, actions: Arc<AtomicUsize>) -> Step {
    let marker_key = marker.to_string();
    Step::from_fn("refiner", move |ctx| {
        let actions = actions.clone();
        let marker_set = ctx.flag(&marker_key);
        async move {
            let story = ctx.require_input("current_story")?.clone();
            if marker_set {
                return Ok(StepOutput { value: Some(story), signal: None });
            }
            actions.fetch_add(1, Ordering::SeqCst);
            Ok::<_, WorkError>(StepOutput::value(format!("{} (revised)", story)))
        }
    })
    .with_input("current_story")
    .with_optional_input(marker)
    .with_output_key("current_story")
}

#[tokio::test]
async fn pass_completes_but_later_steps_see_the_marker() {
    let actions = Arc::new(AtomicUsize::new(0));
    let critic = Step::from_fn("critic", |_ctx| async {
        Ok(StepOutput::value("APPROVED").with_signal(TerminationSignal::stop()))
    })
    .with_input("current_story")
    .with_output_key("critique");

    let body = vec![critic.into(), refiner("loop.terminated", actions.clone()).into()];
    let node = LoopNode::new("StoryRefinementLoop", body, 2)
        .unwrap()
        .with_marker_key("loop.terminated");

    let report = run(node.into(), SharedState::new().with("current_story", "lighthouse"))
        .await
        .unwrap();

    let lp = report.loop_report("StoryRefinementLoop").unwrap();
    assert_eq!(lp.iterations, 1);
    assert!(lp.outcome.by_signal());
    assert_eq!(actions.load(Ordering::SeqCst), 0);
    assert!(report.state.flag("loop.terminated"));
    assert_eq!(report.state.get("current_story"), Some(&Value::from("lighthouse")));
}

#[tokio::test]
async fn replayed_state_does_not_repeat_exit_action() {
    let exits = Arc::new(AtomicUsize::new(0));
    let exit_counter = exits.clone();

    let critic = Step::from_fn("critic", |_ctx| async { Ok(StepOutput::value("APPROVED")) })
        .with_output_key("critique");

    let gate = Step::from_fn("refiner", move |ctx| {
        let exit_counter = exit_counter.clone();
        async move {
            let story = ctx.require_input("current_story")?.clone();
            let approved = ctx.require_str("critique")? == "APPROVED";
            if ctx.flag("loop.terminated") || !approved {
                return Ok(StepOutput { value: Some(story), signal: None });
            }
            exit_counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, WorkError>(StepOutput {
                value: Some(story),
                signal: Some(TerminationSignal::stop()),
            })
        }
    })
    .with_inputs(["current_story", "critique"])
    .with_optional_input("loop.terminated")
    .with_output_key("current_story");

    let node = LoopNode::new("StoryRefinementLoop", vec![critic.into(), gate.into()], 2)
        .unwrap()
        .with_marker_key("loop.terminated");
    let workflow = Workflow::new("story", node);
    let exec = executor();

    let first = exec
        .run(&workflow, SharedState::new().with("current_story", "draft"))
        .await
        .unwrap();
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert!(first.loop_report("StoryRefinementLoop").unwrap().outcome.by_signal());

    let replay = exec.run(&workflow, first.state.clone()).await.unwrap();
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert_eq!(replay.state.get("current_story"), Some(&Value::from("draft")));
}

/// Inner approval loop: the critic always approves and the gate exits once
/// per entry unless the marker is already set.
fn approval_loop(exits: Arc<AtomicUsize>, reset: bool) -> Composition {
    let critic = Step::from_fn("critic", |_ctx| async { Ok(StepOutput::value("APPROVED")) })
        .with_output_key("critique");
    let gate = Step::from_fn("gate", move |ctx| {
        let exits = exits.clone();
        async move {
            if ctx.flag("Refine.terminated") {
                return Ok(StepOutput::new());
            }
            exits.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::new().with_signal(TerminationSignal::stop()))
        }
    })
    .with_input("critique")
    .with_optional_input("Refine.terminated");

    let node = LoopNode::new("Refine", vec![critic.into(), gate.into()], 3).unwrap();
    if reset {
        node.with_marker_reset().into()
    } else {
        node.into()
    }
}

#[tokio::test]
async fn re_entered_loop_keeps_marker_by_default() {
    let exits = Arc::new(AtomicUsize::new(0));
    let outer = Composition::looped("Chapters", vec![approval_loop(exits.clone(), false)], 2).unwrap();

    let report = run(outer, SharedState::new()).await.unwrap();

    let inner: Vec<_> = report.loops.iter().filter(|l| l.node == "Refine").collect();
    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert!(inner[0].outcome.by_signal());
    assert_eq!(inner[1].outcome, LoopOutcome::TerminatedByCap);
}

#[tokio::test]
async fn marker_reset_lets_a_re_entered_loop_signal_again() {
    let exits = Arc::new(AtomicUsize::new(0));
    let outer = Composition::looped("Chapters", vec![approval_loop(exits.clone(), true)], 2).unwrap();

    let report = run(outer, SharedState::new()).await.unwrap();

    assert_eq!(exits.load(Ordering::SeqCst), 2);
    let inner: Vec<_> = report.loops.iter().filter(|l| l.node == "Refine").collect();
    assert_eq!(inner.len(), 2);
    assert!(inner.iter().all(|l| l.outcome.by_signal() && l.iterations == 1));
    assert!(report.state.flag("Refine.terminated"));
}

#[tokio::test]
async fn nested_loop_signal_does_not_end_outer_loop() {
    let outer_passes = Arc::new(AtomicUsize::new(0));
    let inner = Composition::looped(
        "Inner",
        vec![Step::from_fn("stopper", |_ctx| async {
            Ok(StepOutput::new().with_signal(TerminationSignal::stop()))
        })
        .into()],
        5,
    )
    .unwrap();

    let outer = Composition::looped(
        "Outer",
        vec![counting("tick", "tick", outer_passes.clone()).into(), inner],
        3,
    )
    .unwrap();

    let report = run(outer, SharedState::new()).await.unwrap();
    assert_eq!(outer_passes.load(Ordering::SeqCst), 3);
    assert_eq!(report.loop_report("Outer").unwrap().outcome, LoopOutcome::TerminatedByCap);
    assert_eq!(report.loops.iter().filter(|l| l.node == "Inner").count(), 3);
}

#[tokio::test]
async fn signal_from_parallel_sibling_ends_enclosing_loop() {
    let team = Composition::parallel(
        "Reviewers",
        vec![
            constant("style", "style_review", "ok", 0).into(),
            Step::from_fn("facts", |_ctx| async {
                Ok(StepOutput::value("verified").with_signal(TerminationSignal::stop()))
            })
            .with_output_key("fact_review")
            .into(),
        ],
    )
    .unwrap();

    let tree = Composition::looped("Review", vec![team], 3).unwrap();
    let report = run(tree, SharedState::new()).await.unwrap();

    let lp = report.loop_report("Review").unwrap();
    assert_eq!(lp.iterations, 1);
    assert!(lp.outcome.by_signal());
    assert!(report.state.flag("Review.terminated"));
    assert!(report.state.contains("style_review"));
}

#[tokio::test]
async fn branch_runs_the_selected_route() {
    let router = Step::from_fn("router", |_ctx| async { Ok(StepOutput::value("summarize")) })
        .with_output_key("route");

    let branch = BranchNode::new(
        "Dispatch",
        "route",
        vec![
            ("research".to_string(), constant("ResearchAgent", "research_findings", "facts", 0).into()),
            ("summarize".to_string(), constant("SummarizerAgent", "final_summary", "summary", 0).into()),
        ],
        None,
    )
    .unwrap();

    let tree = Composition::sequential("Coordinator", vec![router.into(), branch.into()]).unwrap();
    let report = run(tree, SharedState::new()).await.unwrap();

    assert_eq!(report.state.get("final_summary"), Some(&Value::from("summary")));
    assert!(!report.state.contains("research_findings"));
}

#[tokio::test]
async fn branch_rejects_non_string_route() {
    let branch = BranchNode::new(
        "Dispatch",
        "route",
        vec![("a".to_string(), constant("a", "a", "1", 0).into())],
        None,
    )
    .unwrap();

    let err = run(branch.into(), SharedState::new().with("route", true))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::InvalidRoute { ref actual, .. } if actual == "bool"));
}

#[tokio::test]
async fn cancelled_run_stops_before_next_step() {
    let ran = Arc::new(AtomicUsize::new(0));
    let exec = executor();
    let token = CancellationToken::new();
    token.cancel();

    let workflow = Workflow::new("cancelled", counting("first", "x", ran.clone()));
    let err = exec
        .run_with_cancellation(&workflow, SharedState::new(), token)
        .await
        .unwrap_err();

    assert!(matches!(err, FlowError::Cancelled { ref step } if step == "first"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_does_not_leak_into_later_runs() {
    let ran = Arc::new(AtomicUsize::new(0));
    let runtime = WeaveRuntime::new();
    let workflow = Workflow::new("ticker", counting("tick", "tick", ran.clone()));

    let token = CancellationToken::new();
    token.cancel();
    let cancelled = runtime
        .execute_with_cancellation(&workflow, SharedState::new(), token)
        .await;
    assert!(matches!(cancelled, Err(FlowError::Cancelled { .. })));

    let fresh = runtime.execute(&workflow, SharedState::new()).await.unwrap();
    assert_eq!(fresh.state.get("tick"), Some(&Value::from("pass 1")));

    let again = runtime
        .execute_with_cancellation(&workflow, SharedState::new(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.state.get("tick"), Some(&Value::from("pass 2")));
}

#[tokio::test]
async fn dropping_a_run_aborts_its_siblings() {
    let finished = Arc::new(AtomicUsize::new(0));
    let done = finished.clone();
    let slow = Step::from_fn("slow", move |_ctx| {
        let done = done.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            done.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutput::value("late"))
        }
    })
    .with_output_key("slow");

    let tree = Composition::parallel(
        "Team",
        vec![slow.into(), constant("fast", "fast", "ok", 0).into()],
    )
    .unwrap();
    let workflow = Workflow::new("dropped", tree);
    let exec = executor();

    let timed_out =
        tokio::time::timeout(Duration::from_millis(50), exec.run(&workflow, SharedState::new()))
            .await;
    assert!(timed_out.is_err());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn loop_outcome_is_published_as_event() {
    let (sender, mut events) = broadcast::channel(256);
    let exec = Executor::new(sender);

    let tree = Composition::looped(
        "Capped",
        vec![counting("tick", "tick", Arc::new(AtomicUsize::new(0))).into()],
        2,
    )
    .unwrap();
    exec.run(&Workflow::new("events", tree), SharedState::new())
        .await
        .unwrap();

    let mut finished = None;
    let mut iterations = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ExecutionEvent::LoopIteration { .. } => iterations += 1,
            ExecutionEvent::LoopFinished { outcome, iterations, .. } => {
                finished = Some((outcome, iterations))
            }
            _ => {}
        }
    }

    assert_eq!(iterations, 2);
    assert_eq!(finished, Some((LoopOutcome::TerminatedByCap, 2)));
}
