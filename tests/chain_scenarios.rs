use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use skillchain_core::error::SkillchainError;
use skillchain_core::event::EventBus;
use skillchain_core::traits::Skill;
use skillchain_core::types::{ChainEvent, EdgeRef, RunStatus};
use skillchain_engine::{plan, ChainDefinition, Engine, RunOptions};
use skillchain_skills::SkillRegistry;
use skillchain_test_utils::{fixtures, outputs, MockSkill};

fn engine(skills: Vec<MockSkill>) -> Engine {
    let registry = SkillRegistry::new();
    for skill in skills {
        let name = skill.name().to_string();
        registry.register(&name, Arc::new(skill)).unwrap();
    }
    Engine::new(Arc::new(registry))
}

fn int(inputs: &HashMap<String, Value>, key: &str) -> i64 {
    inputs[key].as_i64().unwrap()
}

fn increment() -> MockSkill {
    MockSkill::new("test.increment")
        .with_inputs(&["value"])
        .with_outputs(&["value"])
        .returning(|inputs, _| Ok(outputs([("value", json!(int(inputs, "value") + 1))])))
}

fn diamond_skills(b_delay: u64, c_delay: u64) -> Vec<MockSkill> {
    vec![
        MockSkill::new("test.seed")
            .with_outputs(&["value"])
            .returning(|_, _| Ok(outputs([("value", json!(5))]))),
        MockSkill::new("test.add_two")
            .with_inputs(&["value"])
            .with_outputs(&["b_out"])
            .with_delay_ms(b_delay)
            .returning(|inputs, _| Ok(outputs([("b_out", json!(int(inputs, "value") + 2))]))),
        MockSkill::new("test.triple")
            .with_inputs(&["value"])
            .with_outputs(&["c_out"])
            .with_delay_ms(c_delay)
            .returning(|inputs, _| Ok(outputs([("c_out", json!(int(inputs, "value") * 3))]))),
        MockSkill::new("test.sum")
            .with_inputs(&["b_out", "c_out"])
            .with_outputs(&["sum"])
            .returning(|inputs, _| {
                Ok(outputs([("sum", json!(int(inputs, "b_out") + int(inputs, "c_out")))]))
            }),
    ]
}

/// `test.validate` reporting `valid` once the attempt reaches `valid_from`.
fn extract_validate(valid_from: Option<u32>) -> Vec<MockSkill> {
    vec![
        MockSkill::new("test.extract")
            .with_inputs(&["text"])
            .with_optional_inputs(&["feedback"])
            .with_outputs(&["terms"])
            .returning(|_, attempt| Ok(outputs([("terms", json!([format!("term-{}", attempt)]))]))),
        MockSkill::new("test.validate")
            .with_inputs(&["terms"])
            .with_outputs(&["valid", "feedback"])
            .returning(move |_, attempt| {
                let valid = valid_from.is_some_and(|n| attempt >= n);
                Ok(outputs([
                    ("valid", json!(valid)),
                    ("feedback", json!(format!("attempt {} rejected", attempt))),
                ]))
            }),
    ]
}

fn text_input() -> HashMap<String, Value> {
    HashMap::from([("text".to_string(), json!("syngas from coal"))])
}

#[tokio::test]
async fn linear_chain_increments_value() {
    let chain = ChainDefinition::from_toml_str(fixtures::LINEAR_CHAIN).unwrap();
    let result = engine(vec![increment()])
        .run(&chain, HashMap::from([("value".to_string(), json!(0))]), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.final_context["value"], json!(3));
    assert_eq!(result.history.len(), 3);
    assert!(result.history.iter().all(|r| r.attempt == 1 && r.succeeded()));
}

#[tokio::test]
async fn diamond_chain_joins_branches() {
    let chain = ChainDefinition::from_toml_str(fixtures::DIAMOND_CHAIN).unwrap();
    let result = engine(diamond_skills(0, 0))
        .run(&chain, HashMap::new(), RunOptions::default())
        .await
        .unwrap();

    assert!(result.succeeded());
    assert_eq!(result.final_context["b_out"], json!(7));
    assert_eq!(result.final_context["c_out"], json!(15));
    assert_eq!(result.final_context["sum"], json!(22));
    assert_eq!(result.history.last().unwrap().node_id, "d");
}

#[tokio::test]
async fn feedback_loop_converges() {
    let chain = ChainDefinition::from_toml_str(fixtures::FEEDBACK_CHAIN).unwrap();
    let result = engine(extract_validate(Some(3)))
        .run(&chain, text_input(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    let attempts: Vec<u32> = result.records_for("extract").map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(result.exhausted_edges.is_empty());
    assert_eq!(result.final_context["valid"], json!(true));
    assert_eq!(result.final_context["extract.terms"], json!(["term-3"]));
}

#[tokio::test]
async fn feedback_loop_exhausts() {
    let chain = ChainDefinition::from_toml_str(fixtures::FEEDBACK_CHAIN).unwrap();
    let bus = Arc::new(EventBus::new(256));
    let mut rx = bus.subscribe();
    let result = engine(extract_validate(None))
        .with_event_bus(bus)
        .run(&chain, text_input(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::LoopExhausted);
    assert_eq!(result.records_for("extract").count(), 4);
    assert_eq!(result.records_for("validate").count(), 4);
    assert_eq!(
        result.exhausted_edges,
        vec![EdgeRef {
            from: "validate".into(),
            to: "extract".into()
        }]
    );
    assert!(result.failure.is_none());

    let mut reentries = 0;
    while let Ok(event) = rx.try_recv() {
        if let ChainEvent::FeedbackTriggered { iteration, .. } = event {
            reentries += 1;
            assert_eq!(iteration, reentries);
        }
    }
    assert_eq!(reentries, 3);
}

#[tokio::test]
async fn unknown_skill_fails_before_any_node_runs() {
    let chain = ChainDefinition::from_toml_str(
        r#"
chain_name = "broken"
graph_type = "DAG"
inputs = ["value"]

[[nodes]]
id = "first"
skill = "test.increment"
inputs = { value = "value" }
outputs = { value = "value" }

[[nodes]]
id = "second"
skill = "no.such.skill"

[[edges]]
from = "first"
to = "second"
"#,
    )
    .unwrap();

    let inc = increment();
    let calls = inc.call_counter();
    let err = engine(vec![inc])
        .run(&chain, HashMap::from([("value".to_string(), json!(0))]), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SkillchainError::SkillNotFound(ref id) if id == "no.such.skill"));
    assert_eq!(err.code(), "not_found");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn phase_members_run_concurrently() {
    let chain = ChainDefinition::from_toml_str(fixtures::DIAMOND_CHAIN).unwrap();
    let result = engine(diamond_skills(100, 150))
        .run(&chain, HashMap::new(), RunOptions::default())
        .await
        .unwrap();

    assert!(result.succeeded());
    // closer to max(100, 150) than to 100 + 150
    assert!(result.elapsed_ms < 200, "took {}ms", result.elapsed_ms);
}

#[test]
fn depends_on_precedes_dependents() {
    let chain = ChainDefinition::from_toml_str(
        r#"
chain_name = "deps"
graph_type = "DAG"

[[nodes]]
id = "report"
skill = "test.noop"
depends_on = ["load", "clean"]

[[nodes]]
id = "clean"
skill = "test.noop"
depends_on = ["load"]

[[nodes]]
id = "load"
skill = "test.noop"

[[nodes]]
id = "audit"
skill = "test.noop"
depends_on = ["load"]
"#,
    )
    .unwrap();
    let plan = plan(&chain).unwrap();

    for node in chain.nodes() {
        let phase = plan.phase_of(&node.id).unwrap();
        for dep in &node.depends_on {
            assert!(plan.phase_of(dep).unwrap() < phase, "{} before {}", dep, node.id);
        }
    }
    assert_eq!(plan.phases, vec![vec!["load"], vec!["audit", "clean"], vec!["report"]]);
}

#[tokio::test]
async fn reruns_produce_identical_history() {
    let chain = ChainDefinition::from_toml_str(fixtures::FEEDBACK_CHAIN).unwrap();
    let engine = engine(extract_validate(Some(2)));

    let mut runs = Vec::new();
    for _ in 0..3 {
        let result = engine
            .run(&chain, text_input(), RunOptions::default())
            .await
            .unwrap();
        let seq: Vec<(String, u32, bool)> = result
            .history
            .iter()
            .map(|r| (r.node_id.clone(), r.attempt, r.succeeded()))
            .collect();
        runs.push((seq, result.final_context));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[test]
fn cycles_are_rejected_by_graph_type() {
    let cyclic = |graph_type: &str, bound: &str| {
        format!(
            r#"
chain_name = "loop"
graph_type = "{graph_type}"

[[nodes]]
id = "a"
skill = "test.noop"

[[nodes]]
id = "b"
skill = "test.noop"

[[edges]]
from = "a"
to = "b"

[[edges]]
from = "b"
to = "a"
{bound}
"#
        )
    };

    let err = ChainDefinition::from_toml_str(&cyclic("DCG", "")).unwrap_err();
    assert!(matches!(err, SkillchainError::UnboundedCycle(_)));

    let err = ChainDefinition::from_toml_str(&cyclic("DAG", "max_iterations = 2")).unwrap_err();
    assert!(matches!(err, SkillchainError::UnexpectedCycle(_)));

    assert!(ChainDefinition::from_toml_str(&cyclic("DCG", "max_iterations = 2")).is_ok());
}

#[tokio::test]
async fn feedback_bound_limits_reentries() {
    for bound in 1..=4u32 {
        let raw = fixtures::FEEDBACK_CHAIN.replace("max_iterations = 3", &format!("max_iterations = {}", bound));
        let chain = ChainDefinition::from_toml_str(&raw).unwrap();
        let result = engine(extract_validate(None))
            .run(&chain, text_input(), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, RunStatus::LoopExhausted);
        // one initial run plus at most `bound` re-entries
        assert_eq!(result.records_for("extract").count() as u32, bound + 1);
    }
}

#[tokio::test]
async fn phase_siblings_do_not_see_each_other() {
    let chain = ChainDefinition::from_toml_str(
        r#"
chain_name = "isolation"
graph_type = "DAG"
inputs = ["shared"]

[[nodes]]
id = "left"
skill = "test.swap"
inputs = { value = "shared" }
outputs = { value = "shared" }

[[nodes]]
id = "right"
skill = "test.swap"
inputs = { value = "shared" }
outputs = { value = "right_saw" }
"#,
    )
    .unwrap();

    let swap = MockSkill::new("test.swap")
        .with_inputs(&["value"])
        .with_outputs(&["value"])
        .with_delay_ms(20)
        .returning(|inputs, _| {
            let seen = inputs["value"].as_str().unwrap_or_default();
            Ok(outputs([("value", json!(format!("{}+", seen)))]))
        });
    let seen = swap.inputs_log();

    let result = engine(vec![swap])
        .run(
            &chain,
            HashMap::from([("shared".to_string(), json!("v0"))]),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(result.succeeded());
    assert!(seen.lock().unwrap().iter().all(|i| i["value"] == json!("v0")));
    assert_eq!(result.final_context["shared"], json!("v0+"));
    assert_eq!(result.final_context["right_saw"], json!("v0+"));
}

#[tokio::test]
async fn json_chain_runs_with_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("count.json");
    std::fs::write(
        &path,
        r#"{
  "chain_name": "count",
  "graph_type": "DCG",
  "inputs": ["value"],
  "nodes": [
    {
      "id": "inc",
      "skill": "builtin.counter.increment",
      "inputs": {"value": "value"},
      "outputs": {"value": "value"}
    }
  ],
  "edges": [
    {"from": "inc", "to": "inc", "condition": "value < 5", "max_iterations": 10}
  ]
}"#,
    )
    .unwrap();

    let chain = skillchain_engine::parse_file(&path).unwrap();
    let engine = Engine::new(Arc::new(SkillRegistry::with_builtins()));
    let result = engine
        .run(&chain, HashMap::from([("value".to_string(), json!(0))]), RunOptions::default())
        .await
        .unwrap();

    assert!(result.succeeded());
    assert_eq!(result.final_context["value"], json!(5));
    assert_eq!(result.records_for("inc").count(), 5);
}
