mod common;

use std::sync::Arc;

use common::{fast_config, registry, text, ScriptedLlm, TWO_NODE_PLAN};
use taskflow::config::ExecutionMode;
use taskflow::{Agent, AgentStatus, StopReason, TaskConfig, TaskEngine};

const PARALLEL_PLAN: &str = r#"<root>
  <name>Compare vendors</name>
  <agents>
    <agent name="Writer" id="0" dependsOn=""><task>Summarize vendor A</task></agent>
    <agent name="Writer" id="1" dependsOn=""><task>Summarize vendor B</task></agent>
    <agent name="Writer" id="2" dependsOn="0,1"><task>Compare both</task></agent>
  </agents>
</root>"#;

fn engine(config: TaskConfig, llm: Arc<ScriptedLlm>) -> TaskEngine {
    TaskEngine::new(config, registry(llm)).with_agent(Agent::new("Writer", "Writes documents"))
}

#[tokio::test]
async fn run_plans_and_executes_every_node() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![text(TWO_NODE_PLAN), text("42 figures"), text("final report")]);
    let engine = engine(fast_config(), llm.clone());

    let result = engine.run("weekly report").await?;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.stop_reason, StopReason::Done);
    assert_eq!(result.result, "final report");

    let task = engine.task(&result.task_id).expect("task is kept");
    let workflow = task.workflow_snapshot().expect("workflow");
    assert!(workflow.agents.iter().all(|a| a.status == AgentStatus::Done));

    // 第二个节点能看到第一个节点的结果
    let second = &llm.requests()[2].messages[1];
    assert!(second.text().contains("42 figures"));
    Ok(())
}

#[tokio::test]
async fn generate_then_execute_by_id() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![text(TWO_NODE_PLAN), text("a"), text("b")]);
    let engine = engine(fast_config(), llm);

    let workflow = engine.generate("weekly report", Some("fixed-id".into())).await?;
    assert_eq!(workflow.agents[0].id, "fixed-id-00");

    let result = engine.execute("fixed-id").await?;
    assert!(result.success);
    assert_eq!(result.result, "b");
    assert!(engine.delete_task("fixed-id"));
    assert!(engine.task("fixed-id").is_none());
    Ok(())
}

#[tokio::test]
async fn aborted_task_reports_abort() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![text(TWO_NODE_PLAN)]);
    let engine = engine(fast_config(), llm);

    engine.generate("weekly report", Some("t-abort".into())).await?;
    assert!(engine.abort_task("t-abort").await);
    let result = engine.execute("t-abort").await?;

    assert!(!result.success);
    assert_eq!(result.stop_reason, StopReason::Abort);
    assert!(!engine.abort_task("missing").await);
    Ok(())
}

#[tokio::test]
async fn planning_failure_is_a_failed_result() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new((0..4).map(|_| text("no plan")).collect());
    let engine = engine(fast_config(), llm);

    let result = engine.run("weekly report").await?;

    assert!(!result.success);
    assert_eq!(result.stop_reason, StopReason::Error);
    assert!(result.error.unwrap_or_default().contains("planning failed"));
    Ok(())
}

#[tokio::test]
async fn unknown_agent_fails_the_task() -> anyhow::Result<()> {
    let plan = TWO_NODE_PLAN.replace("Writer", "Browser");
    let llm = ScriptedLlm::new(vec![text(&plan)]);
    let engine = engine(fast_config(), llm);

    let result = engine.run("weekly report").await?;

    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("Browser"));
    Ok(())
}

#[tokio::test]
async fn independent_nodes_run_in_parallel_mode() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![text(PARALLEL_PLAN), text("A"), text("B"), text("comparison")]);
    let config = TaskConfig {
        agent_parallel: true,
        ..fast_config()
    };
    let engine = engine(config, llm.clone());

    let result = engine.run("compare").await?;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, "comparison");
    let last = &llm.requests()[3].messages[1];
    assert!(last.text().contains("<currentTask>Compare both</currentTask>"));
    Ok(())
}

#[tokio::test]
async fn expert_mode_checks_for_replan_between_nodes() -> anyhow::Result<()> {
    // 规划、节点一、完成度检查、重规划检查、节点二、完成度检查
    let llm = ScriptedLlm::new(vec![
        text(TWO_NODE_PLAN),
        text("42 figures"),
        text("not a gate call"),
        text("no replan needed"),
        text("final report"),
        text("not a gate call"),
    ]);
    let config = TaskConfig {
        mode: ExecutionMode::Expert,
        ..fast_config()
    };
    let engine = engine(config, llm.clone());

    let result = engine.run("weekly report").await?;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, "final report");
    assert_eq!(llm.remaining(), 0);
    Ok(())
}

#[tokio::test]
async fn intervention_requires_known_task() {
    let engine = engine(fast_config(), ScriptedLlm::new(vec![]));
    assert!(!engine.intervene("nope", "stop"));
}
