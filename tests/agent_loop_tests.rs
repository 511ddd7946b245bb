mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use common::{fast_config, node, task, text, tool_call, tool_calls, ScriptedLlm};
use taskflow::agent::UNFINISHED_RESULT;
use taskflow::config::ExecutionMode;
use taskflow::llm::ToolChoice;
use taskflow::message::{ToolCallPart, ToolResultOutput};
use taskflow::state::AgentContext;
use taskflow::{Agent, ContentPart, Role, TaskFlowError, Tool, ToolResult};

struct CountingTool {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "count"
    }

    fn description(&self) -> &str {
        "Increase a counter"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"step": {"type": "integer"}}})
    }

    async fn execute(&self, args: Value, _ctx: &AgentContext, _call: &ToolCallPart) -> taskflow::Result<ToolResult> {
        let step = args["step"].as_u64().unwrap_or(1) as u32;
        let total = self.calls.fetch_add(step, Ordering::SeqCst) + step;
        Ok(ToolResult::text(format!("counter = {total}")))
    }
}

struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _args: Value, _ctx: &AgentContext, _call: &ToolCallPart) -> taskflow::Result<ToolResult> {
        Err(TaskFlowError::ToolExecution {
            tool: "flaky".into(),
            message: "service unavailable".into(),
        })
    }
}

struct StopTool;

#[async_trait]
impl Tool for StopTool {
    fn name(&self) -> &str {
        "stop"
    }

    fn description(&self) -> &str {
        "Stop the agent with a result"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"result": {"type": "string"}}})
    }

    async fn execute(&self, args: Value, ctx: &AgentContext, _call: &ToolCallPart) -> taskflow::Result<ToolResult> {
        ctx.variables.set("forceStop", args["result"].clone()).await?;
        Ok(ToolResult::text("stopping"))
    }
}

/// 按参数休眠，记录开始与结束顺序
struct SleepTool {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep for a number of milliseconds"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {"ms": {"type": "integer"}}})
    }

    async fn execute(&self, args: Value, _ctx: &AgentContext, call: &ToolCallPart) -> taskflow::Result<ToolResult> {
        let ms = args["ms"].as_u64().unwrap_or(0);
        self.log.lock().push(format!("start {}", call.tool_call_id));
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.log.lock().push(format!("end {}", call.tool_call_id));
        Ok(ToolResult::text(format!("slept {ms}")))
    }
}

fn counting_agent(calls: Arc<AtomicU32>) -> Arc<Agent> {
    Arc::new(Agent::new("Writer", "Writes things").with_tool(Arc::new(CountingTool { calls })))
}

#[tokio::test]
async fn text_only_turn_finishes_node() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![text("all done")]);
    let agent = counting_agent(Arc::new(AtomicU32::new(0)));
    let task = task("t1", fast_config(), llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t1", 0, "Writer", "write a poem")).await?;

    assert_eq!(result, "all done");
    let chain = task.chain.read();
    let record = chain.latest_for_node("t1-00").expect("chain record");
    assert_eq!(record.result.as_deref(), Some("all done"));
    let request = record.request.as_ref().expect("recorded request");
    assert_eq!(request.messages[0].role, Role::System);
    assert!(request.messages[1].text().contains("<currentTask>write a poem</currentTask>"));
    Ok(())
}

#[tokio::test]
async fn tool_results_are_fed_back_in_order() -> anyhow::Result<()> {
    let calls = Arc::new(AtomicU32::new(0));
    let llm = ScriptedLlm::new(vec![
        tool_call("c1", "count", json!({"step": 2})),
        tool_call("c2", "count", json!({"step": 3})),
        text("counted to five"),
    ]);
    let agent = counting_agent(calls.clone());
    let task = task("t2", fast_config(), llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t2", 0, "Writer", "count")).await?;

    assert_eq!(result, "counted to five");
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let requests = llm.requests();
    assert_eq!(requests.len(), 3);
    let last = &requests[2].messages;
    let roles: Vec<Role> = last.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::Tool]
    );
    match &last[5].content[0] {
        ContentPart::ToolResult(part) => {
            assert_eq!(part.tool_call_id, "c2");
            assert_eq!(part.output, ToolResultOutput::Text("counter = 5".into()));
        }
        other => panic!("unexpected part {other:?}"),
    }

    let chain = task.chain.read();
    let record = chain.latest_for_node("t2-00").expect("chain record");
    assert_eq!(record.tools.len(), 2);
    assert_eq!(record.tools[1].params, json!({"step": 3}));
    Ok(())
}

#[tokio::test]
async fn tenth_consecutive_tool_failure_aborts_node() {
    let responses = (0..12)
        .map(|i| tool_call(&format!("c{i}"), "flaky", json!({})))
        .collect();
    let llm = ScriptedLlm::new(responses);
    let agent = Arc::new(Agent::new("Writer", "Writes things").with_tool(Arc::new(FailingTool)));
    let task = task("t3", fast_config(), llm.clone(), vec![agent.clone()]);

    let err = agent
        .run(&task, &node("t3", 0, "Writer", "try"))
        .await
        .expect_err("node must fail");

    match err {
        TaskFlowError::ConsecutiveToolFailures { count, last_error } => {
            assert_eq!(count, 10);
            assert!(last_error.contains("service unavailable"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(llm.requests().len(), 10);
}

#[tokio::test]
async fn failed_tool_becomes_error_result() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![tool_call("c1", "flaky", json!({})), text("gave up politely")]);
    let agent = Arc::new(Agent::new("Writer", "Writes things").with_tool(Arc::new(FailingTool)));
    let task = task("t4", fast_config(), llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t4", 0, "Writer", "try")).await?;

    assert_eq!(result, "gave up politely");
    let requests = llm.requests();
    let tool_message = requests[1].messages.last().expect("tool message");
    match &tool_message.content[0] {
        ContentPart::ToolResult(part) => {
            assert!(matches!(&part.output, ToolResultOutput::ErrorText(text) if text.contains("service unavailable")));
        }
        other => panic!("unexpected part {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn exhausted_budget_returns_unfinished() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![
        tool_call("c1", "count", json!({})),
        tool_call("c2", "count", json!({})),
        text("never reached"),
    ]);
    let agent = counting_agent(Arc::new(AtomicU32::new(0)));
    let config = taskflow::TaskConfig {
        max_react_num: 2,
        ..fast_config()
    };
    let task = task("t5", config, llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t5", 0, "Writer", "loop")).await?;

    assert_eq!(result, UNFINISHED_RESULT);
    assert_eq!(llm.remaining(), 1);
    Ok(())
}

#[tokio::test]
async fn force_stop_variable_ends_loop() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![
        tool_call("c1", "stop", json!({"result": "stopped early"})),
        text("ignored"),
        text("ignored"),
    ]);
    let agent = Arc::new(Agent::new("Writer", "Writes things").with_tool(Arc::new(StopTool)));
    let task = task("t6", fast_config(), llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t6", 0, "Writer", "stop")).await?;

    assert_eq!(result, "stopped early");
    assert_eq!(llm.requests().len(), 2);
    Ok(())
}

#[tokio::test]
async fn user_intervention_is_injected_before_next_call() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![text("adjusted")]);
    let agent = counting_agent(Arc::new(AtomicU32::new(0)));
    let task = task("t7", fast_config(), llm.clone(), vec![agent.clone()]);
    task.push_conversation("use metric units");

    agent.run(&task, &node("t7", 0, "Writer", "write")).await?;

    let requests = llm.requests();
    let last = requests[0].messages.last().expect("intervention message");
    assert_eq!(last.role, Role::User);
    assert!(last.text().ends_with("\n- use metric units"));
    assert!(task.take_conversation().is_empty());
    Ok(())
}

#[tokio::test]
async fn expert_mode_reopens_incomplete_node_once() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![
        text("half done"),
        tool_call(
            "g1",
            "task_result_check",
            json!({"thought": "export missing", "completionStatus": "incomplete", "todoList": "export the csv"}),
        ),
        text("all done"),
    ]);
    let agent = counting_agent(Arc::new(AtomicU32::new(0)));
    let config = taskflow::TaskConfig {
        mode: ExecutionMode::Expert,
        ..fast_config()
    };
    let task = task("t8", config, llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t8", 0, "Writer", "report")).await?;

    assert_eq!(result, "all done");
    let requests = llm.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].tool_choice.as_ref().is_some_and(|choice| choice.is_forced()));
    let nudged = requests[2].messages.last().expect("nudge");
    assert!(nudged
        .text()
        .starts_with("It seems that your task has not been fully completed."));
    assert!(nudged.text().ends_with("export the csv"));
    Ok(())
}

#[tokio::test]
async fn broken_completion_check_counts_as_completed() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![text("done"), text("no tool call here")]);
    let agent = counting_agent(Arc::new(AtomicU32::new(0)));
    let config = taskflow::TaskConfig {
        mode: ExecutionMode::Expert,
        ..fast_config()
    };
    let task = task("t9", config, llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t9", 0, "Writer", "report")).await?;

    assert_eq!(result, "done");
    assert_eq!(llm.requests().len(), 2);
    Ok(())
}

#[tokio::test]
async fn successful_tool_call_resets_failure_counter() -> anyhow::Result<()> {
    let mut responses: Vec<_> = (0..9)
        .map(|i| tool_call(&format!("a{i}"), "flaky", json!({})))
        .collect();
    responses.push(tool_call("ok", "count", json!({})));
    responses.extend((0..9).map(|i| tool_call(&format!("b{i}"), "flaky", json!({}))));
    responses.push(text("done"));
    let llm = ScriptedLlm::new(responses);
    let calls = Arc::new(AtomicU32::new(0));
    let agent = Arc::new(
        Agent::new("Writer", "Writes things")
            .with_tool(Arc::new(FailingTool))
            .with_tool(Arc::new(CountingTool { calls: calls.clone() })),
    );
    let task = task("t10", fast_config(), llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t10", 0, "Writer", "retry")).await?;

    assert_eq!(result, "done");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(llm.requests().len(), 20);
    Ok(())
}

async fn run_sleepers(parallel: bool) -> anyhow::Result<(Vec<String>, Duration, Arc<ScriptedLlm>, Arc<taskflow::TaskContext>)> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let llm = ScriptedLlm::new(vec![
        tool_calls(&[("s1", "sleep", json!({"ms": 80})), ("s2", "sleep", json!({"ms": 5}))]),
        text("rested"),
    ]);
    let agent = Arc::new(Agent::new("Writer", "Writes things").with_tool(Arc::new(SleepTool { log: log.clone() })));
    let config = taskflow::TaskConfig {
        parallel_tool_calls: parallel,
        ..fast_config()
    };
    let task = task("t11", config, llm.clone(), vec![agent.clone()]);

    let started = tokio::time::Instant::now();
    let result = agent.run(&task, &node("t11", 0, "Writer", "rest")).await?;
    let elapsed = started.elapsed();

    assert_eq!(result, "rested");
    let log = log.lock().clone();
    Ok((log, elapsed, llm, task))
}

fn tool_message_ids(llm: &ScriptedLlm) -> Vec<String> {
    let requests = llm.requests();
    let tool_message = requests[1].messages.last().expect("tool message");
    assert_eq!(tool_message.role, Role::Tool);
    tool_message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolResult(result) => Some(result.tool_call_id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn parallel_tool_calls_keep_call_order() -> anyhow::Result<()> {
    let (log, elapsed, llm, task) = run_sleepers(true).await?;

    assert_eq!(log, vec!["start s1", "start s2", "end s2", "end s1"]);
    assert!(elapsed >= Duration::from_millis(80));
    assert!(elapsed < Duration::from_millis(85));

    let chain = task.chain.read();
    let record = chain.latest_for_node("t11-00").expect("chain record");
    let slots: Vec<_> = record
        .tools
        .iter()
        .map(|tool| {
            (
                tool.tool_call_id.clone(),
                tool.result.as_ref().map(|result| result.text_content()).unwrap_or_default(),
            )
        })
        .collect();
    assert_eq!(
        slots,
        vec![("s1".to_string(), "slept 80".to_string()), ("s2".to_string(), "slept 5".to_string())]
    );
    assert_eq!(tool_message_ids(&llm), vec!["s1", "s2"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sequential_tool_calls_when_parallel_disabled() -> anyhow::Result<()> {
    let (log, elapsed, llm, _task) = run_sleepers(false).await?;

    assert_eq!(log, vec!["start s1", "end s1", "start s2", "end s2"]);
    assert!(elapsed >= Duration::from_millis(85));
    assert_eq!(tool_message_ids(&llm), vec!["s1", "s2"]);
    Ok(())
}

fn expert_todo_config() -> taskflow::TaskConfig {
    taskflow::TaskConfig {
        mode: ExecutionMode::Expert,
        expert_mode_todo_loop_num: 2,
        ..fast_config()
    }
}

#[tokio::test]
async fn todo_list_is_reconciled_every_configured_tool_turns() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![
        tool_call("c1", "count", json!({})),
        tool_call("c2", "count", json!({})),
        tool_call(
            "td1",
            "todo_list_manager",
            json!({"completedList": ["count twice"], "todoList": ["write the summary"], "loopDetection": "no_loop"}),
        ),
        text("final"),
        tool_call("g1", "task_result_check", json!({"thought": "ok", "completionStatus": "completed"})),
    ]);
    let agent = counting_agent(Arc::new(AtomicU32::new(0)));
    let task = task("t12", expert_todo_config(), llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t12", 0, "Writer", "count and summarize")).await?;

    assert_eq!(result, "final");
    let requests = llm.requests();
    assert_eq!(requests.len(), 5);
    assert!(requests[0].tool_choice.is_none());
    assert!(requests[1].tool_choice.is_none());
    assert_eq!(requests[2].tool_choice, Some(ToolChoice::tool("todo_list_manager")));
    let names: Vec<_> = requests[2].tools.iter().map(|tool| tool.name.as_str()).collect();
    assert_eq!(names, vec!["count", "todo_list_manager"]);

    let status = requests[3].messages.last().expect("todo status message");
    assert_eq!(status.role, Role::User);
    assert!(status.text().starts_with("# Task Execution Status"));
    assert!(status.text().contains("- write the summary"));
    assert_eq!(requests[4].tool_choice, Some(ToolChoice::tool("task_result_check")));
    Ok(())
}

#[tokio::test]
async fn failed_todo_reconciliation_leaves_conversation_untouched() -> anyhow::Result<()> {
    let llm = ScriptedLlm::new(vec![
        tool_call("c1", "count", json!({})),
        tool_call("c2", "count", json!({})),
        text("no tool call here"),
        text("final"),
        text("no check either"),
    ]);
    let agent = counting_agent(Arc::new(AtomicU32::new(0)));
    let task = task("t13", expert_todo_config(), llm.clone(), vec![agent.clone()]);

    let result = agent.run(&task, &node("t13", 0, "Writer", "count")).await?;

    assert_eq!(result, "final");
    let requests = llm.requests();
    assert_eq!(requests.len(), 5);
    assert_eq!(requests[2].messages.len(), 7);
    assert_eq!(requests[3].messages.len(), 6);
    assert_eq!(requests[3].messages.last().map(|m| m.role), Some(Role::Tool));
    Ok(())
}
