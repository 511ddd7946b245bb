use std::fmt::Write;

use super::Agent;
use crate::state::AgentContext;
use crate::tools::ToolRegistry;
use crate::utils::sub;

const DEPENDENT_RESULT_MAX_CHARS: usize = 2000;

pub fn agent_system_prompt(agent: &Agent, ctx: &AgentContext, tools: &ToolRegistry) -> String {
    let mut prompt = format!(
        "You are {}, an autonomous AI agent for {}.\n\n# Agent Description\n{}\n",
        agent.name, ctx.task.config.name, agent.description
    );
    if let Some(ext) = agent.ext_sys_prompt.as_deref().filter(|ext| !ext.trim().is_empty()) {
        let _ = write!(prompt, "\n{}\n", ext.trim());
    }
    prompt.push_str(
        "\n# User input task instructions\n\
<root>\n  <!-- Main task, completed through the collaboration of multiple Agents -->\n  <mainTask>main task</mainTask>\n  \
<!-- Results of the tasks this task depends on -->\n  <preTaskResult>...</preTaskResult>\n  \
<!-- The tasks that the current agent needs to complete, the current agent only needs to complete the currentTask -->\n  \
<currentTask>specific task</currentTask>\n  <!-- Complete the corresponding step nodes of the task, only for reference -->\n  \
<nodes>...</nodes>\n</root>\n",
    );
    if !tools.is_empty() {
        let _ = write!(prompt, "\n# Available tools\n{}\n", tools.names().join(", "));
    }
    let _ = write!(
        prompt,
        "\nThe current platform is {}. Complete only the currentTask, call tools when needed, \
and reply with the final result as plain text when the task is finished.",
        ctx.task.config.platform
    );
    prompt
}

/// 依赖节点的最近一次结果
fn dependent_results(ctx: &AgentContext) -> String {
    let chain = ctx.task.chain.read();
    ctx.node
        .depends_on
        .iter()
        .filter_map(|dep| {
            let record = chain.latest_for_node(dep)?;
            let result = record.result.as_deref()?;
            Some(format!(
                "<{0}Result>{1}</{0}Result>",
                record.agent_name,
                sub(result, DEPENDENT_RESULT_MAX_CHARS, true)
            ))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn agent_user_prompt(_agent: &Agent, ctx: &AgentContext) -> String {
    let task_prompt = ctx.task.chain.read().task_prompt.clone();
    let mut prompt = format!("<root>\n  <mainTask>{task_prompt}</mainTask>\n");
    let dependent = dependent_results(ctx);
    if !dependent.is_empty() {
        let _ = writeln!(prompt, "  <preTaskResult>\n{dependent}\n  </preTaskResult>");
    }
    let _ = writeln!(prompt, "  <currentTask>{}</currentTask>", ctx.node.task);
    if !ctx.node.xml.trim().is_empty() {
        let _ = writeln!(prompt, "  <nodes>\n{}\n  </nodes>", ctx.node.xml.trim());
    }
    prompt.push_str("</root>");
    prompt
}

/// 用户在执行中途追加的指令
pub fn intervention_prompt(instructions: &[String]) -> String {
    let mut prompt =
        "The user is intervening in the current task, please replan and execute according to the following instructions:"
            .to_string();
    for instruction in instructions {
        let _ = write!(prompt, "\n- {}", instruction.trim());
    }
    prompt
}
