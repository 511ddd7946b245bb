use std::fmt::Write;

use crate::state::TaskContext;
use crate::tools::VARIABLE_STORAGE_TOOL;

const PLAN_FORMAT: &str = r#"<root>
  <name>short task name</name>
  <thought>your reasoning about how to split the task</thought>
  <agents>
    <agent name="AgentName" id="0" dependsOn="">
      <task>what this agent must accomplish</task>
      <nodes>
        <node>step</node>
        <node output="variableName">step that stores its result in a variable</node>
      </nodes>
    </agent>
    <agent name="AgentName" id="1" dependsOn="0">
      <task>a later subtask that needs the result of agent 0</task>
      <nodes>
        <node input="variableName">step that reads the variable</node>
      </nodes>
    </agent>
  </agents>
</root>"#;

pub fn plan_system_prompt(task: &TaskContext) -> String {
    let mut agents = String::new();
    for agent in &task.agents {
        let description = agent.plan_description.as_deref().unwrap_or(&agent.description);
        let _ = writeln!(agents, "<agent name=\"{}\">", agent.name);
        let _ = writeln!(agents, "<description>{}</description>", description.trim());
        let tools: Vec<&str> = agent
            .tools
            .iter()
            .map(|tool| tool.name())
            .filter(|name| *name != VARIABLE_STORAGE_TOOL)
            .collect();
        if !tools.is_empty() {
            let _ = writeln!(agents, "<tools>{}</tools>", tools.join(", "));
        }
        agents.push_str("</agent>\n");
    }

    format!(
        "You are {name}, an autonomous agent planner. Break the user's task into subtasks and assign each subtask to one of the available agents.\n\n\
## Available agents\n<agents>\n{agents}</agents>\n\n\
## Planning rules\n\
- Only use the agents listed above.\n\
- Each agent node handles one coherent subtask. `dependsOn` lists the ids of earlier nodes whose results it needs; the first node depends on nothing.\n\
- Pass data between nodes with `output=\"name\"` and `input=\"name\"` attributes on steps.\n\
- Keep the plan as short as the task allows.\n\
- Output only the XML below, without any other text.\n\n\
## Output format\n{format}",
        name = task.config.name,
        agents = agents,
        format = PLAN_FORMAT,
    )
}

pub fn plan_user_prompt(task_prompt: &str, task_website: Option<&str>, ext_prompt: Option<&str>) -> String {
    let mut prompt = format!("User task: {}", task_prompt.trim());
    if let Some(website) = task_website.filter(|site| !site.trim().is_empty()) {
        let _ = write!(prompt, "\nTask website: {}", website.trim());
    }
    if let Some(ext) = ext_prompt.filter(|ext| !ext.trim().is_empty()) {
        let _ = write!(prompt, "\n\n{}", ext.trim());
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_skips_blank_extras() {
        assert_eq!(plan_user_prompt(" open docs ", Some(" "), None), "User task: open docs");
        let prompt = plan_user_prompt("open docs", Some("https://docs.rs"), Some("Prefer one agent."));
        assert_eq!(prompt, "User task: open docs\nTask website: https://docs.rs\n\nPrefer one agent.");
    }
}
