//! 工作流：一次规划产出的有序 agent 节点列表

pub mod xml;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskFlowError};

pub use xml::{WorkflowCodec, XmlWorkflowCodec};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Init,
    Running,
    Done,
    Error,
}

/// 工作流中的一个 agent 节点
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkflowAgent {
    pub id: String,
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub xml: String,
    #[serde(default)]
    pub status: AgentStatus,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub thought: String,
    /// 累积的任务描述，重规划时追加
    #[serde(default)]
    pub task_prompt: String,
    pub agents: Vec<WorkflowAgent>,
    #[serde(default)]
    pub xml: String,
    #[serde(default)]
    pub modified: bool,
}

/// 节点 id 形如 `{task_id}-{两位序号}`
pub fn node_id(task_id: &str, index: usize) -> String {
    format!("{}-{:02}", task_id, index)
}

/// 从节点 id 中取出序号
pub fn node_index(id: &str) -> Option<usize> {
    id.rsplit_once('-')?.1.parse().ok()
}

impl Workflow {
    pub fn agent(&self, id: &str) -> Option<&WorkflowAgent> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    pub fn agent_position(&self, id: &str) -> Option<usize> {
        self.agents.iter().position(|agent| agent.id == id)
    }

    pub fn set_status(&mut self, id: &str, status: AgentStatus) {
        if let Some(agent) = self.agents.iter_mut().find(|agent| agent.id == id) {
            agent.status = status;
        }
    }

    /// 节点序号严格递增，依赖只能指向更早的节点
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            return Err(TaskFlowError::InvalidWorkflow("workflow has no agents".into()));
        }
        let mut seen = HashSet::new();
        let mut last: Option<usize> = None;
        for agent in &self.agents {
            let index = node_index(&agent.id).ok_or_else(|| {
                TaskFlowError::InvalidWorkflow(format!("malformed node id `{}`", agent.id))
            })?;
            if last.is_some_and(|last| index <= last) {
                return Err(TaskFlowError::InvalidWorkflow(format!(
                    "node id `{}` is out of order",
                    agent.id
                )));
            }
            for dep in &agent.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(TaskFlowError::InvalidWorkflow(format!(
                        "node `{}` depends on `{}` which is not an earlier node",
                        agent.id, dep
                    )));
                }
            }
            seen.insert(agent.id.as_str());
            last = Some(index);
        }
        Ok(())
    }
}

/// 用重规划结果替换 `current_index` 之后的节点
///
/// 已执行的前缀原样保留；新节点从 `current_index + 1` 开始重新编号，
/// 第一个新节点依赖最后一个保留节点，其余依赖整体平移。
pub fn merge_workflow(base: &mut Workflow, replan: &Workflow, current_index: usize) {
    base.name = replan.name.clone();
    base.thought = replan.thought.clone();
    base.agents.truncate(current_index + 1);
    let anchor = base.agents.last().map(|agent| agent.id.clone());
    let offset = base.agents.len();

    for (i, agent) in replan.agents.iter().enumerate() {
        let mut node = agent.clone();
        node.id = node_id(&base.task_id, i + offset);
        node.status = AgentStatus::Init;
        node.depends_on = if i == 0 {
            anchor.iter().cloned().collect()
        } else {
            agent
                .depends_on
                .iter()
                .filter_map(|dep| node_index(dep))
                .filter(|dep| *dep < i)
                .map(|dep| node_id(&base.task_id, dep + offset))
                .collect()
        };
        base.agents.push(node);
    }
    base.modified = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(task_id: &str, index: usize, deps: &[usize]) -> WorkflowAgent {
        WorkflowAgent {
            id: node_id(task_id, index),
            name: format!("Agent{index}"),
            task: format!("task {index}"),
            depends_on: deps.iter().map(|dep| node_id(task_id, *dep)).collect(),
            xml: String::new(),
            status: AgentStatus::Init,
        }
    }

    fn workflow(task_id: &str, specs: &[&[usize]]) -> Workflow {
        Workflow {
            task_id: task_id.into(),
            name: "plan".into(),
            agents: specs
                .iter()
                .enumerate()
                .map(|(i, deps)| agent(task_id, i, deps))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn node_ids_are_zero_padded() {
        assert_eq!(node_id("task-abc", 3), "task-abc-03");
        assert_eq!(node_index("task-abc-03"), Some(3));
        assert_eq!(node_index("nope"), None);
    }

    #[test]
    fn forward_dependency_is_invalid() {
        let mut wf = workflow("t", &[&[], &[0]]);
        assert!(wf.validate().is_ok());
        wf.agents[0].depends_on.push(node_id("t", 1));
        assert!(wf.validate().is_err());
    }

    #[test]
    fn merge_keeps_prefix_and_renumbers_suffix() {
        let mut base = workflow("t", &[&[], &[0], &[1], &[2]]);
        base.agents[0].status = AgentStatus::Done;
        base.agents[1].status = AgentStatus::Done;
        let prefix = base.agents[..2].to_vec();

        let mut replan = workflow("t", &[&[], &[0], &[0, 1]]);
        replan.name = "replanned".into();
        merge_workflow(&mut base, &replan, 1);

        assert_eq!(&base.agents[..2], &prefix[..]);
        let ids: Vec<_> = base.agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["t-00", "t-01", "t-02", "t-03", "t-04"]);
        assert_eq!(base.agents[2].depends_on, vec!["t-01"]);
        assert_eq!(base.agents[3].depends_on, vec!["t-02"]);
        assert_eq!(base.agents[4].depends_on, vec!["t-02", "t-03"]);
        assert!(base.modified);
        assert_eq!(base.name, "replanned");
        assert!(base.validate().is_ok());
    }
}
