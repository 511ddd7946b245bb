use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::{node_id, node_index, AgentStatus, Workflow, WorkflowAgent};
use crate::error::{Result, TaskFlowError};

static AGENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<agent\b([^>]*)>(.*?)</agent>").unwrap());
static OPEN_AGENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<agent\b([^>]*)>(.*)$").unwrap());
static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([\w:-]+)\s*=\s*"([^"]*)""#).unwrap());
static OPEN_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*<agent\b[^>]*>").unwrap());

/// 工作流文本编解码
pub trait WorkflowCodec: Send + Sync {
    /// 解析模型输出
    ///
    /// `done = false` 时容忍未闭合的标签，信息不足时返回 `Ok(None)`；
    /// `done = true` 时严格校验。
    fn parse(&self, task_id: &str, text: &str, done: bool, thinking: Option<&str>) -> Result<Option<Workflow>>;

    fn serialize(&self, workflow: &Workflow) -> String;
}

/// `<root><name/><thought/><agents><agent .../></agents></root>` 格式
#[derive(Clone, Copy, Debug, Default)]
pub struct XmlWorkflowCodec;

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn encode_entities(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// 取出元素文本，`partial` 时允许缺少结束标签
fn extract_element(text: &str, tag: &str, partial: bool) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let rest = &text[start..];
    match rest.find(&close) {
        Some(end) => Some(decode_entities(rest[..end].trim())),
        None if partial => {
            // 去掉尾部可能被截断的标签
            let cut = rest.rfind('<').filter(|pos| !rest[*pos..].contains('>'));
            let body = cut.map_or(rest, |pos| &rest[..pos]);
            Some(decode_entities(body.trim()))
        }
        None => None,
    }
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    ATTR_RE
        .captures_iter(attrs)
        .find(|caps| &caps[1] == name)
        .map(|caps| decode_entities(&caps[2]))
}

impl XmlWorkflowCodec {
    fn parse_agent(
        &self,
        task_id: &str,
        index: usize,
        attrs: &str,
        body: &str,
        raw: &str,
        partial: bool,
    ) -> Result<Option<WorkflowAgent>> {
        let name = match attribute(attrs, "name").filter(|name| !name.trim().is_empty()) {
            Some(name) => name.trim().to_string(),
            None if partial => return Ok(None),
            None => {
                return Err(TaskFlowError::WorkflowParse(format!(
                    "agent #{index} has no name attribute"
                )))
            }
        };
        let task = match extract_element(body, "task", partial) {
            Some(task) => task,
            None if partial => String::new(),
            None => {
                return Err(TaskFlowError::WorkflowParse(format!(
                    "agent `{name}` has no <task> element"
                )))
            }
        };
        let mut depends_on = Vec::new();
        for dep in attribute(attrs, "dependsOn").unwrap_or_default().split(',') {
            let dep = dep.trim();
            if dep.is_empty() {
                continue;
            }
            match dep.parse::<usize>().ok().or_else(|| node_index(dep)) {
                Some(dep) if dep < index => depends_on.push(node_id(task_id, dep)),
                _ => warn!(agent = %name, dependency = %dep, "Dropping dependency that is not an earlier node"),
            }
        }
        Ok(Some(WorkflowAgent {
            id: node_id(task_id, index),
            name,
            task,
            depends_on,
            xml: raw.to_string(),
            status: AgentStatus::Init,
        }))
    }

    fn open_tag(&self, workflow: &Workflow, agent: &WorkflowAgent, index: usize) -> String {
        let deps: Vec<String> = agent
            .depends_on
            .iter()
            .filter_map(|dep| workflow.agent_position(dep))
            .map(|position| position.to_string())
            .collect();
        format!(
            r#"<agent name="{}" id="{}" dependsOn="{}">"#,
            encode_entities(&agent.name),
            index,
            deps.join(",")
        )
    }
}

impl WorkflowCodec for XmlWorkflowCodec {
    fn parse(&self, task_id: &str, text: &str, done: bool, thinking: Option<&str>) -> Result<Option<Workflow>> {
        let partial = !done;
        let Some(start) = text.find("<root>") else {
            if done {
                return Err(TaskFlowError::WorkflowParse("missing <root> element".into()));
            }
            return Ok(None);
        };
        let body = &text[start..];
        let xml = match body.find("</root>") {
            Some(end) => &body[..end + "</root>".len()],
            None => body,
        };

        let agents_start = xml.find("<agents>");
        let header = agents_start.map_or(xml, |pos| &xml[..pos]);
        let name = extract_element(header, "name", partial).unwrap_or_default();
        let thought = extract_element(header, "thought", partial)
            .filter(|thought| !thought.is_empty())
            .or_else(|| thinking.map(|t| t.trim().to_string()))
            .unwrap_or_default();

        let mut workflow = Workflow {
            task_id: task_id.to_string(),
            name,
            thought,
            task_prompt: String::new(),
            agents: Vec::new(),
            xml: xml.to_string(),
            modified: false,
        };

        let Some(agents_start) = agents_start else {
            if done {
                return Err(TaskFlowError::WorkflowParse("missing <agents> element".into()));
            }
            return Ok(Some(workflow));
        };
        let section = &xml[agents_start..];

        let mut consumed = 0;
        for caps in AGENT_RE.captures_iter(section) {
            let (Some(whole), Some(attrs), Some(inner)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };
            consumed = whole.end();
            let index = workflow.agents.len();
            if let Some(agent) = self.parse_agent(
                task_id,
                index,
                attrs.as_str(),
                inner.as_str(),
                whole.as_str(),
                partial,
            )? {
                workflow.agents.push(agent);
            }
        }

        if partial {
            let tail = &section[consumed..];
            if let Some(caps) = OPEN_AGENT_RE.captures(tail) {
                let attrs = caps.get(1).map_or("", |m| m.as_str());
                let inner = caps.get(2).map_or("", |m| m.as_str());
                let raw = caps.get(0).map_or("", |m| m.as_str());
                let index = workflow.agents.len();
                if let Some(agent) = self.parse_agent(task_id, index, attrs, inner, raw, true)? {
                    workflow.agents.push(agent);
                }
            }
        } else if workflow.agents.is_empty() {
            return Err(TaskFlowError::WorkflowParse("workflow contains no agents".into()));
        }

        Ok(Some(workflow))
    }

    fn serialize(&self, workflow: &Workflow) -> String {
        let mut out = String::from("<root>\n");
        out.push_str(&format!("  <name>{}</name>\n", encode_entities(&workflow.name)));
        if !workflow.thought.is_empty() {
            out.push_str(&format!("  <thought>{}</thought>\n", encode_entities(&workflow.thought)));
        }
        out.push_str("  <agents>\n");
        for (index, agent) in workflow.agents.iter().enumerate() {
            let tag = self.open_tag(workflow, agent, index);
            match OPEN_TAG_RE.find(&agent.xml) {
                Some(existing) if agent.xml.trim_end().ends_with("</agent>") => {
                    out.push_str("    ");
                    out.push_str(&tag);
                    out.push_str(&agent.xml[existing.end()..]);
                    out.push('\n');
                }
                _ => {
                    out.push_str(&format!(
                        "    {}\n      <task>{}</task>\n    </agent>\n",
                        tag,
                        encode_entities(&agent.task)
                    ));
                }
            }
        }
        out.push_str("  </agents>\n</root>");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"Here is the plan:
<root>
  <name>Weekly report</name>
  <thought>Collect data first, then write.</thought>
  <agents>
    <agent name="Browser" id="0" dependsOn="">
      <task>Collect sales figures</task>
      <nodes>
        <node output="sales">open dashboard</node>
      </nodes>
    </agent>
    <agent name="Writer" id="1" dependsOn="0">
      <task>Write the report &amp; send it</task>
    </agent>
  </agents>
</root>"#;

    #[test]
    fn parses_complete_plan() {
        let wf = XmlWorkflowCodec.parse("task1", PLAN, true, None).unwrap().unwrap();
        assert_eq!(wf.name, "Weekly report");
        assert_eq!(wf.agents.len(), 2);
        assert_eq!(wf.agents[0].id, "task1-00");
        assert_eq!(wf.agents[1].depends_on, vec!["task1-00"]);
        assert_eq!(wf.agents[1].task, "Write the report & send it");
        assert!(wf.agents[0].xml.contains("output=\"sales\""));
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn partial_plan_is_tolerated() {
        let cut = &PLAN[..PLAN.find("Write the").unwrap() + 5];
        let wf = XmlWorkflowCodec.parse("task1", cut, false, None).unwrap().unwrap();
        assert_eq!(wf.agents.len(), 2);
        assert_eq!(wf.agents[1].task, "Write");
        assert!(XmlWorkflowCodec.parse("task1", "thinking...", false, None).unwrap().is_none());
    }

    #[test]
    fn strict_parse_rejects_missing_agents() {
        let err = XmlWorkflowCodec
            .parse("t", "<root><name>x</name></root>", true, None)
            .unwrap_err();
        assert!(matches!(err, TaskFlowError::WorkflowParse(_)));
        assert!(XmlWorkflowCodec.parse("t", "no xml here", true, None).is_err());
    }

    #[test]
    fn serialized_plan_parses_to_same_graph() {
        let wf = XmlWorkflowCodec.parse("task1", PLAN, true, None).unwrap().unwrap();
        let text = XmlWorkflowCodec.serialize(&wf);
        let again = XmlWorkflowCodec.parse("task1", &text, true, None).unwrap().unwrap();
        let graph = |w: &Workflow| {
            w.agents
                .iter()
                .map(|a| (a.id.clone(), a.name.clone(), a.task.clone(), a.depends_on.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(graph(&wf), graph(&again));
    }

    #[test]
    fn thinking_fills_missing_thought() {
        let text = r#"<root><name>n</name><agents><agent name="A"><task>t</task></agent></agents></root>"#;
        let wf = XmlWorkflowCodec.parse("x", text, true, Some("reasoned")).unwrap().unwrap();
        assert_eq!(wf.thought, "reasoned");
    }
}
