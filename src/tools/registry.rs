use crate::llm::ToolSchema;

use super::tool::DynTool;

/// 保持注册顺序的工具表，同名工具后注册者覆盖
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<DynTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: DynTool) {
        match self.tools.iter().position(|existing| existing.name() == tool.name()) {
            Some(index) => self.tools[index] = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn get(&self, name: &str) -> Option<DynTool> {
        self.tools.iter().find(|tool| tool.name() == name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DynTool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|tool| tool.schema()).collect()
    }

    /// 合并另一组工具，返回新的工具表
    pub fn merge<I>(&self, other: I) -> Self
    where
        I: IntoIterator<Item = DynTool>,
    {
        let mut merged = self.clone();
        for tool in other {
            merged.register(tool);
        }
        merged
    }
}

impl From<Vec<DynTool>> for ToolRegistry {
    fn from(tools: Vec<DynTool>) -> Self {
        ToolRegistry::new().merge(tools)
    }
}

impl FromIterator<DynTool> for ToolRegistry {
    fn from_iter<T: IntoIterator<Item = DynTool>>(iter: T) -> Self {
        ToolRegistry::new().merge(iter)
    }
}
