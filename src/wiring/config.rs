use std::{collections::HashSet, fs, path::Path};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// One module instance placed in a configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleNode {
    pub module_id: String,
    /// Module type name; used to find ports when `module_id` has none registered.
    pub module_name: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub size: Size,
}

impl ModuleNode {
    pub fn new(module_id: impl Into<String>, module_name: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            module_name: module_name.into(),
            position: Position::default(),
            size: Size::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PortConnection {
    pub source_module_id: String,
    pub source_port_name: String,
    pub target_module_id: String,
    pub target_port_name: String,
}

impl PortConnection {
    pub fn new(
        source_module_id: impl Into<String>,
        source_port_name: impl Into<String>,
        target_module_id: impl Into<String>,
        target_port_name: impl Into<String>,
    ) -> Self {
        Self {
            source_module_id: source_module_id.into(),
            source_port_name: source_port_name.into(),
            target_module_id: target_module_id.into(),
            target_port_name: target_port_name.into(),
        }
    }
}

impl std::fmt::Display for PortConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source_module_id, self.source_port_name, self.target_module_id, self.target_port_name
        )
    }
}

/// A named graph of module nodes and port connections, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WiringConfiguration {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub nodes: Vec<ModuleNode>,
    #[serde(default)]
    pub connections: Vec<PortConnection>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WiringConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn with_node(mut self, module_id: &str, module_name: &str) -> Self {
        self.nodes.push(ModuleNode::new(module_id, module_name));
        self
    }

    pub fn connect(mut self, source: &str, source_port: &str, target: &str, target_port: &str) -> Self {
        self.connections
            .push(PortConnection::new(source, source_port, target, target_port));
        self
    }

    pub fn node(&self, module_id: &str) -> Option<&ModuleNode> {
        self.nodes.iter().find(|n| n.module_id == module_id)
    }

    pub fn node_ids(&self) -> HashSet<&str> {
        self.nodes.iter().map(|n| n.module_id.as_str()).collect()
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading wiring configuration {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing wiring configuration {}", path.display()))
    }
}
