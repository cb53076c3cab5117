use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::event::DataKind;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => f.write_str("input"),
            PortDirection::Output => f.write_str("output"),
        }
    }
}

/// A port as a module declares it, before it is bound to a module id.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PortSpec {
    pub name: String,
    pub kind: DataKind,
    pub direction: PortDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PortSpec {
    pub fn input(name: impl Into<String>, kind: DataKind) -> Self {
        Self {
            name: name.into(),
            kind,
            direction: PortDirection::Input,
            description: None,
        }
    }

    pub fn output(name: impl Into<String>, kind: DataKind) -> Self {
        Self {
            name: name.into(),
            kind,
            direction: PortDirection::Output,
            description: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn bind(&self, module: impl Into<String>) -> Port {
        Port {
            name: self.name.clone(),
            kind: self.kind,
            direction: self.direction,
            module: module.into(),
        }
    }
}

/// A named, typed, directional endpoint owned by one module instance. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Port {
    pub name: String,
    pub kind: DataKind,
    pub direction: PortDirection,
    pub module: String,
}

impl Port {
    /// `"{module}.{direction}.{name}"`
    pub fn id(&self) -> String {
        format!("{}.{}.{}", self.module, self.direction, self.name)
    }

    /// Same port, owned by another module id.
    pub fn rebind(&self, module: impl Into<String>) -> Port {
        Port {
            module: module.into(),
            ..self.clone()
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id(), self.kind)
    }
}
