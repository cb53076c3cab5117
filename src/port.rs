use dashmap::DashMap;
use module_plugin::{DataKind, Port, PortDirection};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PortError {
    #[error("source port `{0}` is not an output port")]
    SourceNotOutput(String),

    #[error("target port `{0}` is not an input port")]
    TargetNotInput(String),

    #[error("cannot connect ports of the same module `{0}`")]
    SameModule(String),

    #[error("port kinds differ: `{source_port}` carries {source_kind}, `{target_port}` expects {target_kind}")]
    KindMismatch {
        source_port: String,
        source_kind: DataKind,
        target_port: String,
        target_kind: DataKind,
    },
}

/// Ports declared by every registered module, keyed by module id.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: DashMap<String, Vec<Port>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever was registered for `module` before.
    pub fn register_ports(&self, module: &str, ports: Vec<Port>) {
        self.ports.insert(module.to_string(), ports);
    }

    pub fn unregister(&self, module: &str) -> bool {
        self.ports.remove(module).is_some()
    }

    pub fn contains(&self, module: &str) -> bool {
        self.ports.contains_key(module)
    }

    pub fn ports(&self, module: &str) -> Vec<Port> {
        self.ports
            .get(module)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    pub fn all_ports(&self) -> Vec<Port> {
        self.ports
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn find(&self, module: &str, direction: PortDirection, name: &str) -> Option<Port> {
        self.ports.get(module).and_then(|ports| {
            ports
                .iter()
                .find(|p| p.direction == direction && p.name == name)
                .cloned()
        })
    }
}

pub struct PortValidator;

impl PortValidator {
    /// Rules are checked in order: source direction, target direction, distinct
    /// owners, identical kinds. There is no coercion between kinds.
    pub fn validate_connection(source: &Port, target: &Port) -> Result<(), PortError> {
        if source.direction != PortDirection::Output {
            return Err(PortError::SourceNotOutput(source.id()));
        }
        if target.direction != PortDirection::Input {
            return Err(PortError::TargetNotInput(target.id()));
        }
        if source.module == target.module {
            return Err(PortError::SameModule(source.module.clone()));
        }
        if source.kind != target.kind {
            return Err(PortError::KindMismatch {
                source_port: source.id(),
                source_kind: source.kind,
                target_port: target.id(),
                target_kind: target.kind,
            });
        }
        Ok(())
    }
}
