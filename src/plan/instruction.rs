//! Typed plan instructions.
//!
//! The interpreter turns every side-effecting built-in call into one
//! [`Instruction`]: the typed arguments (the effect payload), the call-site
//! position, and the argument records used to render the instruction back
//! to clients. Instructions are immutable once interpreted.

use crate::network::ProbeMethod;
use crate::service::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Position
// =============================================================================

/// Where in the script a call happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionPosition {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for InstructionPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.file, self.line, self.column)
    }
}

// =============================================================================
// Argument records
// =============================================================================

/// One argument as written at the call site.
///
/// `representative` marks the arguments worth showing in compact client
/// displays (a service id is, a giant config blob is not).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionArg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Source-form rendering of the argument value.
    pub source: String,
    pub representative: bool,
}

// =============================================================================
// Instruction
// =============================================================================

/// One interpreted instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Built-in name ("add_service", ...).
    pub name: &'static str,
    pub position: InstructionPosition,
    /// Arguments as written, for canonical rendering.
    pub args: Vec<InstructionArg>,
    /// The typed effect payload.
    pub kind: InstructionKind,
}

impl Instruction {
    /// Canonical source-form rendering: matches the script excerpt at the
    /// call site up to whitespace.
    #[must_use]
    pub fn canonical(&self) -> String {
        let rendered: Vec<String> = self
            .args
            .iter()
            .map(|arg| match &arg.name {
                Some(name) => format!("{name}={}", arg.source),
                None => arg.source.clone(),
            })
            .collect();
        format!("{}({})", self.name, rendered.join(", "))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// The effect payload of each built-in.
///
/// String fields may contain future-reference tokens; the executor resolves
/// them immediately before running the instruction.
#[derive(Debug, Clone)]
pub enum InstructionKind {
    /// Register + start one service.
    AddService {
        service_id: String,
        /// `files_artifact_mounts` keys are artifact identifiers (plan
        /// names or store uuids); the executor maps them to uuids.
        config: ServiceConfig,
    },
    /// Stop + remove one service.
    RemoveService { service_id: String },
    /// Render templates into a new artifact registered under `name`.
    RenderTemplates {
        name: String,
        /// (destination path, template text, params).
        templates: Vec<(String, String, serde_json::Value)>,
    },
    /// Store uploaded bytes as a new artifact registered under `name`.
    UploadFiles {
        name: String,
        src: String,
        /// Content resolved from the provider at interpretation time.
        bytes: Vec<u8>,
    },
    /// Tar a path out of a running service into a new artifact.
    StoreServiceFiles {
        name: String,
        service_id: String,
        src_path: String,
    },
    /// Run an argv inside a running service.
    ExecCommand {
        service_id: String,
        command: Vec<String>,
        /// Runtime-value key under which output/code are stored.
        result_key: String,
    },
    /// Run a shell snippet in a one-off task container.
    RunSh {
        run: String,
        image: String,
        result_key: String,
    },
    /// Run a python snippet in a one-off task container.
    RunPython {
        run: String,
        image: String,
        result_key: String,
    },
    /// Block until an HTTP endpoint on a service answers.
    Wait {
        service_id: String,
        method: ProbeMethod,
        port: u16,
        path: String,
        initial_delay_ms: u64,
        retries: u32,
        retries_delay_ms: u64,
        body: Option<String>,
        expected_body: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_rendering_preserves_arg_forms() {
        let instruction = Instruction {
            name: "add_service",
            position: InstructionPosition {
                file: "main.plan".to_string(),
                line: 1,
                column: 1,
            },
            args: vec![
                InstructionArg {
                    name: Some("id".to_string()),
                    source: "\"db\"".to_string(),
                    representative: true,
                },
                InstructionArg {
                    name: None,
                    source: "config(image=\"postgres\")".to_string(),
                    representative: false,
                },
            ],
            kind: InstructionKind::RemoveService {
                service_id: "db".to_string(),
            },
        };
        assert_eq!(
            instruction.canonical(),
            "add_service(id=\"db\", config(image=\"postgres\"))"
        );
    }
}
