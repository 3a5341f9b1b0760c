//! Plan validator.
//!
//! Walks the interpreted instruction list against a symbolic environment
//! seeded from the live enclave, catching structural mistakes (duplicate
//! ids, dangling references) before anything executes. Validation is
//! all-or-nothing: the first failing rule aborts the run.

use super::instruction::{Instruction, InstructionKind, InstructionPosition};
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// The symbolic state validation walks forward.
///
/// Mirrors what the enclave would look like after each instruction
/// succeeds: known service ids, known artifact identifiers, and the
/// container images the plan will need.
#[derive(Debug, Default)]
pub struct ValidatorEnvironment {
    service_ids: BTreeSet<String>,
    artifact_ids: BTreeSet<String>,
    required_images: BTreeSet<String>,
}

impl ValidatorEnvironment {
    /// Seeds the environment from the live enclave.
    #[must_use]
    pub fn new(
        existing_service_ids: BTreeSet<String>,
        existing_artifact_ids: BTreeSet<String>,
    ) -> Self {
        Self {
            service_ids: existing_service_ids,
            artifact_ids: existing_artifact_ids,
            required_images: BTreeSet::new(),
        }
    }

    pub fn add_service_id(&mut self, id: &str) {
        self.service_ids.insert(id.to_string());
    }

    pub fn remove_service_id(&mut self, id: &str) {
        self.service_ids.remove(id);
    }

    #[must_use]
    pub fn service_id_exists(&self, id: &str) -> bool {
        self.service_ids.contains(id)
    }

    pub fn add_artifact_id(&mut self, id: &str) {
        self.artifact_ids.insert(id.to_string());
    }

    #[must_use]
    pub fn artifact_id_exists(&self, id: &str) -> bool {
        self.artifact_ids.contains(id)
    }

    pub fn require_image(&mut self, image: &str) {
        self.required_images.insert(image.to_string());
    }

    /// Every image the validated plan needs pulled.
    #[must_use]
    pub fn required_images(&self) -> &BTreeSet<String> {
        &self.required_images
    }
}

/// The plan validator.
pub struct PlanValidator;

impl PlanValidator {
    /// Validates a whole plan, mutating `environment` as it walks.
    pub fn validate(
        instructions: &[Instruction],
        environment: &mut ValidatorEnvironment,
    ) -> Result<()> {
        for instruction in instructions {
            Self::validate_one(instruction, environment)?;
        }
        Ok(())
    }

    fn validate_one(
        instruction: &Instruction,
        env: &mut ValidatorEnvironment,
    ) -> Result<()> {
        let position = &instruction.position;
        match &instruction.kind {
            InstructionKind::AddService { service_id, config } => {
                if env.service_id_exists(service_id) {
                    return Err(validation_error(
                        position,
                        &format!("service '{service_id}' already exists"),
                    ));
                }
                for artifact_id in config.files_artifact_mounts.keys() {
                    if !env.artifact_id_exists(artifact_id) {
                        return Err(validation_error(
                            position,
                            &format!("files artifact '{artifact_id}' does not exist"),
                        ));
                    }
                }
                env.require_image(&config.image);
                env.add_service_id(service_id);
            }
            InstructionKind::RemoveService { service_id } => {
                if !env.service_id_exists(service_id) {
                    return Err(validation_error(
                        position,
                        &format!("service '{service_id}' does not exist"),
                    ));
                }
                env.remove_service_id(service_id);
            }
            InstructionKind::RenderTemplates { name, .. }
            | InstructionKind::UploadFiles { name, .. } => {
                if env.artifact_id_exists(name) {
                    return Err(validation_error(
                        position,
                        &format!("files artifact '{name}' already exists"),
                    ));
                }
                env.add_artifact_id(name);
            }
            InstructionKind::StoreServiceFiles {
                name, service_id, ..
            } => {
                if !env.service_id_exists(service_id) {
                    return Err(validation_error(
                        position,
                        &format!("service '{service_id}' does not exist"),
                    ));
                }
                if env.artifact_id_exists(name) {
                    return Err(validation_error(
                        position,
                        &format!("files artifact '{name}' already exists"),
                    ));
                }
                env.add_artifact_id(name);
            }
            InstructionKind::ExecCommand { service_id, .. }
            | InstructionKind::Wait { service_id, .. } => {
                if !env.service_id_exists(service_id) {
                    return Err(validation_error(
                        position,
                        &format!("service '{service_id}' does not exist"),
                    ));
                }
            }
            InstructionKind::RunSh { image, .. } | InstructionKind::RunPython { image, .. } => {
                env.require_image(image);
            }
        }
        Ok(())
    }
}

fn validation_error(position: &InstructionPosition, message: &str) -> Error {
    Error::Validation {
        file: position.file.clone(),
        line: position.line,
        column: position.column,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::instruction::InstructionArg;
    use crate::service::ServiceConfig;

    fn instruction(kind: InstructionKind) -> Instruction {
        Instruction {
            name: "test",
            position: InstructionPosition {
                file: "main.plan".to_string(),
                line: 2,
                column: 1,
            },
            args: Vec::<InstructionArg>::new(),
            kind,
        }
    }

    fn add_service(id: &str, image: &str) -> Instruction {
        instruction(InstructionKind::AddService {
            service_id: id.to_string(),
            config: ServiceConfig {
                image: image.to_string(),
                ..ServiceConfig::default()
            },
        })
    }

    #[test]
    fn test_add_then_remove_is_valid() {
        let instructions = vec![
            add_service("db", "postgres"),
            instruction(InstructionKind::RemoveService {
                service_id: "db".to_string(),
            }),
        ];
        let mut env = ValidatorEnvironment::default();
        PlanValidator::validate(&instructions, &mut env).unwrap();
        assert!(!env.service_id_exists("db"));
        assert!(env.required_images().contains("postgres"));
    }

    #[test]
    fn test_duplicate_service_id_cites_position() {
        let instructions = vec![add_service("db", "postgres"), add_service("db", "redis")];
        let mut env = ValidatorEnvironment::default();
        let err = PlanValidator::validate(&instructions, &mut env).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("already exists"));
        assert!(message.contains("main.plan[2:1]"));
    }

    #[test]
    fn test_remove_unknown_service_fails() {
        let instructions = vec![instruction(InstructionKind::RemoveService {
            service_id: "ghost".to_string(),
        })];
        let mut env = ValidatorEnvironment::default();
        assert!(PlanValidator::validate(&instructions, &mut env).is_err());
    }

    #[test]
    fn test_exec_against_preexisting_service_is_valid() {
        let instructions = vec![instruction(InstructionKind::ExecCommand {
            service_id: "live".to_string(),
            command: vec!["ls".to_string()],
            result_key: "task-0".to_string(),
        })];
        let mut env =
            ValidatorEnvironment::new(BTreeSet::from(["live".to_string()]), BTreeSet::new());
        PlanValidator::validate(&instructions, &mut env).unwrap();
    }

    #[test]
    fn test_mount_of_undeclared_artifact_fails() {
        let mut config = ServiceConfig {
            image: "app".to_string(),
            ..ServiceConfig::default()
        };
        config
            .files_artifact_mounts
            .insert("ghost-artifact".to_string(), "/data".to_string());
        let instructions = vec![instruction(InstructionKind::AddService {
            service_id: "app".to_string(),
            config,
        })];
        let mut env = ValidatorEnvironment::default();
        let err = PlanValidator::validate(&instructions, &mut env).unwrap_err();
        assert!(err.to_string().contains("ghost-artifact"));
    }

    #[test]
    fn test_artifact_name_collision_fails() {
        let instructions = vec![
            instruction(InstructionKind::RenderTemplates {
                name: "cfg".to_string(),
                templates: Vec::new(),
            }),
            instruction(InstructionKind::UploadFiles {
                name: "cfg".to_string(),
                src: "x".to_string(),
                bytes: Vec::new(),
            }),
        ];
        let mut env = ValidatorEnvironment::default();
        assert!(PlanValidator::validate(&instructions, &mut env).is_err());
    }
}
