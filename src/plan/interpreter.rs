//! Plan interpreter.
//!
//! Walks the parsed script and turns every side-effecting built-in call
//! into a typed [`Instruction`], evaluating value constructors and
//! `read_file` inline. The interpreter touches nothing but the script, its
//! parameters and the content provider: interpreting the same inputs twice
//! yields the same plan regardless of backend state.

use super::future_ref::{runtime_value_token, service_ip_token};
use super::instruction::{Instruction, InstructionArg, InstructionKind, InstructionPosition};
use super::lexer::interpretation_error_at;
use super::parser::{parse, CallArg, Expr, Statement};
use super::value::Value;
use super::ContentProvider;
use crate::constants::MAX_SCRIPT_SIZE;
use crate::error::{Error, Result};
use crate::network::ProbeMethod;
use crate::port_spec::{PortSpec, TransportProtocol};
use crate::service::ServiceConfig;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Default image for `run_sh` task containers.
const RUN_SH_DEFAULT_IMAGE: &str = "alpine:3.18";

/// Default image for `run_python` task containers.
const RUN_PYTHON_DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Output of interpretation: the ordered instructions plus the script's
/// return value (the value of its final statement).
#[derive(Debug)]
pub struct Plan {
    pub instructions: Vec<Instruction>,
    pub return_value: Value,
}

/// The plan interpreter.
pub struct Interpreter<'a> {
    provider: &'a dyn ContentProvider,
}

impl<'a> Interpreter<'a> {
    #[must_use]
    pub fn new(provider: &'a dyn ContentProvider) -> Self {
        Self { provider }
    }

    /// Interprets a script. `params` is exposed to the script as the
    /// `params` variable.
    pub fn interpret(
        &self,
        script: &str,
        file: &str,
        params: &serde_json::Value,
    ) -> Result<Plan> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(Error::Interpretation {
                file: file.to_string(),
                line: 1,
                column: 1,
                message: format!("script exceeds the {MAX_SCRIPT_SIZE}-byte limit"),
            });
        }

        let statements = parse(script, file)?;
        let mut ctx = EvalContext {
            provider: self.provider,
            variables: HashMap::from([("params".to_string(), json_to_value(params))]),
            instructions: Vec::new(),
            declared_service_ids: HashSet::new(),
            declared_artifact_names: HashSet::new(),
            next_task_index: 0,
            next_artifact_index: 0,
        };

        let mut return_value = Value::None;
        for statement in statements {
            match statement {
                Statement::Assign { name, value } => {
                    let evaluated = ctx.eval(&value)?;
                    ctx.variables.insert(name, evaluated.clone());
                    return_value = evaluated;
                }
                Statement::Expr(expr) => {
                    return_value = ctx.eval(&expr)?;
                }
            }
        }

        Ok(Plan {
            instructions: ctx.instructions,
            return_value,
        })
    }
}

// =============================================================================
// Evaluation
// =============================================================================

struct EvalContext<'a> {
    provider: &'a dyn ContentProvider,
    variables: HashMap<String, Value>,
    instructions: Vec<Instruction>,
    declared_service_ids: HashSet<String>,
    declared_artifact_names: HashSet<String>,
    next_task_index: usize,
    next_artifact_index: usize,
}

impl EvalContext<'_> {
    fn eval(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::String(s, _) => Ok(Value::String(s.clone())),
            Expr::Int(n, _) => Ok(Value::Int(*n)),
            Expr::Bool(b, _) => Ok(Value::Bool(*b)),
            Expr::Identifier(name, position) => {
                self.variables.get(name).cloned().ok_or_else(|| {
                    interpretation_error_at(position, &format!("unknown variable '{name}'"))
                })
            }
            Expr::List(items, _) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::List(values))
            }
            Expr::Dict(entries, _) => {
                let mut map = BTreeMap::new();
                for (key_expr, value_expr) in entries {
                    let key = match self.eval(key_expr)? {
                        Value::String(s) => s,
                        other => {
                            return Err(interpretation_error_at(
                                key_expr.position(),
                                &format!("dict keys must be strings, got {}", other.type_name()),
                            ))
                        }
                    };
                    map.insert(key, self.eval(value_expr)?);
                }
                Ok(Value::Dict(map))
            }
            Expr::Call {
                name,
                args,
                position,
            } => self.eval_call(name, args, position),
        }
    }

    fn eval_call(
        &mut self,
        name: &str,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        match name {
            // Value constructors: evaluated inline, no instruction.
            "port" => self.builtin_port(args, position),
            "config" => self.builtin_config(args, position),
            "template_data" => self.builtin_template_data(args, position),
            "read_file" => self.builtin_read_file(args, position),

            // Side-effecting built-ins: appended to the instruction queue.
            "add_service" => self.builtin_add_service(args, position),
            "remove_service" => self.builtin_remove_service(args, position),
            "render_templates" => self.builtin_render_templates(args, position),
            "upload_files" => self.builtin_upload_files(args, position),
            "store_service_files" => self.builtin_store_service_files(args, position),
            "exec" => self.builtin_exec(args, position),
            "run_sh" => self.builtin_run_sh(args, position),
            "run_python" => self.builtin_run_python(args, position),
            "wait" => self.builtin_wait(args, position),

            other => Err(interpretation_error_at(
                position,
                &format!("unknown built-in '{other}'"),
            )),
        }
    }

    // =========================================================================
    // Value constructors
    // =========================================================================

    fn builtin_port(&mut self, args: &[CallArg], position: &InstructionPosition) -> Result<Value> {
        let mut bound = self.bind(
            args,
            &["number", "transport", "application_protocol"],
            &["number"],
            position,
        )?;
        let number = bound.take_int("number", position)?;
        let transport = bound.take_opt_string("transport", position)?;
        let app_protocol = bound.take_opt_string("application_protocol", position)?;

        // Range and transport validation happen now so a bad literal fails
        // at its call site, not mid-execution.
        let spec = port_value_to_spec(number, transport.as_deref(), app_protocol.clone(), position)?;

        let mut fields = BTreeMap::new();
        fields.insert("number".to_string(), Value::Int(i64::from(spec.number)));
        fields.insert(
            "transport".to_string(),
            Value::String(spec.transport.to_string()),
        );
        if let Some(app) = spec.maybe_application_protocol {
            fields.insert("application_protocol".to_string(), Value::String(app));
        }
        Ok(Value::Struct {
            kind: "port".to_string(),
            fields,
        })
    }

    fn builtin_config(&mut self, args: &[CallArg], position: &InstructionPosition) -> Result<Value> {
        let mut bound = self.bind(
            args,
            &[
                "image",
                "ports",
                "entrypoint",
                "cmd",
                "env",
                "files",
                "cpu_millis",
                "memory_mb",
                "public_ports",
            ],
            &["image"],
            position,
        )?;

        let mut fields = BTreeMap::new();
        fields.insert(
            "image".to_string(),
            Value::String(bound.take_string("image", position)?),
        );
        for dict_param in ["ports", "env", "files", "public_ports"] {
            if let Some(value) = bound.take_opt(dict_param) {
                expect_dict(&value, dict_param, position)?;
                fields.insert(dict_param.to_string(), value);
            }
        }
        for list_param in ["entrypoint", "cmd"] {
            if let Some(value) = bound.take_opt(list_param) {
                expect_string_list(&value, list_param, position)?;
                fields.insert(list_param.to_string(), value);
            }
        }
        for int_param in ["cpu_millis", "memory_mb"] {
            if let Some(value) = bound.take_opt(int_param) {
                if !matches!(value, Value::Int(n) if n >= 0) {
                    return Err(interpretation_error_at(
                        position,
                        &format!("'{int_param}' must be a non-negative integer"),
                    ));
                }
                fields.insert(int_param.to_string(), value);
            }
        }
        Ok(Value::Struct {
            kind: "config".to_string(),
            fields,
        })
    }

    fn builtin_template_data(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(args, &["template", "data"], &["template", "data"], position)?;
        let template = bound.take_string("template", position)?;
        let data = bound.take("data", position)?;
        let json = match &data {
            Value::Dict(_) => data.to_json(),
            Value::String(raw) => serde_json::from_str(raw).map_err(|e| {
                interpretation_error_at(position, &format!("'data' is not valid JSON: {e}"))
            })?,
            other => {
                return Err(interpretation_error_at(
                    position,
                    &format!("'data' must be a dict or a JSON string, got {}", other.type_name()),
                ))
            }
        };
        let mut fields = BTreeMap::new();
        fields.insert("template".to_string(), Value::String(template));
        fields.insert("data".to_string(), json_to_value(&json));
        Ok(Value::Struct {
            kind: "template_data".to_string(),
            fields,
        })
    }

    fn builtin_read_file(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(args, &["src"], &["src"], position)?;
        let src = bound.take_string("src", position)?;
        let bytes = self.provider.get(&src).map_err(|e| {
            interpretation_error_at(position, &format!("cannot read '{src}': {e}"))
        })?;
        let text = String::from_utf8(bytes).map_err(|_| {
            interpretation_error_at(position, &format!("'{src}' is not valid UTF-8"))
        })?;
        Ok(Value::String(text))
    }

    // =========================================================================
    // Side-effecting built-ins
    // =========================================================================

    fn builtin_add_service(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(args, &["id", "config"], &["id", "config"], position)?;
        let service_id = bound.take_string("id", position)?;
        let config_value = bound.take("config", position)?;
        let config = value_to_service_config(&config_value, position)?;

        if !self.declared_service_ids.insert(service_id.clone()) {
            return Err(interpretation_error_at(
                position,
                &format!("service '{service_id}' is declared twice"),
            ));
        }
        for artifact_id in config.files_artifact_mounts.keys() {
            if !self.declared_artifact_names.contains(artifact_id)
                && uuid::Uuid::parse_str(artifact_id).is_err()
            {
                return Err(interpretation_error_at(
                    position,
                    &format!("unknown artifact identifier '{artifact_id}'"),
                ));
            }
        }

        // The service handle: ports are knowable now, the IP is not.
        let mut handle_fields = BTreeMap::new();
        handle_fields.insert("id".to_string(), Value::String(service_id.clone()));
        handle_fields.insert(
            "ip_address".to_string(),
            Value::String(service_ip_token(&service_id)),
        );
        if let Value::Struct { fields, .. } = &config_value {
            if let Some(ports) = fields.get("ports") {
                handle_fields.insert("ports".to_string(), ports.clone());
            }
        }

        self.push_instruction(
            "add_service",
            position,
            args,
            &["id"],
            InstructionKind::AddService {
                service_id,
                config,
            },
        );
        Ok(Value::Struct {
            kind: "service".to_string(),
            fields: handle_fields,
        })
    }

    fn builtin_remove_service(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(args, &["id"], &["id"], position)?;
        let service_id = bound.take_string("id", position)?;
        self.declared_service_ids.remove(&service_id);
        self.push_instruction(
            "remove_service",
            position,
            args,
            &["id"],
            InstructionKind::RemoveService { service_id },
        );
        Ok(Value::None)
    }

    fn builtin_render_templates(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(args, &["config", "name"], &["config"], position)?;
        let config = bound.take("config", position)?;
        let name = self.artifact_name(bound.take_opt_string("name", position)?, position)?;

        let Value::Dict(entries) = config else {
            return Err(interpretation_error_at(
                position,
                &format!("'config' must be a dict, got {}", config.type_name()),
            ));
        };
        let mut templates = Vec::with_capacity(entries.len());
        for (dest_path, data) in entries {
            let Value::Struct { kind, fields } = &data else {
                return Err(interpretation_error_at(
                    position,
                    &format!(
                        "'config' values must be template_data(...), got {}",
                        data.type_name()
                    ),
                ));
            };
            if kind != "template_data" {
                return Err(interpretation_error_at(
                    position,
                    &format!("'config' values must be template_data(...), got {kind}(...)"),
                ));
            }
            let template = match fields.get("template") {
                Some(Value::String(t)) => t.clone(),
                _ => {
                    return Err(interpretation_error_at(
                        position,
                        "template_data is missing its 'template' string",
                    ))
                }
            };
            let data_json = fields
                .get("data")
                .map(Value::to_json)
                .unwrap_or(serde_json::Value::Null);
            templates.push((dest_path, template, data_json));
        }

        self.push_instruction(
            "render_templates",
            position,
            args,
            &["name"],
            InstructionKind::RenderTemplates {
                name: name.clone(),
                templates,
            },
        );
        Ok(Value::String(name))
    }

    fn builtin_upload_files(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(args, &["src", "name"], &["src"], position)?;
        let src = bound.take_string("src", position)?;
        let name = self.artifact_name(bound.take_opt_string("name", position)?, position)?;

        let bytes = self.provider.get(&src).map_err(|e| {
            interpretation_error_at(position, &format!("cannot read upload source '{src}': {e}"))
        })?;

        self.push_instruction(
            "upload_files",
            position,
            args,
            &["src", "name"],
            InstructionKind::UploadFiles {
                name: name.clone(),
                src,
                bytes,
            },
        );
        Ok(Value::String(name))
    }

    fn builtin_store_service_files(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(
            args,
            &["service_id", "src", "name"],
            &["service_id", "src"],
            position,
        )?;
        let service_id = bound.take_string("service_id", position)?;
        let src_path = bound.take_string("src", position)?;
        let name = self.artifact_name(bound.take_opt_string("name", position)?, position)?;

        self.push_instruction(
            "store_service_files",
            position,
            args,
            &["service_id", "src", "name"],
            InstructionKind::StoreServiceFiles {
                name: name.clone(),
                service_id,
                src_path,
            },
        );
        Ok(Value::String(name))
    }

    fn builtin_exec(&mut self, args: &[CallArg], position: &InstructionPosition) -> Result<Value> {
        let mut bound = self.bind(
            args,
            &["service_id", "command"],
            &["service_id", "command"],
            position,
        )?;
        let service_id = bound.take_string("service_id", position)?;
        let command_value = bound.take("command", position)?;
        expect_string_list(&command_value, "command", position)?;
        let Value::List(items) = command_value else {
            unreachable!("expect_string_list verified the shape");
        };
        let command = items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                _ => unreachable!("expect_string_list verified the shape"),
            })
            .collect();

        let result_key = self.task_key();
        self.push_instruction(
            "exec",
            position,
            args,
            &["service_id"],
            InstructionKind::ExecCommand {
                service_id,
                command,
                result_key: result_key.clone(),
            },
        );
        Ok(task_result_value(&result_key))
    }

    fn builtin_run_sh(&mut self, args: &[CallArg], position: &InstructionPosition) -> Result<Value> {
        let mut bound = self.bind(args, &["run", "image"], &["run"], position)?;
        let run = bound.take_string("run", position)?;
        let image = bound
            .take_opt_string("image", position)?
            .unwrap_or_else(|| RUN_SH_DEFAULT_IMAGE.to_string());

        let result_key = self.task_key();
        self.push_instruction(
            "run_sh",
            position,
            args,
            &["run"],
            InstructionKind::RunSh {
                run,
                image,
                result_key: result_key.clone(),
            },
        );
        Ok(task_result_value(&result_key))
    }

    fn builtin_run_python(
        &mut self,
        args: &[CallArg],
        position: &InstructionPosition,
    ) -> Result<Value> {
        let mut bound = self.bind(args, &["run", "image"], &["run"], position)?;
        let run = bound.take_string("run", position)?;
        let image = bound
            .take_opt_string("image", position)?
            .unwrap_or_else(|| RUN_PYTHON_DEFAULT_IMAGE.to_string());

        let result_key = self.task_key();
        self.push_instruction(
            "run_python",
            position,
            args,
            &["run"],
            InstructionKind::RunPython {
                run,
                image,
                result_key: result_key.clone(),
            },
        );
        Ok(task_result_value(&result_key))
    }

    fn builtin_wait(&mut self, args: &[CallArg], position: &InstructionPosition) -> Result<Value> {
        let mut bound = self.bind(
            args,
            &[
                "service_id",
                "port",
                "path",
                "method",
                "initial_delay_ms",
                "retries",
                "retries_delay_ms",
                "body",
                "expected_body",
            ],
            &["service_id", "port", "path"],
            position,
        )?;
        let service_id = bound.take_string("service_id", position)?;
        let port = bound.take_int("port", position)?;
        let port = u16::try_from(port).map_err(|_| {
            interpretation_error_at(position, &format!("port {port} is out of range"))
        })?;
        let path = bound.take_string("path", position)?;
        let method = match bound.take_opt_string("method", position)?.as_deref() {
            None | Some("GET") => ProbeMethod::Get,
            Some("POST") => ProbeMethod::Post,
            Some(other) => {
                return Err(interpretation_error_at(
                    position,
                    &format!("method must be \"GET\" or \"POST\", got \"{other}\""),
                ))
            }
        };
        let initial_delay_ms = bound.take_opt_int("initial_delay_ms", position)?.unwrap_or(0);
        let retries = bound.take_opt_int("retries", position)?.unwrap_or(10);
        let retries_delay_ms = bound
            .take_opt_int("retries_delay_ms", position)?
            .unwrap_or(1000);
        let body = bound.take_opt_string("body", position)?;
        let expected_body = bound.take_opt_string("expected_body", position)?;

        self.push_instruction(
            "wait",
            position,
            args,
            &["service_id", "port", "path"],
            InstructionKind::Wait {
                service_id,
                method,
                port,
                path,
                initial_delay_ms: initial_delay_ms.max(0) as u64,
                retries: retries.clamp(0, i64::from(u32::MAX)) as u32,
                retries_delay_ms: retries_delay_ms.max(0) as u64,
                body,
                expected_body,
            },
        );
        Ok(Value::None)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn push_instruction(
        &mut self,
        name: &'static str,
        position: &InstructionPosition,
        args: &[CallArg],
        representative: &[&str],
        kind: InstructionKind,
    ) {
        let records = args
            .iter()
            .map(|arg| InstructionArg {
                name: arg.name.clone(),
                source: arg.value.render(),
                representative: arg
                    .name
                    .as_deref()
                    .is_some_and(|n| representative.contains(&n)),
            })
            .collect();
        self.instructions.push(Instruction {
            name,
            position: position.clone(),
            args: records,
            kind,
        });
    }

    fn task_key(&mut self) -> String {
        let key = format!("task-{}", self.next_task_index);
        self.next_task_index += 1;
        key
    }

    /// Resolves (or mints) an artifact name, enforcing in-script uniqueness.
    fn artifact_name(
        &mut self,
        requested: Option<String>,
        position: &InstructionPosition,
    ) -> Result<String> {
        let name = match requested {
            Some(name) => name,
            None => {
                let name = format!("artifact-{}", self.next_artifact_index);
                self.next_artifact_index += 1;
                name
            }
        };
        if !self.declared_artifact_names.insert(name.clone()) {
            return Err(interpretation_error_at(
                position,
                &format!("artifact name '{name}' is declared twice"),
            ));
        }
        Ok(name)
    }

    /// Evaluates and binds call arguments against a parameter list.
    fn bind(
        &mut self,
        args: &[CallArg],
        params: &[&'static str],
        required: &[&'static str],
        position: &InstructionPosition,
    ) -> Result<BoundArgs> {
        let mut values: BTreeMap<String, Value> = BTreeMap::new();

        // Keywords first, then positionals fill the unbound parameters in
        // declaration order.
        for arg in args {
            if let Some(name) = &arg.name {
                if !params.contains(&name.as_str()) {
                    return Err(interpretation_error_at(
                        position,
                        &format!("unexpected argument '{name}'"),
                    ));
                }
                if values.contains_key(name) {
                    return Err(interpretation_error_at(
                        position,
                        &format!("argument '{name}' given twice"),
                    ));
                }
                let value = self.eval(&arg.value)?;
                values.insert(name.clone(), value);
            }
        }
        for arg in args {
            if arg.name.is_none() {
                let Some(param) = params.iter().find(|p| !values.contains_key(**p)) else {
                    return Err(interpretation_error_at(
                        position,
                        &format!("too many arguments (expected at most {})", params.len()),
                    ));
                };
                let value = self.eval(&arg.value)?;
                values.insert((*param).to_string(), value);
            }
        }

        for param in required {
            if !values.contains_key(*param) {
                return Err(interpretation_error_at(
                    position,
                    &format!("missing required argument '{param}'"),
                ));
            }
        }
        Ok(BoundArgs { values })
    }
}

/// Bound argument values, consumed by the typed coercers.
struct BoundArgs {
    values: BTreeMap<String, Value>,
}

impl BoundArgs {
    fn take(&mut self, name: &str, position: &InstructionPosition) -> Result<Value> {
        self.values.remove(name).ok_or_else(|| {
            interpretation_error_at(position, &format!("missing required argument '{name}'"))
        })
    }

    fn take_opt(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    fn take_string(&mut self, name: &str, position: &InstructionPosition) -> Result<String> {
        match self.take(name, position)? {
            Value::String(s) => Ok(s),
            other => Err(interpretation_error_at(
                position,
                &format!("'{name}' must be a string, got {}", other.type_name()),
            )),
        }
    }

    fn take_opt_string(
        &mut self,
        name: &str,
        position: &InstructionPosition,
    ) -> Result<Option<String>> {
        match self.take_opt(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(interpretation_error_at(
                position,
                &format!("'{name}' must be a string, got {}", other.type_name()),
            )),
        }
    }

    fn take_int(&mut self, name: &str, position: &InstructionPosition) -> Result<i64> {
        match self.take(name, position)? {
            Value::Int(n) => Ok(n),
            other => Err(interpretation_error_at(
                position,
                &format!("'{name}' must be an integer, got {}", other.type_name()),
            )),
        }
    }

    fn take_opt_int(
        &mut self,
        name: &str,
        position: &InstructionPosition,
    ) -> Result<Option<i64>> {
        match self.take_opt(name) {
            None => Ok(None),
            Some(Value::Int(n)) => Ok(Some(n)),
            Some(other) => Err(interpretation_error_at(
                position,
                &format!("'{name}' must be an integer, got {}", other.type_name()),
            )),
        }
    }
}

// =============================================================================
// Typed coercions
// =============================================================================

fn expect_dict(value: &Value, name: &str, position: &InstructionPosition) -> Result<()> {
    if matches!(value, Value::Dict(_)) {
        Ok(())
    } else {
        Err(interpretation_error_at(
            position,
            &format!("'{name}' must be a dict, got {}", value.type_name()),
        ))
    }
}

fn expect_string_list(value: &Value, name: &str, position: &InstructionPosition) -> Result<()> {
    let Value::List(items) = value else {
        return Err(interpretation_error_at(
            position,
            &format!("'{name}' must be a list, got {}", value.type_name()),
        ));
    };
    for item in items {
        if !matches!(item, Value::String(_)) {
            return Err(interpretation_error_at(
                position,
                &format!(
                    "'{name}' must contain only strings, got {}",
                    item.type_name()
                ),
            ));
        }
    }
    Ok(())
}

fn port_value_to_spec(
    number: i64,
    transport: Option<&str>,
    application_protocol: Option<String>,
    position: &InstructionPosition,
) -> Result<PortSpec> {
    let number = u16::try_from(number).map_err(|_| {
        interpretation_error_at(position, &format!("port number {number} is out of range"))
    })?;
    let transport = match transport {
        None | Some("tcp") => TransportProtocol::Tcp,
        Some("udp") => TransportProtocol::Udp,
        Some("sctp") => TransportProtocol::Sctp,
        Some(other) => {
            return Err(interpretation_error_at(
                position,
                &format!("unrecognized transport protocol '{other}'"),
            ))
        }
    };
    PortSpec::new(number, transport, application_protocol)
        .map_err(|e| interpretation_error_at(position, &e.to_string()))
}

/// Coerces a `config(...)` struct into the network's [`ServiceConfig`].
fn value_to_service_config(
    value: &Value,
    position: &InstructionPosition,
) -> Result<ServiceConfig> {
    let Value::Struct { kind, fields } = value else {
        return Err(interpretation_error_at(
            position,
            &format!("'config' must be config(...), got {}", value.type_name()),
        ));
    };
    if kind != "config" {
        return Err(interpretation_error_at(
            position,
            &format!("'config' must be config(...), got {kind}(...)"),
        ));
    }

    let mut config = ServiceConfig::default();
    for (field, field_value) in fields {
        match field.as_str() {
            "image" => {
                if let Value::String(image) = field_value {
                    config.image = image.clone();
                }
            }
            "ports" | "public_ports" => {
                let mut ports = BTreeMap::new();
                if let Value::Dict(entries) = field_value {
                    for (port_id, port_value) in entries {
                        ports.insert(
                            port_id.clone(),
                            value_to_port_spec(port_value, position)?,
                        );
                    }
                }
                if field == "ports" {
                    config.private_ports = ports;
                } else {
                    config.maybe_static_public_ports = ports;
                }
            }
            "entrypoint" | "cmd" => {
                if let Value::List(items) = field_value {
                    let strings: Vec<String> = items
                        .iter()
                        .filter_map(|v| match v {
                            Value::String(s) => Some(s.clone()),
                            _ => None,
                        })
                        .collect();
                    if field == "entrypoint" {
                        config.entrypoint = Some(strings);
                    } else {
                        config.cmd = Some(strings);
                    }
                }
            }
            "env" => {
                if let Value::Dict(entries) = field_value {
                    for (key, env_value) in entries {
                        match env_value {
                            Value::String(s) => {
                                config.env.insert(key.clone(), s.clone());
                            }
                            other => {
                                return Err(interpretation_error_at(
                                    position,
                                    &format!(
                                        "env value for '{key}' must be a string, got {}",
                                        other.type_name()
                                    ),
                                ))
                            }
                        }
                    }
                }
            }
            "files" => {
                if let Value::Dict(entries) = field_value {
                    for (artifact_id, mountpoint) in entries {
                        match mountpoint {
                            Value::String(path) => {
                                config
                                    .files_artifact_mounts
                                    .insert(artifact_id.clone(), path.clone());
                            }
                            other => {
                                return Err(interpretation_error_at(
                                    position,
                                    &format!(
                                        "mount path for '{artifact_id}' must be a string, got {}",
                                        other.type_name()
                                    ),
                                ))
                            }
                        }
                    }
                }
            }
            "cpu_millis" => {
                if let Value::Int(n) = field_value {
                    config.cpu_allocation_millicpus = *n as u64;
                }
            }
            "memory_mb" => {
                if let Value::Int(n) = field_value {
                    config.memory_allocation_megabytes = *n as u64;
                }
            }
            _ => {}
        }
    }
    Ok(config)
}

fn value_to_port_spec(value: &Value, position: &InstructionPosition) -> Result<PortSpec> {
    let Value::Struct { kind, fields } = value else {
        return Err(interpretation_error_at(
            position,
            &format!("ports must map to port(...), got {}", value.type_name()),
        ));
    };
    if kind != "port" {
        return Err(interpretation_error_at(
            position,
            &format!("ports must map to port(...), got {kind}(...)"),
        ));
    }
    let number = match fields.get("number") {
        Some(Value::Int(n)) => *n,
        _ => {
            return Err(interpretation_error_at(
                position,
                "port(...) is missing its number",
            ))
        }
    };
    let transport = match fields.get("transport") {
        Some(Value::String(t)) => Some(t.clone()),
        _ => None,
    };
    let app = match fields.get("application_protocol") {
        Some(Value::String(a)) => Some(a.clone()),
        _ => None,
    };
    port_value_to_spec(number, transport.as_deref(), app, position)
}

/// Converts task result keys to the struct handed back to the script.
fn task_result_value(result_key: &str) -> Value {
    let mut fields = BTreeMap::new();
    fields.insert(
        "output".to_string(),
        Value::String(runtime_value_token(result_key, "output")),
    );
    fields.insert(
        "code".to_string(),
        Value::String(runtime_value_token(result_key, "code")),
    );
    Value::Struct {
        kind: "task_result".to_string(),
        fields,
    }
}

/// Converts JSON params into dialect values.
fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Int(n.as_i64().unwrap_or(0)),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => {
            Value::List(items.iter().map(json_to_value).collect())
        }
        serde_json::Value::Object(entries) => Value::Dict(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}
