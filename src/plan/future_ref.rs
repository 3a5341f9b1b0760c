//! Future-reference tokens and their resolution.
//!
//! A future reference is a magic string standing in for a value that is
//! unknowable at interpretation time. Tokens are delimited by `{{` / `}}`
//! and name a resolver plus its arguments:
//!
//! | Token | Resolves to |
//! |-------|-------------|
//! | `{{service:<id>:ip_address}}` | the service's private IP |
//! | `{{service:<id>:port:<port-id>}}` | the service's private port number |
//! | `{{runtime_value:<key>:<field>}}` | a field stored by an earlier instruction |
//!
//! Because tokens are plain strings they can be embedded anywhere a string
//! argument goes; resolution is a replacement pass over every string-typed
//! argument of an instruction, run immediately before the instruction's
//! effect.

use crate::constants::{FUTURE_REF_PREFIX, FUTURE_REF_SUFFIX};
use crate::error::{Error, Result};
use crate::network::ServiceNetwork;
use crate::service::ServiceId;
use std::collections::BTreeMap;
use std::sync::Mutex;

// =============================================================================
// Token construction
// =============================================================================

/// Token for a service's private IP.
#[must_use]
pub fn service_ip_token(service_id: &str) -> String {
    format!("{FUTURE_REF_PREFIX}service:{service_id}:ip_address{FUTURE_REF_SUFFIX}")
}

/// Token for a service's private port number.
#[must_use]
pub fn service_port_token(service_id: &str, port_id: &str) -> String {
    format!("{FUTURE_REF_PREFIX}service:{service_id}:port:{port_id}{FUTURE_REF_SUFFIX}")
}

/// Token for a runtime value stored by an earlier instruction.
#[must_use]
pub fn runtime_value_token(key: &str, field: &str) -> String {
    format!("{FUTURE_REF_PREFIX}runtime_value:{key}:{field}{FUTURE_REF_SUFFIX}")
}

// =============================================================================
// Runtime value store
// =============================================================================

/// Values produced at execution time and referenced by later instructions:
/// exec output, task exit codes, artifact uuids.
#[derive(Debug, Default)]
pub struct RuntimeValueStore {
    values: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl RuntimeValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one field under a key.
    pub fn set(&self, key: &str, field: &str, value: impl Into<String>) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// Fetches one field.
    pub fn get(&self, key: &str, field: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).and_then(|fields| fields.get(field)).cloned()
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolves every future-reference token inside a string.
///
/// Strings without tokens pass through untouched. An unknown resolver,
/// unknown service, undeclared port or missing runtime value is an error
/// naming the offending token.
pub async fn resolve_string(
    input: &str,
    network: &ServiceNetwork,
    runtime_values: &RuntimeValueStore,
) -> Result<String> {
    if !input.contains(FUTURE_REF_PREFIX) {
        return Ok(input.to_string());
    }

    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find(FUTURE_REF_PREFIX) {
        let (before, token_onward) = rest.split_at(start);
        output.push_str(before);
        let token_body_onward = &token_onward[FUTURE_REF_PREFIX.len()..];
        let Some(end) = token_body_onward.find(FUTURE_REF_SUFFIX) else {
            // An unterminated prefix is ordinary text, not a token.
            output.push_str(token_onward);
            return Ok(output);
        };
        let token_body = &token_body_onward[..end];
        let full_token = &token_onward[..FUTURE_REF_PREFIX.len() + end + FUTURE_REF_SUFFIX.len()];

        let resolved = resolve_token(token_body, full_token, network, runtime_values).await?;
        output.push_str(&resolved);
        rest = &token_body_onward[end + FUTURE_REF_SUFFIX.len()..];
    }
    output.push_str(rest);
    Ok(output)
}

async fn resolve_token(
    body: &str,
    full_token: &str,
    network: &ServiceNetwork,
    runtime_values: &RuntimeValueStore,
) -> Result<String> {
    let parts: Vec<&str> = body.split(':').collect();
    match parts.as_slice() {
        ["service", service_id, "ip_address"] => {
            let info = network
                .get_service_info(&ServiceId::new(*service_id))
                .await
                .map_err(|e| unresolvable(full_token, &e.to_string()))?;
            Ok(info.registration.private_ip.to_string())
        }
        ["service", service_id, "port", port_id] => {
            let info = network
                .get_service_info(&ServiceId::new(*service_id))
                .await
                .map_err(|e| unresolvable(full_token, &e.to_string()))?;
            let port = info.private_ports.get(*port_id).ok_or_else(|| {
                unresolvable(
                    full_token,
                    &format!("service '{service_id}' declares no port '{port_id}'"),
                )
            })?;
            Ok(port.number.to_string())
        }
        ["runtime_value", key, field] => runtime_values.get(key, field).ok_or_else(|| {
            unresolvable(full_token, &format!("no runtime value '{key}.{field}'"))
        }),
        _ => Err(unresolvable(full_token, "unrecognized resolver")),
    }
}

fn unresolvable(token: &str, reason: &str) -> Error {
    Error::UnresolvableReference {
        token: token.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_syntax() {
        assert_eq!(
            service_ip_token("svc-foo"),
            "{{service:svc-foo:ip_address}}"
        );
        assert_eq!(
            service_port_token("db", "pg"),
            "{{service:db:port:pg}}"
        );
        assert_eq!(
            runtime_value_token("task-1", "output"),
            "{{runtime_value:task-1:output}}"
        );
    }

    #[test]
    fn test_runtime_value_store() {
        let store = RuntimeValueStore::new();
        store.set("task-1", "code", "0");
        assert_eq!(store.get("task-1", "code").as_deref(), Some("0"));
        assert_eq!(store.get("task-1", "output"), None);
        assert_eq!(store.get("task-2", "code"), None);
    }
}
