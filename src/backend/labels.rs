//! Label map construction for backend objects.
//!
//! Every object the runtime creates on a backend carries the stable label
//! keys from [`crate::constants`]. The maps built here are the only place
//! those keys are combined, so label coverage stays uniform across the
//! daemon and cluster variants.

use crate::constants::{
    APP_ID_LABEL_KEY, APP_ID_LABEL_VALUE, ENCLAVE_ID_LABEL_KEY, GUID_LABEL_KEY, ID_LABEL_KEY,
    PARTITIONING_ENABLED_LABEL_KEY, PORT_SPECS_LABEL_KEY, PRIVATE_IP_LABEL_KEY,
    RESOURCE_TYPE_ARTIFACT_VOLUME, RESOURCE_TYPE_LABEL_KEY, RESOURCE_TYPE_NETWORK,
    RESOURCE_TYPE_SIDECAR, RESOURCE_TYPE_USER_SERVICE,
};
use crate::enclave::EnclaveId;
use crate::port_spec::{serialize_port_map, PortSpec};
use crate::service::ServiceRegistration;
use std::collections::BTreeMap;

/// Labels common to every object in an enclave.
fn base_labels(enclave_id: &EnclaveId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_ID_LABEL_KEY.to_string(), APP_ID_LABEL_VALUE.to_string()),
        (ENCLAVE_ID_LABEL_KEY.to_string(), enclave_id.to_string()),
    ])
}

/// Labels for the enclave network object.
#[must_use]
pub fn network_labels(
    enclave_id: &EnclaveId,
    partitioning_enabled: bool,
) -> BTreeMap<String, String> {
    let mut labels = base_labels(enclave_id);
    labels.insert(
        RESOURCE_TYPE_LABEL_KEY.to_string(),
        RESOURCE_TYPE_NETWORK.to_string(),
    );
    labels.insert(
        PARTITIONING_ENABLED_LABEL_KEY.to_string(),
        partitioning_enabled.to_string(),
    );
    labels
}

/// Labels for a user-service container.
#[must_use]
pub fn service_labels(
    enclave_id: &EnclaveId,
    registration: &ServiceRegistration,
    private_ports: &BTreeMap<String, PortSpec>,
) -> BTreeMap<String, String> {
    let mut labels = base_labels(enclave_id);
    labels.insert(
        RESOURCE_TYPE_LABEL_KEY.to_string(),
        RESOURCE_TYPE_USER_SERVICE.to_string(),
    );
    labels.insert(GUID_LABEL_KEY.to_string(), registration.guid.to_string());
    labels.insert(ID_LABEL_KEY.to_string(), registration.id.to_string());
    labels.insert(
        PRIVATE_IP_LABEL_KEY.to_string(),
        registration.private_ip.to_string(),
    );
    labels.insert(
        PORT_SPECS_LABEL_KEY.to_string(),
        serialize_port_map(private_ports),
    );
    labels
}

/// Labels for a traffic-shaping sidecar container.
#[must_use]
pub fn sidecar_labels(
    enclave_id: &EnclaveId,
    service_guid: &crate::service::ServiceGuid,
) -> BTreeMap<String, String> {
    let mut labels = base_labels(enclave_id);
    labels.insert(
        RESOURCE_TYPE_LABEL_KEY.to_string(),
        RESOURCE_TYPE_SIDECAR.to_string(),
    );
    labels.insert(GUID_LABEL_KEY.to_string(), service_guid.to_string());
    labels
}

/// Labels for a files-artifact volume.
#[must_use]
pub fn artifact_volume_labels(
    enclave_id: &EnclaveId,
    artifact_uuid: &str,
) -> BTreeMap<String, String> {
    let mut labels = base_labels(enclave_id);
    labels.insert(
        RESOURCE_TYPE_LABEL_KEY.to_string(),
        RESOURCE_TYPE_ARTIFACT_VOLUME.to_string(),
    );
    labels.insert(ID_LABEL_KEY.to_string(), artifact_uuid.to_string());
    labels
}

/// Renders labels as repeated `--label key=value` CLI arguments.
#[must_use]
pub fn to_cli_args(labels: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(labels.len() * 2);
    for (key, value) in labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    args
}
