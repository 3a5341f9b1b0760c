//! Wire protocol of the runtime's RPC surface.
//!
//! # Protocol Format
//!
//! - **Transport**: TCP
//! - **Encoding**: JSON
//! - **Framing**: length-prefixed — a 4-byte big-endian payload length
//!   followed by exactly one JSON message
//!
//! Field names below are part of the wire contract and must not change;
//! renaming one orphans every client built against an earlier runtime.
//!
//! # Request/Response Flow
//!
//! ```text
//! Client                               Runtime
//!   |  [len]{"method":"handshake",...}   |
//!   |----------------------------------->|
//!   |  [len]{"kind":"handshake",...}     |
//!   |<-----------------------------------|
//!   |  [len]{"method":"run_script",...}  |
//!   |----------------------------------->|
//!   |  [len]{"kind":"line",...}  (xN)    |
//!   |<-----------------------------------|
//!   |  ... terminated by a run-finished line
//! ```
//!
//! Unary requests get exactly one response frame; `run_script`,
//! `run_package` and `get_service_logs` stream frames until their terminal
//! marker.

use crate::constants::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use crate::enclave::EnclaveInfo;
use crate::error::{Error, Result};
use crate::plan::ResponseLine;
use crate::port_spec::PortSpec;
use crate::service::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// =============================================================================
// Requests
// =============================================================================

/// Content of a `run_package` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PackageContent {
    /// The package archive travels inline, hex-encoded tar.gz.
    Local {
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
    /// The package must be fetched by an external content provider.
    Remote,
}

/// One pairwise partition connection in a repartition request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub first: String,
    pub second: String,
    pub packet_loss_percentage: f32,
}

/// One template in a render request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub path: String,
    pub template: String,
    pub data: serde_json::Value,
}

/// Request from a client to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Version agreement; must be the first frame on a connection.
    Handshake { protocol_version: u32 },

    // ========================= Plan runs =========================
    RunScript {
        enclave_id: String,
        script: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        dry_run: bool,
    },
    RunPackage {
        enclave_id: String,
        package_id: String,
        content: PackageContent,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        dry_run: bool,
    },

    // ========================= Services =========================
    RegisterService {
        enclave_id: String,
        service_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        partition: Option<String>,
    },
    StartServices {
        enclave_id: String,
        configs: BTreeMap<String, ServiceConfig>,
    },
    GetServices {
        enclave_id: String,
    },
    RemoveService {
        enclave_id: String,
        service_id: String,
        #[serde(default)]
        stop_timeout_secs: Option<u64>,
    },
    Repartition {
        enclave_id: String,
        partition_services: BTreeMap<String, BTreeSet<String>>,
        connections: Vec<ConnectionSpec>,
        default_packet_loss_percentage: f32,
    },
    PauseService {
        enclave_id: String,
        service_id: String,
    },
    UnpauseService {
        enclave_id: String,
        service_id: String,
    },
    ExecCommand {
        enclave_id: String,
        service_id: String,
        argv: Vec<String>,
    },
    WaitForHttpGetEndpointAvailability {
        enclave_id: String,
        service_id: String,
        port: u16,
        path: String,
        initial_delay_ms: u64,
        retries: u32,
        retries_delay_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_to_expect: Option<String>,
    },
    WaitForHttpPostEndpointAvailability {
        enclave_id: String,
        service_id: String,
        port: u16,
        path: String,
        initial_delay_ms: u64,
        retries: u32,
        retries_delay_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_to_send: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        body_to_expect: Option<String>,
    },

    // ========================= Artifacts =========================
    UploadFilesArtifact {
        enclave_id: String,
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
    StoreWebFilesArtifact {
        enclave_id: String,
        url: String,
    },
    StoreFilesArtifactFromService {
        enclave_id: String,
        service_id: String,
        src_path: String,
    },
    RenderTemplatesToFilesArtifact {
        enclave_id: String,
        templates: Vec<TemplateSpec>,
    },

    // ========================= Engine level =========================
    CreateEnclave {
        enclave_id: String,
        #[serde(default)]
        partitioning_enabled: bool,
    },
    DestroyEnclave {
        enclave_id: String,
    },
    GetEnclaves {},
    GetServiceLogs {
        enclave_id: String,
        #[serde(default)]
        service_ids: BTreeSet<String>,
    },
}

// =============================================================================
// Responses
// =============================================================================

/// One service row in a `get_services` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub service_id: String,
    pub guid: String,
    pub status: String,
    pub private_ip: String,
    pub private_ports: BTreeMap<String, PortSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maybe_public_ip: Option<String>,
    pub maybe_public_ports: BTreeMap<String, PortSpec>,
}

/// Response from the runtime to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Handshake {
        protocol_version: u32,
    },
    /// Success with nothing else to say.
    Ok {},
    /// Request-level failure.
    Error {
        message: String,
        not_found: bool,
    },
    /// One line of a streamed plan run.
    Line {
        line: ResponseLine,
    },
    ServiceRegistered {
        private_ip: String,
        relative_data_dir: String,
    },
    ServicesStarted {
        successes: BTreeMap<String, ServiceSummary>,
        failures: BTreeMap<String, String>,
    },
    Services {
        services: Vec<ServiceSummary>,
    },
    ServiceRemoved {
        guid: String,
    },
    Repartitioned {
        failures: BTreeMap<String, String>,
    },
    ExecResult {
        exit_code: i32,
        output: String,
    },
    Artifact {
        uuid: String,
    },
    Enclaves {
        enclaves: Vec<EnclaveInfo>,
    },
    /// One streamed log line; a `LogsFinished` frame terminates the stream.
    LogLine {
        guid: String,
        line: String,
    },
    LogsFinished {},
}

impl Response {
    /// Builds the error response for a runtime error.
    #[must_use]
    pub fn error(e: &Error) -> Self {
        Response::Error {
            message: e.to_string(),
            not_found: e.is_not_found(),
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Protocol("frame exceeds u32 length".to_string()))?;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_SIZE}-byte limit"
        )));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON frame. Returns `None` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_SIZE}-byte limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    let message = serde_json::from_slice(&payload)
        .map_err(|e| Error::Protocol(format!("malformed frame: {e}")))?;
    Ok(Some(message))
}

/// The handshake response every connection starts with.
#[must_use]
pub fn handshake_response() -> Response {
    Response::Handshake {
        protocol_version: PROTOCOL_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let request = Request::RunScript {
            enclave_id: "e1".to_string(),
            script: "add_service(id=\"db\")".to_string(),
            params: serde_json::json!({}),
            dry_run: true,
        };

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &request).await.unwrap();

        let mut cursor = std::io::Cursor::new(buffer);
        let parsed: Request = read_frame(&mut cursor).await.unwrap().unwrap();
        match parsed {
            Request::RunScript {
                enclave_id,
                dry_run,
                ..
            } => {
                assert_eq!(enclave_id, "e1");
                assert!(dry_run);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_eof_at_frame_boundary_is_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let parsed: Option<Request> = read_frame(&mut cursor).await.unwrap();
        assert!(parsed.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        let result: Result<Option<Request>> = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_wire_field_names_are_stable() {
        let request = Request::Handshake {
            protocol_version: 1,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"method\":\"handshake\""));
        assert!(json.contains("\"protocol_version\":1"));

        let response = Response::Error {
            message: "nope".to_string(),
            not_found: false,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"kind\":\"error\""));

        let upload = Request::UploadFilesArtifact {
            enclave_id: "e1".to_string(),
            data: vec![0xab, 0xcd],
        };
        let json = serde_json::to_string(&upload).unwrap();
        assert!(json.contains("\"data\":\"abcd\""));
    }
}
