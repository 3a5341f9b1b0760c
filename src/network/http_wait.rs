//! HTTP endpoint availability probes.
//!
//! Used by the `wait` plan instruction and the wait-for-endpoint RPCs to
//! block until a service's HTTP port answers. The total wait is bounded by
//! `initial_delay + retries * retries_delay` (plus per-request connect
//! time).

use crate::error::{Error, Result};
use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// HTTP method of a probe. Only GET and POST are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Get,
    Post,
}

impl ProbeMethod {
    fn as_http(self) -> Method {
        match self {
            ProbeMethod::Get => Method::GET,
            ProbeMethod::Post => Method::POST,
        }
    }
}

/// One endpoint-availability wait.
#[derive(Debug, Clone)]
pub struct HttpWait {
    pub method: ProbeMethod,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub path: String,
    pub initial_delay: Duration,
    pub retries: u32,
    pub retries_delay: Duration,
    /// Body sent with each POST probe.
    pub body_to_send: Option<String>,
    /// When set, the response body must match exactly for the endpoint to
    /// count as available.
    pub body_to_expect: Option<String>,
}

impl HttpWait {
    fn url(&self) -> String {
        format!(
            "http://{}:{}/{}",
            self.ip,
            self.port,
            self.path.trim_start_matches('/')
        )
    }

    /// Probes until the endpoint answers or the retry budget runs out.
    pub async fn run(&self) -> Result<()> {
        tokio::time::sleep(self.initial_delay).await;

        let mut last_error = String::from("no attempt made");
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.retries_delay).await;
            }
            match self.probe_once().await {
                Ok(()) => {
                    debug!(url = %self.url(), attempt, "endpoint available");
                    return Ok(());
                }
                Err(e) => {
                    debug!(url = %self.url(), attempt, error = %e, "probe failed");
                    last_error = e.to_string();
                }
            }
        }
        warn!(url = %self.url(), retries = self.retries, "endpoint never became available");
        Err(Error::EndpointUnavailable {
            url: self.url(),
            retries: self.retries,
            reason: last_error,
        })
    }

    /// One request against the endpoint.
    async fn probe_once(&self) -> Result<()> {
        let connect = TcpStream::connect((self.ip, self.port));
        let stream = tokio::time::timeout(crate::constants::HTTP_PROBE_CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("connect to {}:{}", self.ip, self.port),
                duration: crate::constants::HTTP_PROBE_CONNECT_TIMEOUT,
            })??;

        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream))
                .await
                .map_err(|e| Error::EndpointUnavailable {
                    url: self.url(),
                    retries: 0,
                    reason: format!("handshake failed: {e}"),
                })?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "probe connection error");
            }
        });

        let body = self.body_to_send.clone().unwrap_or_default();
        let request = Request::builder()
            .method(self.method.as_http())
            .uri(self.url())
            .header("Host", format!("{}:{}", self.ip, self.port))
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Error::Internal(format!("building probe request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::EndpointUnavailable {
                url: self.url(),
                retries: 0,
                reason: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::EndpointUnavailable {
                url: self.url(),
                retries: 0,
                reason: format!("status {status}"),
            });
        }

        if let Some(expected) = &self.body_to_expect {
            let collected = response
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::EndpointUnavailable {
                    url: self.url(),
                    retries: 0,
                    reason: format!("reading body: {e}"),
                })?
                .to_bytes();
            let actual = String::from_utf8_lossy(&collected);
            if actual != expected.as_str() {
                return Err(Error::EndpointUnavailable {
                    url: self.url(),
                    retries: 0,
                    reason: format!("body '{actual}' did not match expected '{expected}'"),
                });
            }
        }
        Ok(())
    }
}
