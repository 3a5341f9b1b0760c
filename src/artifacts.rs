//! Files-artifact store.
//!
//! A uuid-keyed store of tar.gz artifacts inside the enclave data dir,
//! used to seed service filesystems. Artifacts come from four producers:
//! direct upload, web download, copy-from-service, and template rendering.
//!
//! ## Write Model
//!
//! Content bytes are streamed to a unique temp file outside the index lock,
//! then the index is taken to claim the uuid and the temp file is renamed
//! into place. A failed store unlinks its temp file: there is never a
//! partial artifact at a final path, and a uuid once issued is never reused.

use crate::constants::{FILES_ARTIFACTS_DIRNAME, MAX_ARTIFACT_SIZE};
use crate::error::{Error, Result};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// uuid-keyed artifact store backed by one directory.
///
/// ## Thread Safety
///
/// The issued-uuid index sits behind a mutex; content writes happen outside
/// it, so concurrent stores only contend on the rename step.
pub struct FilesArtifactStore {
    artifacts_dir: PathBuf,
    /// Every uuid ever issued by this store, including failed stores.
    issued: Mutex<HashSet<String>>,
}

impl FilesArtifactStore {
    /// Opens (creating if needed) the store inside an enclave data dir.
    pub fn new(enclave_data_dir: &Path) -> Result<Self> {
        let artifacts_dir = enclave_data_dir.join(FILES_ARTIFACTS_DIRNAME);
        fs::create_dir_all(&artifacts_dir).map_err(|e| Error::StoreInitFailed {
            path: artifacts_dir.clone(),
            reason: e.to_string(),
        })?;

        // Artifacts already on disk keep their uuids claimed.
        let mut issued = HashSet::new();
        for entry in fs::read_dir(&artifacts_dir).map_err(|e| Error::StoreInitFailed {
            path: artifacts_dir.clone(),
            reason: e.to_string(),
        })? {
            let entry = entry.map_err(|e| Error::StoreInitFailed {
                path: artifacts_dir.clone(),
                reason: e.to_string(),
            })?;
            if let Some(name) = entry.file_name().to_str() {
                issued.insert(name.to_string());
            }
        }

        debug!(dir = %artifacts_dir.display(), known = issued.len(), "artifact store opened");
        Ok(Self {
            artifacts_dir,
            issued: Mutex::new(issued),
        })
    }

    /// Streams an artifact into the store, returning its fresh uuid.
    pub fn store(&self, reader: &mut dyn Read) -> Result<String> {
        let artifact_uuid = uuid::Uuid::new_v4().to_string();

        // Bytes land in a temp file before the index lock is taken; the
        // content hash is computed on the way through.
        let temp_path = self
            .artifacts_dir
            .join(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        let mut hashing_reader = HashingReader::new(reader);
        let write_result = write_bounded(&temp_path, &mut hashing_reader);
        let content_sha256 = hashing_reader.finish();
        if let Err(e) = write_result {
            if let Err(unlink_err) = fs::remove_file(&temp_path) {
                if unlink_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %unlink_err, "failed to unlink partial artifact");
                }
            }
            return Err(e);
        }

        let final_path = self.artifacts_dir.join(&artifact_uuid);
        {
            let mut issued = self
                .issued
                .lock()
                .map_err(|e| Error::Internal(format!("artifact index poisoned: {e}")))?;
            if !issued.insert(artifact_uuid.clone()) {
                // A v4 collision; bail rather than overwrite.
                let _ = fs::remove_file(&temp_path);
                return Err(Error::ArtifactAlreadyExists(artifact_uuid));
            }
            if let Err(e) = fs::rename(&temp_path, &final_path) {
                issued.remove(&artifact_uuid);
                let _ = fs::remove_file(&temp_path);
                return Err(Error::StoreWriteFailed(e.to_string()));
            }
        }

        info!(uuid = %artifact_uuid, sha256 = %content_sha256, "stored files artifact");
        Ok(artifact_uuid)
    }

    /// Stores a byte buffer.
    pub fn store_bytes(&self, bytes: &[u8]) -> Result<String> {
        let mut cursor = std::io::Cursor::new(bytes);
        self.store(&mut cursor)
    }

    /// Opens a stored artifact for reading.
    pub fn get(&self, artifact_uuid: &str) -> Result<fs::File> {
        let path = self.path_of(artifact_uuid)?;
        fs::File::open(path).map_err(|_| Error::ArtifactNotFound(artifact_uuid.to_string()))
    }

    /// Absolute path of a stored artifact.
    pub fn path_of(&self, artifact_uuid: &str) -> Result<PathBuf> {
        let path = self.artifacts_dir.join(artifact_uuid);
        if !path.is_file() {
            return Err(Error::ArtifactNotFound(artifact_uuid.to_string()));
        }
        Ok(path)
    }

    /// True if the uuid names a stored artifact.
    pub fn exists(&self, artifact_uuid: &str) -> bool {
        self.artifacts_dir.join(artifact_uuid).is_file()
    }

    /// Every stored artifact uuid.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut uuids = Vec::new();
        for entry in fs::read_dir(&self.artifacts_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with("tmp.") {
                    uuids.push(name.to_string());
                }
            }
        }
        uuids.sort();
        Ok(uuids)
    }

    /// Downloads a web resource and stores it as an artifact.
    ///
    /// Only `http` URLs are fetched; TLS termination belongs to the proxy
    /// layer in front of the runtime.
    pub async fn store_web_files(&self, url: &str) -> Result<String> {
        let bytes = download(url).await?;
        self.store_bytes(&bytes)
    }

    /// Renders a set of templates into a fresh tar.gz artifact.
    ///
    /// `templates` maps destination paths (inside the artifact) to a
    /// (template, params) pair; every `{{.field}}` token in the template is
    /// replaced by the named field of the JSON params.
    pub fn render_templates(
        &self,
        templates: &[(String, String, serde_json::Value)],
    ) -> Result<String> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (dest_path, template, params) in templates {
            let rendered = render_template(template, params).map_err(|reason| {
                Error::TemplateRenderFailed {
                    path: dest_path.clone(),
                    reason,
                }
            })?;
            let mut header = tar::Header::new_gnu();
            header.set_size(rendered.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(
                    &mut header,
                    dest_path.trim_start_matches('/'),
                    rendered.as_bytes(),
                )
                .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
        let bytes = encoder
            .finish()
            .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
        self.store_bytes(&bytes)
    }
}

/// Hashes everything read through it, so the content digest falls out of
/// the same pass that writes the bytes.
struct HashingReader<'a> {
    inner: &'a mut dyn Read,
    hasher: Sha256,
}

impl<'a> HashingReader<'a> {
    fn new(inner: &'a mut dyn Read) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl Read for HashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Writes a bounded copy of `reader` to `path`.
fn write_bounded(path: &Path, reader: &mut dyn Read) -> Result<()> {
    let file = fs::File::create(path).map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
    let mut writer = std::io::BufWriter::new(file);
    let mut limited = reader.take(MAX_ARTIFACT_SIZE + 1);
    let copied =
        std::io::copy(&mut limited, &mut writer).map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
    if copied > MAX_ARTIFACT_SIZE {
        return Err(Error::StoreWriteFailed(format!(
            "artifact exceeds the {MAX_ARTIFACT_SIZE}-byte limit"
        )));
    }
    writer
        .flush()
        .map_err(|e| Error::StoreWriteFailed(e.to_string()))?;
    Ok(())
}

// =============================================================================
// Template rendering
// =============================================================================

/// Substitutes `{{.a.b}}` tokens with fields from JSON params.
///
/// Unknown fields are errors, not empty strings, so a typo in a template
/// fails the render instead of silently producing a blank.
fn render_template(template: &str, params: &serde_json::Value) -> std::result::Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let (before, after_open) = rest.split_at(start);
        output.push_str(before);
        let after_open = &after_open[2..];
        let end = after_open
            .find("}}")
            .ok_or_else(|| "unterminated '{{' in template".to_string())?;
        let token = after_open[..end].trim();
        let path = token
            .strip_prefix('.')
            .ok_or_else(|| format!("template token '{token}' must start with '.'"))?;

        let mut value = params;
        if !path.is_empty() {
            for segment in path.split('.') {
                value = value
                    .get(segment)
                    .ok_or_else(|| format!("template field '.{path}' not found in params"))?;
            }
        }
        match value {
            serde_json::Value::String(s) => output.push_str(s),
            other => output.push_str(&other.to_string()),
        }
        rest = &after_open[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

// =============================================================================
// Web download
// =============================================================================

/// Fetches an http URL into memory.
async fn download(url: &str) -> Result<Vec<u8>> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| Error::StoreWriteFailed(format!("invalid URL '{url}': {e}")))?;
    if uri.scheme_str() != Some("http") {
        return Err(Error::StoreWriteFailed(format!(
            "only http URLs are supported for web artifacts, got '{url}'"
        )));
    }
    let host = uri
        .host()
        .ok_or_else(|| Error::StoreWriteFailed(format!("URL '{url}' has no host")))?
        .to_string();
    let port = uri.port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| Error::StoreWriteFailed(format!("connecting to '{host}:{port}': {e}")))?;
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| Error::StoreWriteFailed(format!("handshake with '{host}': {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "web artifact connection error");
        }
    });

    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(url)
        .header("Host", host.clone())
        .body(Empty::new())
        .map_err(|e| Error::Internal(format!("building download request: {e}")))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| Error::StoreWriteFailed(format!("downloading '{url}': {e}")))?;
    if !response.status().is_success() {
        return Err(Error::StoreWriteFailed(format!(
            "downloading '{url}': status {}",
            response.status()
        )));
    }
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::StoreWriteFailed(format!("reading '{url}': {e}")))?
        .to_bytes();
    if bytes.len() as u64 > MAX_ARTIFACT_SIZE {
        return Err(Error::StoreWriteFailed(format!(
            "artifact exceeds the {MAX_ARTIFACT_SIZE}-byte limit"
        )));
    }
    Ok(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_store_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FilesArtifactStore::new(temp.path()).unwrap();

        let data = b"some tarball bytes";
        let uuid = store.store_bytes(data).unwrap();

        let mut retrieved = Vec::new();
        store.get(&uuid).unwrap().read_to_end(&mut retrieved).unwrap();
        assert_eq!(retrieved, data);
    }

    #[test]
    fn test_uuids_are_never_reused() {
        let temp = TempDir::new().unwrap();
        let store = FilesArtifactStore::new(temp.path()).unwrap();

        let u1 = store.store_bytes(b"one").unwrap();
        let u2 = store.store_bytes(b"two").unwrap();
        assert_ne!(u1, u2);
    }

    #[test]
    fn test_get_unknown_uuid_fails() {
        let temp = TempDir::new().unwrap();
        let store = FilesArtifactStore::new(temp.path()).unwrap();
        assert!(matches!(
            store.get("no-such-uuid"),
            Err(Error::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_reopened_store_sees_existing_artifacts() {
        let temp = TempDir::new().unwrap();
        let uuid = {
            let store = FilesArtifactStore::new(temp.path()).unwrap();
            store.store_bytes(b"persistent").unwrap()
        };
        let store = FilesArtifactStore::new(temp.path()).unwrap();
        assert!(store.exists(&uuid));
        assert_eq!(store.list().unwrap(), vec![uuid]);
    }

    #[test]
    fn test_render_template_substitution() {
        let rendered = render_template("{{.x}}", &json!({"x": 1})).unwrap();
        assert_eq!(rendered, "1");

        let rendered = render_template(
            "hello {{.who.name}}, you are {{.who.age}}",
            &json!({"who": {"name": "ada", "age": 36}}),
        )
        .unwrap();
        assert_eq!(rendered, "hello ada, you are 36");
    }

    #[test]
    fn test_render_template_unknown_field_fails() {
        let err = render_template("{{.missing}}", &json!({"x": 1})).unwrap_err();
        assert!(err.contains(".missing"));
    }

    #[test]
    fn test_render_template_unterminated_token_fails() {
        assert!(render_template("{{.x", &json!({"x": 1})).is_err());
    }

    #[test]
    fn test_render_templates_produces_tgz_artifact() {
        let temp = TempDir::new().unwrap();
        let store = FilesArtifactStore::new(temp.path()).unwrap();

        let uuid = store
            .render_templates(&[(
                "/a.txt".to_string(),
                "{{.x}}".to_string(),
                json!({"x": 1}),
            )])
            .unwrap();

        let file = store.get(&uuid).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("a.txt"));
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "1");
    }

    #[test]
    fn test_failed_store_leaves_no_partial_file() {
        struct FailingReader;
        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("reader exploded"))
            }
        }

        let temp = TempDir::new().unwrap();
        let store = FilesArtifactStore::new(temp.path()).unwrap();
        assert!(store.store(&mut FailingReader).is_err());
        assert!(store.list().unwrap().is_empty());
        // No temp leftovers either.
        let leftovers: Vec<_> = fs::read_dir(temp.path().join(FILES_ARTIFACTS_DIRNAME))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }
}
