#![forbid(unsafe_code)]

//! Secret resolution for the Skyward binaries.
//!
//! Startup decodes the bootstrap blob, uses the recovered identity to fetch
//! the real operating credential from the secret service, installs it as
//! process-wide state and resolves the YouTube API key with it. Every step is
//! fail-fast: there is no default credential to fall back to, so any failure
//! aborts the caller's startup.

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use crate::credentials::{CredentialError, ServiceCredential};
use crate::store::RelayReader;

/// Secret holding the real operating credential, fetched with the bootstrap
/// identity during startup.
pub const OPERATOR_CREDENTIAL_SECRET: &str = "operator_credential";
/// Secret holding the YouTube Data API key, fetched with the real identity.
pub const YOUTUBE_API_KEY_SECRET: &str = "youtube_api_key";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0:?} is not registered")]
    NotFound(String),
    #[error("secret reference lookup failed: {0}")]
    Storage(String),
    #[error("secret fetch failed: {0}")]
    Fetch(String),
    #[error("secret payload is not valid UTF-8")]
    Decode(#[from] std::string::FromUtf8Error),
    #[error("no operating credential installed")]
    Unavailable,
}

/// Signing identity derived from a [`ServiceCredential`]. Requests to the
/// secret service carry an ed25519 signature over `method\npath\ntimestamp`.
pub struct SigningIdentity {
    account_id: String,
    key: SigningKey,
}

impl SigningIdentity {
    pub fn from_credential(credential: &ServiceCredential) -> Result<Self, CredentialError> {
        let seed = BASE64
            .decode(credential.private_key.trim())
            .map_err(|_| CredentialError::Key("private_key is not valid base64"))?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| CredentialError::Key("private_key must decode to 32 bytes"))?;
        Ok(Self {
            account_id: credential.account_id.clone(),
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.key.verifying_key().as_bytes())
    }

    pub fn sign_request(&self, method: &str, path: &str, timestamp: i64) -> String {
        let message = format!("{method}\n{path}\n{timestamp}");
        BASE64.encode(self.key.sign(message.as_bytes()).to_bytes())
    }

    #[cfg(test)]
    fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }
}

/// Seam between the resolver and the secret-management service. The
/// production implementation speaks HTTP; tests substitute a table.
pub trait SecretTransport: Send + Sync {
    /// Fetches the latest version of the secret behind `locator`, returning
    /// its raw payload bytes.
    fn fetch_latest(&self, identity: &SigningIdentity, locator: &str)
    -> Result<Vec<u8>, SecretError>;
}

/// `GET {endpoint}/v1/{locator}/versions/latest:access` with signature
/// headers; the body is `{"payload": {"data": "<base64>"}}`.
pub struct HttpSecretTransport {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpSecretTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build();
        Self { endpoint, agent }
    }
}

fn access_path(locator: &str) -> String {
    format!("/v1/{locator}/versions/latest:access")
}

#[derive(Deserialize)]
struct AccessResponse {
    payload: AccessPayload,
}

#[derive(Deserialize)]
struct AccessPayload {
    data: String,
}

fn parse_access_body(body: &str) -> Result<Vec<u8>, SecretError> {
    let response: AccessResponse = serde_json::from_str(body)
        .map_err(|err| SecretError::Fetch(format!("unexpected response body: {err}")))?;
    BASE64
        .decode(response.payload.data.as_bytes())
        .map_err(|err| SecretError::Fetch(format!("payload is not valid base64: {err}")))
}

impl SecretTransport for HttpSecretTransport {
    fn fetch_latest(
        &self,
        identity: &SigningIdentity,
        locator: &str,
    ) -> Result<Vec<u8>, SecretError> {
        let path = access_path(locator);
        let url = format!("{}{}", self.endpoint, path);
        let timestamp = Utc::now().timestamp();
        let signature = identity.sign_request("GET", &path, timestamp);

        let response = self
            .agent
            .get(&url)
            .set("X-Skyward-Account", identity.account_id())
            .set("X-Skyward-Timestamp", &timestamp.to_string())
            .set("X-Skyward-Signature", &signature)
            .call()
            .map_err(|err| SecretError::Fetch(err.to_string()))?;

        let body = response
            .into_string()
            .map_err(|err| SecretError::Fetch(err.to_string()))?;
        parse_access_body(&body)
    }
}

/// Process-wide slot holding a value that is installed once and afterwards
/// only replaced wholesale. Readers clone the inner `Arc`, so a concurrent
/// replace can never expose a partially written value.
pub struct SharedSlot<T> {
    inner: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T> SharedSlot<T> {
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    pub fn install(&self, value: T) {
        self.install_arc(Arc::new(value));
    }

    pub fn install_arc(&self, value: Arc<T>) {
        *self.inner.write() = Some(value);
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.inner.read().clone()
    }

    pub fn is_installed(&self) -> bool {
        self.inner.read().is_some()
    }
}

impl<T> Clone for SharedSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for SharedSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Resolves named secrets against the local reference table plus the secret
/// service, and owns the process-wide credential and API-key state.
pub struct SecretResolver {
    reader: RelayReader,
    transport: Arc<dyn SecretTransport>,
    credential: SharedSlot<ServiceCredential>,
    identity: SharedSlot<SigningIdentity>,
    api_key: SharedSlot<String>,
}

impl SecretResolver {
    pub fn new(reader: RelayReader, transport: Arc<dyn SecretTransport>) -> Self {
        Self {
            reader,
            transport,
            credential: SharedSlot::empty(),
            identity: SharedSlot::empty(),
            api_key: SharedSlot::empty(),
        }
    }

    /// Runs the startup chain: blob -> bootstrap identity -> real credential
    /// -> credential file -> YouTube API key. Called exactly once per process
    /// before any request is served; any error leaves every slot unset.
    pub async fn bootstrap(&self, blob_path: &Path, credential_file: &Path) -> Result<()> {
        let bootstrap = ServiceCredential::from_blob_file(blob_path)
            .context("reading bootstrap credential blob")?;
        let bootstrap_identity = Arc::new(
            SigningIdentity::from_credential(&bootstrap)
                .context("building bootstrap signing identity")?,
        );

        let real_json = self
            .resolve_with(&bootstrap_identity, OPERATOR_CREDENTIAL_SECRET)
            .await
            .context("fetching operating credential")?;
        let real = ServiceCredential::from_json(&real_json)
            .context("parsing operating credential")?;
        let real_identity = Arc::new(
            SigningIdentity::from_credential(&real)
                .context("building operating signing identity")?,
        );

        // Compatibility shim for collaborators that expect ambient credential
        // files; rewritten on every startup, never left stale.
        write_text_atomic(credential_file, &real_json)
            .with_context(|| format!("writing {}", credential_file.display()))?;

        let api_key = self
            .resolve_with(&real_identity, YOUTUBE_API_KEY_SECRET)
            .await
            .context("resolving YouTube API key")?;

        self.credential.install(real);
        self.identity.install_arc(real_identity);
        self.api_key.install(api_key);
        Ok(())
    }

    /// Looks up a named secret with the installed operating identity.
    pub async fn resolve(&self, name: &str) -> Result<String, SecretError> {
        let identity = self.identity.get().ok_or(SecretError::Unavailable)?;
        self.resolve_with(&identity, name).await
    }

    /// Looks up a named secret with an explicit identity; the bootstrap
    /// sequence uses this before anything is installed.
    pub async fn resolve_with(
        &self,
        identity: &Arc<SigningIdentity>,
        name: &str,
    ) -> Result<String, SecretError> {
        let locator = self
            .reader
            .secret_locator(name)
            .await
            .map_err(|err| SecretError::Storage(err.to_string()))?
            .ok_or_else(|| SecretError::NotFound(name.to_string()))?;

        let transport = self.transport.clone();
        let identity = identity.clone();
        let bytes = tokio::task::spawn_blocking(move || transport.fetch_latest(&identity, &locator))
            .await
            .map_err(|err| SecretError::Fetch(format!("secret fetch task failed: {err}")))??;
        Ok(String::from_utf8(bytes)?)
    }

    /// Re-resolves the YouTube API key and replaces the shared slot in one
    /// swap. Operator-triggered; there is no periodic rotation.
    pub async fn refresh_api_key(&self) -> Result<(), SecretError> {
        let key = self.resolve(YOUTUBE_API_KEY_SECRET).await?;
        self.api_key.install(key);
        Ok(())
    }

    pub fn credential(&self) -> Option<Arc<ServiceCredential>> {
        self.credential.get()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.identity.is_installed()
    }

    /// Cloneable handle to the shared API-key slot.
    pub fn api_key(&self) -> SharedSlot<String> {
        self.api_key.clone()
    }
}

fn write_text_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::encode_blob;
    use crate::store::RelayStore;
    use ed25519_dalek::Verifier;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn credential_with_seed(account: &str, seed: u8) -> ServiceCredential {
        ServiceCredential {
            account_id: account.into(),
            private_key: BASE64.encode([seed; 32]),
        }
    }

    struct TableTransport {
        secrets: HashMap<String, Vec<u8>>,
        fail: bool,
    }

    impl TableTransport {
        fn new(secrets: HashMap<String, Vec<u8>>) -> Self {
            Self {
                secrets,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                secrets: HashMap::new(),
                fail: true,
            }
        }
    }

    impl SecretTransport for TableTransport {
        fn fetch_latest(
            &self,
            _identity: &SigningIdentity,
            locator: &str,
        ) -> Result<Vec<u8>, SecretError> {
            if self.fail {
                return Err(SecretError::Fetch("simulated outage".into()));
            }
            self.secrets
                .get(locator)
                .cloned()
                .ok_or_else(|| SecretError::Fetch(format!("no such locator {locator}")))
        }
    }

    struct BootstrapFixture {
        _temp: tempfile::TempDir,
        blob_path: std::path::PathBuf,
        credential_file: std::path::PathBuf,
        store: RelayStore,
        reader: RelayReader,
    }

    impl BootstrapFixture {
        async fn new() -> Self {
            let temp = tempdir().unwrap();
            let db_path = temp.path().join("relay.db");
            let store = RelayStore::open(&db_path).await.unwrap();
            let reader = RelayReader::new(&db_path).await.unwrap();
            let blob_path = temp.path().join("bootstrap.blob");
            let credential_file = temp.path().join("credentials.json");

            let bootstrap = credential_with_seed("svc-bootstrap", 1);
            let json = serde_json::to_string(&bootstrap).unwrap();
            std::fs::write(&blob_path, encode_blob(&json).unwrap()).unwrap();

            store
                .upsert_secret_ref(OPERATOR_CREDENTIAL_SECRET, "projects/sky/secrets/operator")
                .await
                .unwrap();
            store
                .upsert_secret_ref(YOUTUBE_API_KEY_SECRET, "projects/sky/secrets/yt-key")
                .await
                .unwrap();

            Self {
                _temp: temp,
                blob_path,
                credential_file,
                store,
                reader,
            }
        }

        fn happy_transport(&self) -> Arc<TableTransport> {
            let real = credential_with_seed("svc-operator", 2);
            let mut secrets = HashMap::new();
            secrets.insert(
                "projects/sky/secrets/operator".to_string(),
                serde_json::to_string(&real).unwrap().into_bytes(),
            );
            secrets.insert(
                "projects/sky/secrets/yt-key".to_string(),
                b"yt-key-123".to_vec(),
            );
            Arc::new(TableTransport::new(secrets))
        }
    }

    #[tokio::test]
    async fn bootstrap_installs_credential_and_api_key() {
        let fixture = BootstrapFixture::new().await;
        let resolver =
            SecretResolver::new(fixture.reader.clone(), fixture.happy_transport());

        resolver
            .bootstrap(&fixture.blob_path, &fixture.credential_file)
            .await
            .unwrap();

        assert!(resolver.is_bootstrapped());
        let credential = resolver.credential().expect("credential installed");
        assert_eq!(credential.account_id, "svc-operator");
        assert_eq!(
            resolver.api_key().get().as_deref().map(String::as_str),
            Some("yt-key-123")
        );

        let written = std::fs::read_to_string(&fixture.credential_file).unwrap();
        let reparsed = ServiceCredential::from_json(&written).unwrap();
        assert_eq!(reparsed.account_id, "svc-operator");
    }

    #[tokio::test]
    async fn bootstrap_rewrites_stale_credential_file() {
        let fixture = BootstrapFixture::new().await;
        std::fs::write(&fixture.credential_file, "{\"stale\":true}").unwrap();

        let resolver =
            SecretResolver::new(fixture.reader.clone(), fixture.happy_transport());
        resolver
            .bootstrap(&fixture.blob_path, &fixture.credential_file)
            .await
            .unwrap();

        let written = std::fs::read_to_string(&fixture.credential_file).unwrap();
        assert!(written.contains("svc-operator"));
        assert!(!written.contains("stale"));
    }

    #[tokio::test]
    async fn bootstrap_fails_without_blob_and_installs_nothing() {
        let fixture = BootstrapFixture::new().await;
        std::fs::remove_file(&fixture.blob_path).unwrap();

        let resolver =
            SecretResolver::new(fixture.reader.clone(), fixture.happy_transport());
        let err = resolver
            .bootstrap(&fixture.blob_path, &fixture.credential_file)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bootstrap credential blob"));
        assert!(!resolver.is_bootstrapped());
        assert!(resolver.api_key().get().is_none());
        assert!(!fixture.credential_file.exists());
    }

    #[tokio::test]
    async fn bootstrap_failure_leaves_lookups_unavailable() {
        let fixture = BootstrapFixture::new().await;
        let resolver = SecretResolver::new(
            fixture.reader.clone(),
            Arc::new(TableTransport::failing()),
        );

        let err = resolver
            .bootstrap(&fixture.blob_path, &fixture.credential_file)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("operating credential"));
        assert!(resolver.credential().is_none());
        assert!(!fixture.credential_file.exists());

        let err = resolver.resolve(YOUTUBE_API_KEY_SECRET).await.unwrap_err();
        assert!(matches!(err, SecretError::Unavailable), "got {err:?}");
    }

    #[tokio::test]
    async fn resolve_unknown_name_is_not_found() {
        let fixture = BootstrapFixture::new().await;
        let resolver =
            SecretResolver::new(fixture.reader.clone(), fixture.happy_transport());
        resolver
            .bootstrap(&fixture.blob_path, &fixture.credential_file)
            .await
            .unwrap();

        let err = resolver.resolve("unregistered").await.unwrap_err();
        assert!(
            matches!(err, SecretError::NotFound(ref name) if name == "unregistered"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn refresh_api_key_swaps_value_wholesale() {
        let fixture = BootstrapFixture::new().await;
        let resolver =
            SecretResolver::new(fixture.reader.clone(), fixture.happy_transport());
        resolver
            .bootstrap(&fixture.blob_path, &fixture.credential_file)
            .await
            .unwrap();

        let before = resolver.api_key().get().unwrap();

        // Repoint the reference table, then refresh; readers holding the old
        // Arc keep a complete value while new reads see the new one.
        fixture
            .store
            .upsert_secret_ref(YOUTUBE_API_KEY_SECRET, "projects/sky/secrets/operator")
            .await
            .unwrap();
        resolver.refresh_api_key().await.unwrap();

        let after = resolver.api_key().get().unwrap();
        assert_eq!(before.as_str(), "yt-key-123");
        assert_ne!(before.as_str(), after.as_str());
    }

    #[test]
    fn shared_slot_concurrent_readers_never_tear() {
        let slot: SharedSlot<String> = SharedSlot::empty();
        slot.install("aaaaaaaaaaaaaaaa".repeat(64));

        let writer_slot = slot.clone();
        let writer = std::thread::spawn(move || {
            for _ in 0..1000 {
                writer_slot.install("bbbbbbbbbbbbbbbb".repeat(64));
                writer_slot.install("aaaaaaaaaaaaaaaa".repeat(64));
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let value = slot.get().expect("installed");
                        let first = value.as_bytes()[0];
                        assert!(value.bytes().all(|byte| byte == first));
                        assert_eq!(value.len(), 16 * 64);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn signing_identity_rejects_bad_key_material() {
        let bad_base64 = ServiceCredential {
            account_id: "svc".into(),
            private_key: "not-base64!!".into(),
        };
        assert!(matches!(
            SigningIdentity::from_credential(&bad_base64),
            Err(CredentialError::Key(_))
        ));

        let short_seed = ServiceCredential {
            account_id: "svc".into(),
            private_key: BASE64.encode([0u8; 16]),
        };
        assert!(matches!(
            SigningIdentity::from_credential(&short_seed),
            Err(CredentialError::Key(_))
        ));
    }

    #[test]
    fn sign_request_verifies_against_public_key() {
        let credential = credential_with_seed("svc", 9);
        let identity = SigningIdentity::from_credential(&credential).unwrap();

        let path = access_path("projects/sky/secrets/yt-key");
        let signature = identity.sign_request("GET", &path, 1_700_000_000);

        let raw = BASE64.decode(signature.as_bytes()).unwrap();
        let signature = ed25519_dalek::Signature::from_slice(&raw).unwrap();
        let message = format!("GET\n{path}\n1700000000");
        identity
            .verifying_key()
            .verify(message.as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn access_path_matches_latest_version_shape() {
        assert_eq!(
            access_path("projects/sky/secrets/yt-key"),
            "/v1/projects/sky/secrets/yt-key/versions/latest:access"
        );
    }

    #[test]
    fn parse_access_body_decodes_payload() {
        let body = format!(
            "{{\"payload\":{{\"data\":\"{}\"}}}}",
            BASE64.encode(b"yt-key-123")
        );
        assert_eq!(parse_access_body(&body).unwrap(), b"yt-key-123");
    }

    #[test]
    fn parse_access_body_rejects_bad_payloads() {
        assert!(matches!(
            parse_access_body("not json"),
            Err(SecretError::Fetch(_))
        ));
        assert!(matches!(
            parse_access_body("{\"payload\":{\"data\":\"%%%\"}}"),
            Err(SecretError::Fetch(_))
        ));
    }
}
