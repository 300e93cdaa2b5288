//! Encrypted local secret store.
//!
//! Each secret lives in its own file under a private root directory:
//!
//! ```text
//! ~/.local/share/tollgate/secrets/          (0700)
//! ├── stripe/
//! │   └── api-key.secret                    (0600)
//! └── exchanges/
//!     └── bybit.secret
//! ```
//!
//! A file holds an envelope: the magic bytes `TGS1`, a 12-byte random nonce,
//! then the AES-256-GCM ciphertext with its 16-byte tag. The canonical secret
//! path is bound in as associated data, so an envelope copied to a different
//! path fails to decrypt.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::{debug, warn};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::{ProviderError, Result};
use crate::provider::SecretProvider;
use crate::reference::SecretPath;
use crate::registry::ProviderContext;

const MAGIC: &[u8; 4] = b"TGS1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const EXTENSION: &str = "secret";

/// Environment variable holding the master key when none is configured.
pub const DEFAULT_MASTER_KEY_ENV: &str = "TOLLGATE_MASTER_KEY";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocalOptions {
    #[serde(default)]
    root: Option<PathBuf>,
    #[serde(default)]
    master_key_env: Option<String>,
    #[serde(default)]
    master_key_file: Option<PathBuf>,
}

/// Where the base64 master key comes from.
pub enum MasterKeySource {
    /// An environment variable, read when the provider was constructed.
    Env {
        var: String,
        value: Option<SecretString>,
    },
    /// A file containing the key, read on `initialize`.
    File(PathBuf),
}

/// Generates a fresh random master key, base64 encoded.
///
/// # Errors
///
/// Returns [`ProviderError::Internal`] if the OS random source fails.
pub fn generate_master_key() -> Result<SecretString> {
    let mut key = [0u8; KEY_LEN];
    getrandom::getrandom(&mut key)
        .map_err(|e| ProviderError::internal("local", format!("random source failed: {e}")))?;
    Ok(SecretString::from(STANDARD.encode(key)))
}

/// Provider backed by AES-256-GCM encrypted files.
pub struct LocalProvider {
    name: String,
    root: PathBuf,
    key_source: MasterKeySource,
    dir: RwLock<Option<Arc<EncryptedDir>>>,
}

impl LocalProvider {
    #[must_use]
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, key_source: MasterKeySource) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            key_source,
            dir: RwLock::new(None),
        }
    }

    pub(crate) fn construct(ctx: &ProviderContext<'_>) -> Result<Arc<dyn SecretProvider>> {
        let options: LocalOptions = ctx.config.parse_options(ctx.name)?;

        let key_source = match (options.master_key_env, options.master_key_file) {
            (Some(_), Some(_)) => {
                return Err(ProviderError::internal(
                    ctx.name,
                    "set only one of master_key_env and master_key_file",
                ));
            }
            (None, Some(file)) => MasterKeySource::File(file),
            (var, None) => {
                let var = var.unwrap_or_else(|| DEFAULT_MASTER_KEY_ENV.to_string());
                let value = ctx.env.var(&var).ok().map(SecretString::from);
                MasterKeySource::Env { var, value }
            }
        };

        let root = options
            .root
            .unwrap_or_else(|| ctx.data_dir.join("secrets"));

        Ok(Arc::new(Self::new(ctx.name, root, key_source)))
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_key(&self) -> Result<Aes256Gcm> {
        let encoded = match &self.key_source {
            MasterKeySource::Env { var, value } => value.clone().ok_or_else(|| {
                ProviderError::auth_failed(
                    &self.name,
                    format!("master key variable {var} is not set"),
                )
            })?,
            MasterKeySource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(SecretString::from)
                .map_err(|e| {
                    ProviderError::auth_failed(
                        &self.name,
                        format!("cannot read master key file {}: {e}", path.display()),
                    )
                })?,
        };

        let bytes = STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|_| ProviderError::auth_failed(&self.name, "master key is not valid base64"))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            ProviderError::auth_failed(&self.name, format!("master key must be {KEY_LEN} bytes"))
        })?;

        Ok(Aes256Gcm::new(&Key::<Aes256Gcm>::from(key)))
    }

    async fn dir(&self) -> Result<Arc<EncryptedDir>> {
        self.dir
            .read()
            .await
            .clone()
            .ok_or_else(|| ProviderError::NotInitialized(self.name.clone()))
    }

    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&EncryptedDir) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let dir = self.dir().await?;
        tokio::task::spawn_blocking(move || f(&dir))
            .await
            .map_err(|e| ProviderError::internal(&self.name, format!("task join error: {e}")))?
    }
}

#[async_trait]
impl SecretProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self) -> Result<()> {
        let mut slot = self.dir.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let cipher = self.load_key().await?;
        let name = self.name.clone();
        let root = self.root.clone();
        let dir = tokio::task::spawn_blocking(move || EncryptedDir::open(name, &root, cipher))
            .await
            .map_err(|e| ProviderError::internal(&self.name, format!("task join error: {e}")))??;

        debug!("Initialized local provider '{}' at {}", self.name, dir.root.display());
        *slot = Some(Arc::new(dir));
        Ok(())
    }

    async fn get_secret(
        &self,
        path: &SecretPath,
        field: Option<&str>,
    ) -> Result<Option<SecretString>> {
        if field.is_some() {
            return Err(ProviderError::invalid_reference(
                &format!("{}://{path}", self.name),
                "local secrets have no fields",
            ));
        }
        let path = path.clone();
        self.run(move |dir| dir.read(&path)).await
    }

    async fn health_check(&self) -> Result<()> {
        self.run(|dir| {
            fs::metadata(&dir.root)
                .map(|_| ())
                .map_err(|e| ProviderError::unavailable(&dir.provider, e.to_string()))
        })
        .await
    }

    async fn dispose(&self) -> Result<()> {
        self.dir.write().await.take();
        Ok(())
    }

    async fn set_secret(
        &self,
        path: &SecretPath,
        field: Option<&str>,
        value: &SecretString,
    ) -> Result<()> {
        if field.is_some() {
            return Err(ProviderError::invalid_reference(
                &format!("{}://{path}", self.name),
                "local secrets have no fields",
            ));
        }
        let path = path.clone();
        let value = value.clone();
        self.run(move |dir| dir.write(&path, &value)).await
    }

    async fn delete_secret(&self, path: &SecretPath) -> Result<bool> {
        let path = path.clone();
        self.run(move |dir| dir.remove(&path)).await
    }

    async fn list_secrets(&self) -> Result<Vec<SecretPath>> {
        self.run(EncryptedDir::list).await
    }
}

/// Initialized store: canonical root plus cipher. All methods block.
struct EncryptedDir {
    provider: String,
    root: PathBuf,
    cipher: Aes256Gcm,
}

impl EncryptedDir {
    fn open(provider: String, root: &Path, cipher: Aes256Gcm) -> Result<Self> {
        let io_err = |what: &str, e: std::io::Error| {
            ProviderError::internal(&provider, format!("{what} {}: {e}", root.display()))
        };

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(root)
            .map_err(|e| io_err("cannot create secrets directory", e))?;
        fs::set_permissions(root, fs::Permissions::from_mode(0o700))
            .map_err(|e| io_err("cannot restrict secrets directory", e))?;
        let root = fs::canonicalize(root).map_err(|e| io_err("cannot resolve", e))?;

        Ok(Self {
            provider,
            root,
            cipher,
        })
    }

    fn file_path(&self, path: &SecretPath) -> PathBuf {
        self.root.join(format!("{path}.{EXTENSION}"))
    }

    fn internal(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::internal(&self.provider, message)
    }

    /// Fails if `existing` resolves, through symlinks, outside the root.
    fn ensure_contained(&self, existing: &Path, path: &SecretPath) -> Result<()> {
        let resolved = fs::canonicalize(existing)
            .map_err(|e| self.internal(format!("cannot resolve '{path}': {e}")))?;
        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            warn!("Secret path '{path}' escapes the secrets root of provider '{}'", self.provider);
            Err(ProviderError::InvalidPath(format!(
                "'{path}' resolves outside the secrets root"
            )))
        }
    }

    fn read(&self, path: &SecretPath) -> Result<Option<SecretString>> {
        let file = self.file_path(path);
        if fs::symlink_metadata(&file).is_err() {
            debug!("Secret '{path}' not found in provider '{}'", self.provider);
            return Ok(None);
        }
        self.ensure_contained(&file, path)?;

        let envelope = fs::read(&file).map_err(|e| self.internal(format!("cannot read '{path}': {e}")))?;
        let plaintext = self.open_envelope(path, &envelope)?;
        let value = String::from_utf8(plaintext)
            .map_err(|_| self.internal(format!("secret '{path}' is not valid UTF-8")))?;
        Ok(Some(SecretString::from(value)))
    }

    fn write(&self, path: &SecretPath, value: &SecretString) -> Result<()> {
        let file = self.file_path(path);
        let parent = file
            .parent()
            .ok_or_else(|| self.internal(format!("'{path}' has no parent directory")))?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(|e| self.internal(format!("cannot create directory for '{path}': {e}")))?;
        self.ensure_contained(parent, path)?;
        if fs::symlink_metadata(&file).is_ok() {
            self.ensure_contained(&file, path)?;
        }

        let envelope = self.seal(path, value.expose_secret().as_bytes())?;

        // Atomic write: temp file, then rename
        let temp = file.with_extension(format!("{EXTENSION}.tmp"));
        let write_temp = || -> std::io::Result<()> {
            let mut out = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&temp)?;
            out.write_all(&envelope)?;
            out.sync_all()?;
            fs::rename(&temp, &file)
        };
        write_temp().map_err(|e| {
            let _ = fs::remove_file(&temp);
            self.internal(format!("cannot write '{path}': {e}"))
        })?;

        debug!(
            "Stored secret '{path}' in provider '{}' ({} bytes)",
            self.provider,
            envelope.len()
        );
        Ok(())
    }

    fn remove(&self, path: &SecretPath) -> Result<bool> {
        let file = self.file_path(path);
        if fs::symlink_metadata(&file).is_err() {
            return Ok(false);
        }
        fs::remove_file(&file).map_err(|e| self.internal(format!("cannot remove '{path}': {e}")))?;
        debug!("Removed secret '{path}' from provider '{}'", self.provider);
        Ok(true)
    }

    fn list(&self) -> Result<Vec<SecretPath>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let entries = fs::read_dir(&dir)
                .map_err(|e| self.internal(format!("cannot list {}: {e}", dir.display())))?;
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                let entry_path = entry.path();
                if file_type.is_dir() {
                    pending.push(entry_path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let Some(relative) = entry_path
                    .strip_prefix(&self.root)
                    .ok()
                    .and_then(Path::to_str)
                    .and_then(|p| p.strip_suffix(".secret"))
                else {
                    continue;
                };
                if let Ok(path) = SecretPath::parse(relative) {
                    found.push(path);
                }
            }
        }

        found.sort();
        Ok(found)
    }

    fn seal(&self, path: &SecretPath, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| self.internal(format!("random source failed: {e}")))?;

        let ciphertext = self
            .cipher
            .encrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: plaintext,
                    aad: path.as_str().as_bytes(),
                },
            )
            .map_err(|_| self.internal(format!("encryption of '{path}' failed")))?;

        let mut envelope = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(MAGIC);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    fn open_envelope(&self, path: &SecretPath, envelope: &[u8]) -> Result<Vec<u8>> {
        let body = envelope
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| self.internal(format!("'{path}' is not a tollgate secret file")))?;
        if body.len() < NONCE_LEN + TAG_LEN {
            return Err(self.internal(format!("'{path}' is truncated")));
        }

        let (nonce, ciphertext) = body.split_at(NONCE_LEN);
        let nonce: [u8; NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| self.internal(format!("'{path}' has a malformed nonce")))?;

        self.cipher
            .decrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: ciphertext,
                    aad: path.as_str().as_bytes(),
                },
            )
            .map_err(|_| {
                ProviderError::auth_failed(
                    &self.provider,
                    format!("cannot decrypt '{path}': wrong master key or tampered file"),
                )
            })
    }
}
