use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result, anyhow, bail};
use argon2::Argon2;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const VAULT_VERSION: u32 = 1;
const PLAIN_FILE: &str = "secrets.json";
const SEALED_FILE: &str = "secrets.enc.json";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("credentials are encrypted; a passphrase is required to read them")]
    PassphraseRequired,
}

/// Address of one credential, e.g. `provider:gemini_api_key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub namespace: String,
    pub key: String,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    fn slot(&self) -> String {
        format!("{}:{}", self.namespace, self.key)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// Without a passphrase credentials are kept in `secrets.json`. With one they
/// are sealed into `secrets.enc.json` (AES-256-GCM, Argon2 derived key) and the
/// plain file is removed on the next write.
#[derive(Clone)]
pub struct SecretStore {
    root: PathBuf,
    passphrase: Option<String>,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("root", &self.root)
            .field("sealed", &self.passphrase.is_some())
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PlainVault {
    version: u32,
    credentials: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedVault {
    version: u32,
    salt: String,
    nonce: String,
    ciphertext: String,
}

impl SecretStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: Option<String>) -> Self {
        self.passphrase = passphrase.filter(|value| !value.is_empty());
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, secret: &SecretRef) -> Result<Option<String>> {
        Ok(self.load()?.remove(&secret.slot()))
    }

    pub fn put(&self, secret: &SecretRef, value: &str) -> Result<()> {
        let value = value.trim();
        if value.is_empty() {
            self.remove(secret)?;
            return Ok(());
        }
        let mut credentials = self.load()?;
        credentials.insert(secret.slot(), value.to_string());
        self.persist(&credentials)?;
        debug!(secret = %secret, "credential stored");
        Ok(())
    }

    /// Returns whether a credential was present.
    pub fn remove(&self, secret: &SecretRef) -> Result<bool> {
        let mut credentials = self.load()?;
        let existed = credentials.remove(&secret.slot()).is_some();
        if existed {
            self.persist(&credentials)?;
            debug!(secret = %secret, "credential removed");
        }
        Ok(existed)
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        let plain = self.root.join(PLAIN_FILE);
        let sealed = self.root.join(SEALED_FILE);

        match (self.passphrase.as_deref(), sealed.exists(), plain.exists()) {
            (Some(passphrase), true, _) => {
                let text = read(&sealed)?;
                let vault: SealedVault =
                    serde_json::from_str(&text).context("failed to parse sealed credentials")?;
                unseal(passphrase, &vault)
            }
            (None, true, false) => Err(SecretError::PassphraseRequired.into()),
            (_, _, true) => {
                let vault: PlainVault = serde_json::from_str(&read(&plain)?)
                    .context("failed to parse credentials")?;
                Ok(vault.credentials)
            }
            (_, false, false) => Ok(BTreeMap::new()),
        }
    }

    fn persist(&self, credentials: &BTreeMap<String, String>) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;

        let (target, stale, text) = match self.passphrase.as_deref() {
            Some(passphrase) => (
                SEALED_FILE,
                PLAIN_FILE,
                serde_json::to_string_pretty(&seal(passphrase, credentials)?)?,
            ),
            None => (
                PLAIN_FILE,
                SEALED_FILE,
                serde_json::to_string_pretty(&PlainVault {
                    version: VAULT_VERSION,
                    credentials: credentials.clone(),
                })?,
            ),
        };

        let path = self.root.join(target);
        fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
        restrict_permissions(&path)?;
        let stale = self.root.join(stale);
        if stale.exists() {
            fs::remove_file(&stale).ok();
        }
        info!(sealed = self.is_sealed(), count = credentials.len(), "credentials persisted");
        Ok(())
    }
}

/// `gsk_abcdef123456` -> `gsk_…3456`, for display only.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.trim().chars().collect();
    if chars.len() <= 8 {
        return "•".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|err| anyhow!("failed to derive vault key: {err}"))?;
    Ok(key)
}

fn seal(passphrase: &str, credentials: &BTreeMap<String, String>) -> Result<SealedVault> {
    let mut salt = [0u8; 16];
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&derive_key(passphrase, &salt)?)
        .context("failed to build cipher")?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), serde_json::to_vec(credentials)?.as_ref())
        .map_err(|err| anyhow!("failed to seal credentials: {err}"))?;

    Ok(SealedVault {
        version: VAULT_VERSION,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

fn unseal(passphrase: &str, vault: &SealedVault) -> Result<BTreeMap<String, String>> {
    let salt = BASE64.decode(&vault.salt).context("invalid vault salt")?;
    let nonce = BASE64.decode(&vault.nonce).context("invalid vault nonce")?;
    let ciphertext = BASE64.decode(&vault.ciphertext).context("invalid vault payload")?;
    if nonce.len() != 12 {
        bail!("invalid vault nonce length");
    }

    let cipher = Aes256Gcm::new_from_slice(&derive_key(passphrase, &salt)?)
        .context("failed to build cipher")?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| anyhow!("failed to unseal credentials: wrong passphrase or corrupted vault"))?;
    serde_json::from_slice(&plaintext).context("failed to parse unsealed credentials")
}
