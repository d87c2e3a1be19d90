//! Decryption of the SSH keys projects hand in encrypted.
//!
//! Ciphertexts are base64 encoded RSA-OAEP (SHA-512) blobs. The private keys
//! live in a secret named by the active config; every PEM entry in it is
//! tried in turn, so keys can be rotated by adding the new one first.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha512;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::crd::paas_config::NamespacedName;
use crate::error::Result;

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("ciphertext is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("no private keys found in secret {0}")]
    NoKeys(String),

    #[error("invalid private key {name}: {reason}")]
    InvalidKey { name: String, reason: String },

    #[error("none of the private keys could decrypt the data")]
    NoMatchingKey,

    #[error("decrypted data is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub trait Decrypt: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError>;
}

pub struct RsaDecryptor {
    keys: Vec<RsaPrivateKey>,
}

impl RsaDecryptor {
    /// Accepts PKCS#8 and PKCS#1 PEM keys, keyed by a name used in errors.
    pub fn from_pem<'a>(
        pems: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Result<Self, DecryptError> {
        let mut keys = Vec::new();
        for (name, pem) in pems {
            let text = std::str::from_utf8(pem).map_err(|e| DecryptError::InvalidKey {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
            let key = RsaPrivateKey::from_pkcs8_pem(text)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(text))
                .map_err(|e| DecryptError::InvalidKey {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
            keys.push(key);
        }
        Ok(Self { keys })
    }

    pub fn from_secret(secret: &Secret) -> Result<Self, DecryptError> {
        let data = secret.data.as_ref();
        let decryptor = Self::from_pem(
            data.into_iter()
                .flatten()
                .map(|(name, value)| (name.as_str(), value.0.as_slice())),
        )?;
        if decryptor.keys.is_empty() {
            return Err(DecryptError::NoKeys(secret.name_any()));
        }
        Ok(decryptor)
    }
}

impl Decrypt for RsaDecryptor {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError> {
        let blob = STANDARD.decode(ciphertext.trim())?;
        let plain = self
            .keys
            .iter()
            .find_map(|key| key.decrypt(Oaep::new::<Sha512>(), &blob).ok())
            .ok_or(DecryptError::NoMatchingKey)?;
        Ok(String::from_utf8(plain)?)
    }
}

struct CachedDecryptor {
    resource_version: Option<String>,
    decryptor: Arc<dyn Decrypt>,
}

/// Decryptors per project, rebuilt when the key secret changes. Shared by
/// all reconcile workers.
#[derive(Default)]
pub struct DecryptorRegistry {
    cache: RwLock<HashMap<String, CachedDecryptor>>,
}

impl DecryptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn for_project<C: ClusterClient>(
        &self,
        client: &C,
        project: &str,
        keys: &NamespacedName,
    ) -> Result<Arc<dyn Decrypt>> {
        let secret: Secret = client
            .get(Some(&keys.namespace), &keys.name)
            .await?
            .ok_or_else(|| DecryptError::NoKeys(format!("{}/{}", keys.namespace, keys.name)))?;
        let version = secret.resource_version();

        if let Some(cached) = self.cache.read().await.get(project) {
            if cached.resource_version == version {
                return Ok(cached.decryptor.clone());
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.get(project) {
            if cached.resource_version == version {
                debug!(paas = %project, "decryptor loaded concurrently");
                return Ok(cached.decryptor.clone());
            }
        }
        let decryptor: Arc<dyn Decrypt> = Arc::new(RsaDecryptor::from_secret(&secret)?);
        info!(paas = %project, secret = %keys.name, "loaded decryption keys");
        cache.insert(
            project.to_string(),
            CachedDecryptor {
                resource_version: version,
                decryptor: decryptor.clone(),
            },
        );
        Ok(decryptor)
    }

    pub async fn forget(&self, project: &str) {
        self.cache.write().await.remove(project);
    }

    pub async fn cached_projects(&self) -> usize {
        self.cache.read().await.len()
    }
}
