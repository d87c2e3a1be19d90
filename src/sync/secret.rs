use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use sha2::{Digest, Sha512};
use tracing::warn;

use super::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, Synced, ensure};
use crate::client::{ClusterClient, describe};
use crate::decrypt::Decrypt;
use crate::error::Result;
use crate::ownership::OwnerSet;
use crate::status::{StatusAction, StatusLog};

pub const SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";
pub const REPOSITORY_SECRET_TYPE: &str = "repository";

impl Synced for Secret {
    fn spec_matches(&self, desired: &Self) -> bool {
        self.data == desired.data && self.type_ == desired.type_
    }

    fn merge_spec(&mut self, desired: &Self) {
        self.data = desired.data.clone();
        self.type_ = desired.type_.clone();
    }
}

/// `paas-ssh-` plus 8 characters of the base64 encoded SHA-512 of the url,
/// lowercased. `+` and `/` are skipped so the name is a valid object name.
pub fn secret_name(url: &str) -> String {
    let encoded = STANDARD.encode(Sha512::digest(url.as_bytes()));
    let suffix: String = encoded
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect();
    format!("paas-ssh-{}", suffix.to_lowercase())
}

pub fn repository_secret(
    namespace: &str,
    url: &str,
    private_key: &str,
    owner: &OwnerReference,
) -> Secret {
    let labels = BTreeMap::from([
        (SECRET_TYPE_LABEL.to_string(), REPOSITORY_SECRET_TYPE.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ]);
    let data = BTreeMap::from([
        ("type".to_string(), ByteString(b"git".to_vec())),
        ("url".to_string(), ByteString(url.as_bytes().to_vec())),
        (
            "sshPrivateKey".to_string(),
            ByteString(private_key.as_bytes().to_vec()),
        ),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(url)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".into()),
        ..Default::default()
    }
}

/// Decrypts and writes one repository secret per url into `namespace`,
/// then removes repository secrets the owner no longer declares there. A
/// secret that cannot be decrypted is reported and skipped.
pub async fn sync_ssh_secrets<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    decryptor: &dyn Decrypt,
    namespace: &str,
    secrets: &BTreeMap<String, String>,
    owner: &OwnerReference,
) -> Result<()> {
    let mut keep = BTreeSet::new();
    for (url, ciphertext) in secrets {
        let name = secret_name(url);
        keep.insert(name.clone());
        let private_key = match decryptor.decrypt(ciphertext) {
            Ok(key) => key,
            Err(err) => {
                warn!(namespace, url = %url, error = %err, "skipping secret that cannot be decrypted");
                log.error(
                    StatusAction::Create,
                    &describe::<Secret>(Some(namespace), &name),
                    &format!("decrypt failed: {err}"),
                );
                continue;
            }
        };
        ensure(client, log, &repository_secret(namespace, url, &private_key, owner)).await?;
    }

    let selector = format!("{SECRET_TYPE_LABEL}={REPOSITORY_SECRET_TYPE},{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
    let existing: Vec<Secret> = client.list(Some(namespace), Some(&selector)).await?;
    for secret in existing {
        let name = secret.name_any();
        if keep.contains(&name) || !OwnerSet::from_meta(&secret.metadata).contains(&owner.uid) {
            continue;
        }
        super::remove::<C, Secret>(client, log, Some(namespace), &name).await?;
    }
    Ok(())
}
