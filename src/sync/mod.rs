//! Idempotent "make it so" for every kind of object a project owns.
//!
//! [`ensure`] fetches the object by its natural key, creates it when it is
//! missing, leaves it alone when it already carries the desired state and
//! otherwise merges the desired state into it and replaces it. What "carries
//! the desired state" means is decided per kind through [`Synced`].

pub mod gitops;
pub mod group;
pub mod namespace;
pub mod quota;
pub mod rbac;
pub mod secret;

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::client::{ClusterClient, ClusterObject, describe};
use crate::error::Result;
use crate::ownership::OwnerSet;
use crate::status::{StatusAction, StatusLog};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "paas-operator";

/// Label selector matching everything this operator created.
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])
}

pub trait Synced: ClusterObject {
    /// Whether `self` already carries the kind-specific part of `desired`.
    fn spec_matches(&self, desired: &Self) -> bool;

    /// Copies the kind-specific part of `desired` onto `self`.
    fn merge_spec(&mut self, desired: &Self);
}

fn is_subset(have: &BTreeMap<String, String>, want: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

fn owners_present<K: ClusterObject>(existing: &K, desired: &K) -> bool {
    let owners = OwnerSet::from_meta(existing.meta());
    let controller = existing
        .owner_references()
        .iter()
        .find(|r| r.controller == Some(true))
        .map(|r| r.uid.clone());
    desired.owner_references().iter().all(|r| {
        let controls = r.controller != Some(true) || controller.as_deref() == Some(r.uid.as_str());
        owners.contains(&r.uid) && controls
    })
}

fn is_current<K: Synced>(existing: &K, desired: &K) -> bool {
    is_subset(existing.labels(), desired.labels())
        && is_subset(existing.annotations(), desired.annotations())
        && owners_present(existing, desired)
        && existing.spec_matches(desired)
}

fn merge<K: Synced>(existing: &K, desired: &K) -> K {
    let mut merged = existing.clone();
    merged
        .labels_mut()
        .extend(desired.labels().iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
        .annotations_mut()
        .extend(desired.annotations().iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut owners = OwnerSet::from_meta(merged.meta());
    for owner in desired.owner_references() {
        owners.add(owner);
    }
    owners.apply_to(merged.meta_mut());

    merged.merge_spec(desired);
    merged
}

async fn apply<C: ClusterClient, K: Synced>(
    client: &C,
    desired: &K,
    action: &mut StatusAction,
) -> Result<(K, &'static str)> {
    let name = desired.name_any();
    let namespace = desired.namespace();

    let Some(existing) = client.get::<K>(namespace.as_deref(), &name).await? else {
        *action = StatusAction::Create;
        let created = client.create(desired).await?;
        return Ok((created, "created"));
    };

    if is_current(&existing, desired) {
        return Ok((existing, "unchanged"));
    }

    *action = StatusAction::Update;
    let updated = client.replace(&merge(&existing, desired)).await?;
    Ok((updated, "updated"))
}

/// Creates or updates `desired`. Every call leaves one message in `log`;
/// errors from the API are returned as they are.
pub async fn ensure<C: ClusterClient, K: Synced>(
    client: &C,
    log: &mut StatusLog,
    desired: &K,
) -> Result<K> {
    let target = describe::<K>(desired.namespace().as_deref(), &desired.name_any());
    let mut action = StatusAction::Find;

    match apply(client, desired, &mut action).await {
        Ok((obj, detail)) => {
            if action == StatusAction::Find {
                debug!(object = %target, "unchanged");
            } else {
                info!(object = %target, %action, "synced");
            }
            log.info(action, &target, detail);
            Ok(obj)
        }
        Err(err) => {
            error!(object = %target, %action, error = %err, "sync failed");
            log.error(action, &target, &err.to_string());
            Err(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    Missing,
    NotOwner,
    Retained,
    Deleted,
}

/// Drops `uid` from the object's owners, deleting the object once no owner
/// is left.
pub async fn release<C: ClusterClient, K: Synced>(
    client: &C,
    log: &mut StatusLog,
    namespace: Option<&str>,
    name: &str,
    uid: &str,
) -> Result<Released> {
    let target = describe::<K>(namespace, name);
    let Some(mut existing) = client.get::<K>(namespace, name).await? else {
        return Ok(Released::Missing);
    };

    let mut owners = OwnerSet::from_meta(existing.meta());
    if !owners.release(uid) {
        return Ok(Released::NotOwner);
    }

    let (action, result) = if owners.is_empty() {
        (
            StatusAction::Delete,
            client.delete::<K>(namespace, name).await.map(|_| Released::Deleted),
        )
    } else {
        owners.apply_to(existing.meta_mut());
        (
            StatusAction::Update,
            client.replace(&existing).await.map(|_| Released::Retained),
        )
    };

    match result {
        Ok(released) => {
            info!(object = %target, ?released, "released ownership");
            let detail = match released {
                Released::Deleted => "deleted, no owners left",
                _ => "ownership released",
            };
            log.info(action, &target, detail);
            Ok(released)
        }
        Err(err) => {
            error!(object = %target, error = %err, "release failed");
            log.error(action, &target, &err.to_string());
            Err(err)
        }
    }
}

/// Deletes an object outright, recording the outcome in `log`.
pub async fn remove<C: ClusterClient, K: ClusterObject>(
    client: &C,
    log: &mut StatusLog,
    namespace: Option<&str>,
    name: &str,
) -> Result<()> {
    let target = describe::<K>(namespace, name);
    match client.delete::<K>(namespace, name).await {
        Ok(()) => {
            info!(object = %target, "deleted");
            log.info(StatusAction::Delete, &target, "deleted");
            Ok(())
        }
        Err(err) => {
            error!(object = %target, error = %err, "delete failed");
            log.error(StatusAction::Delete, &target, &err.to_string());
            Err(err)
        }
    }
}
