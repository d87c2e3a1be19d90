use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{info, warn};

use super::{Released, Synced, managed_labels, managed_selector};
use crate::client::{ClusterClient, describe};
use crate::crd::{Group, Paas, PaasConfigSpec};
use crate::error::{Error, Result};
use crate::ownership::OwnerSet;
use crate::status::{StatusAction, StatusLog};

pub const LDAP_UID_ANNOTATION: &str = "openshift.io/ldap.uid";
pub const LDAP_URL_ANNOTATION: &str = "openshift.io/ldap.url";

impl Synced for Group {
    /// Members of LDAP groups are filled in by the group sync, so only
    /// groups with explicit users are compared on membership.
    fn spec_matches(&self, desired: &Self) -> bool {
        desired.users.is_empty()
            || self.users.iter().collect::<BTreeSet<_>>() == desired.users.iter().collect::<BTreeSet<_>>()
    }

    fn merge_spec(&mut self, desired: &Self) {
        if !desired.users.is_empty() {
            self.users = desired.users.clone();
        }
    }
}

/// Groups the project declares. LDAP groups are shared between projects
/// and carry a non-controlling owner reference; user groups belong to the
/// project alone.
pub fn desired_groups(config: &PaasConfigSpec, paas: &Paas) -> Result<Vec<Group>> {
    let mut groups = Vec::new();
    for (key, group) in &paas.spec.groups {
        let mut metadata = ObjectMeta {
            name: Some(paas.group_name(key, group)),
            labels: Some(managed_labels()),
            ..Default::default()
        };
        let users = match group.ldap_query() {
            Some(query) => {
                let mut annotations = BTreeMap::from([(LDAP_UID_ANNOTATION.to_string(), query.to_string())]);
                if let Some(url) = config.ldap_url() {
                    annotations.insert(LDAP_URL_ANNOTATION.to_string(), url);
                }
                metadata.annotations = Some(annotations);
                metadata.owner_references = Some(vec![paas.shared_owner_reference()?]);
                Vec::new()
            }
            None => {
                metadata.owner_references = Some(vec![paas.owner_reference()?]);
                group.users.clone()
            }
        };
        groups.push(Group { metadata, users });
    }
    Ok(groups)
}

/// LDAP queries carried by the managed groups that currently exist.
pub async fn queries_in_use<C: ClusterClient>(client: &C) -> Result<BTreeSet<String>> {
    let groups: Vec<Group> = client.list(None, Some(&managed_selector())).await?;
    Ok(groups
        .iter()
        .filter_map(|g| g.annotations().get(LDAP_UID_ANNOTATION).cloned())
        .collect())
}

/// Releases every group owned by `paas` whose name is not in `keep`.
/// Continues past failures; returns the LDAP queries whose group was
/// actually deleted and that no remaining group carries, together with the
/// first error hit.
pub async fn release_groups<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    paas: &Paas,
    keep: &BTreeSet<String>,
) -> (Vec<String>, Option<Error>) {
    let uid = match paas.uid_or_err() {
        Ok(uid) => uid,
        Err(err) => return (Vec::new(), Some(err)),
    };
    let groups: Vec<Group> = match client.list(None, Some(&managed_selector())).await {
        Ok(groups) => groups,
        Err(err) => return (Vec::new(), Some(err)),
    };

    let mut freed = Vec::new();
    let mut first_error = None;
    for group in groups {
        let name = group.name_any();
        if keep.contains(&name) || !OwnerSet::from_meta(&group.metadata).contains(&uid) {
            continue;
        }
        match super::release::<C, Group>(client, log, None, &name, &uid).await {
            Ok(Released::Deleted) => {
                if let Some(query) = group.annotations().get(LDAP_UID_ANNOTATION) {
                    freed.push(query.clone());
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!(group = %name, error = %err, "failed to release group");
                first_error.get_or_insert(err);
            }
        }
    }
    if freed.is_empty() {
        return (freed, first_error);
    }
    match queries_in_use(client).await {
        Ok(in_use) => freed.retain(|q| !in_use.contains(q)),
        Err(err) => {
            warn!(error = %err, "cannot tell which LDAP queries are still used, keeping them");
            freed.clear();
            first_error.get_or_insert(err);
        }
    }
    (freed, first_error)
}

fn parse_allow_list(raw: Option<&String>) -> BTreeSet<String> {
    raw.map(|s| {
        s.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

fn render_allow_list(queries: &BTreeSet<String>) -> String {
    queries.iter().map(|q| format!("{q}\n")).collect()
}

async fn update_allow_list<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    config: &PaasConfigSpec,
    edit: impl Fn(&mut BTreeSet<String>),
) -> Result<()> {
    let location = &config.group_sync_list;
    if location.name.is_empty() {
        return Ok(());
    }
    let namespace = Some(location.namespace.as_str());
    let target = describe::<ConfigMap>(namespace, &location.name);
    let key = &config.group_sync_list_key;

    let result = match client.get::<ConfigMap>(namespace, &location.name).await {
        Err(err) => Err((StatusAction::Find, err)),
        Ok(None) => {
            let mut queries = BTreeSet::new();
            edit(&mut queries);
            if queries.is_empty() {
                return Ok(());
            }
            let cm = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(location.name.clone()),
                    namespace: Some(location.namespace.clone()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(key.clone(), render_allow_list(&queries))])),
                ..Default::default()
            };
            client
                .create(&cm)
                .await
                .map(|_| StatusAction::Create)
                .map_err(|e| (StatusAction::Create, e))
        }
        Ok(Some(mut cm)) => {
            let current = parse_allow_list(cm.data.as_ref().and_then(|d| d.get(key)));
            let mut queries = current.clone();
            edit(&mut queries);
            if queries == current {
                log.info(StatusAction::Find, &target, "unchanged");
                return Ok(());
            }
            cm.data
                .get_or_insert_with(BTreeMap::new)
                .insert(key.clone(), render_allow_list(&queries));
            client
                .replace(&cm)
                .await
                .map(|_| StatusAction::Update)
                .map_err(|e| (StatusAction::Update, e))
        }
    };

    match result {
        Ok(action) => {
            info!(object = %target, "updated ldap allow-list");
            log.info(action, &target, "ldap allow-list updated");
            Ok(())
        }
        Err((action, err)) => {
            log.error(action, &target, &err.to_string());
            Err(err)
        }
    }
}

/// Adds LDAP queries to the group sync allow-list.
pub async fn add_ldap_queries<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    config: &PaasConfigSpec,
    queries: &[String],
) -> Result<()> {
    update_allow_list(client, log, config, |list| {
        list.extend(queries.iter().cloned());
    })
    .await
}

pub async fn remove_ldap_queries<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    config: &PaasConfigSpec,
    queries: &[String],
) -> Result<()> {
    if queries.is_empty() {
        return Ok(());
    }
    update_allow_list(client, log, config, |list| {
        for query in queries {
            list.remove(query);
        }
    })
    .await
}

/// Releases the groups `paas` no longer wants and drops their freed queries
/// from the allow-list. A failed group release outranks a failed allow-list
/// update; both are attempted.
pub async fn retire_groups<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    config: &PaasConfigSpec,
    paas: &Paas,
    keep: &BTreeSet<String>,
) -> Result<()> {
    let (freed, failure) = release_groups(client, log, paas, keep).await;
    let listed = remove_ldap_queries(client, log, config, &freed).await;
    match (failure, listed) {
        (Some(err), Err(list_err)) => {
            warn!(error = %list_err, "failed to update LDAP allow-list");
            Err(err)
        }
        (Some(err), Ok(())) => Err(err),
        (None, listed) => listed,
    }
}
