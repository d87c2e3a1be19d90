//! Teardown of a project: everything it shares is released, everything it
//! owns alone is deleted.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::Context;
use crate::client::ClusterClient;
use crate::crd::{CapabilityKind, ClusterResourceQuota, Paas};
use crate::error::Result;
use crate::hierarchy::{NamespaceCounts, resolve_namespaces};
use crate::ownership::is_owned_by;
use crate::status::StatusLog;
use crate::sync::gitops::remove_appset_entry;
use crate::sync::group::retire_groups;
use crate::sync::rbac::prune_cluster_role_bindings;
use crate::sync::{release, remove};

/// Namespaces to consider for deletion. A broken claim tree must not block
/// deletion of the project, so it falls back to the seed namespaces.
async fn namespaces_to_release<C: ClusterClient>(client: &C, paas: &Paas) -> Result<NamespaceCounts> {
    match resolve_namespaces(client, paas).await {
        Ok(counts) => Ok(counts),
        Err(err) if err.is_terminal() => {
            warn!(error = %err, "claim tree unusable, releasing seed namespaces only");
            Ok(paas.seed_namespaces().into_iter().map(|ns| (ns, 1)).collect())
        }
        Err(err) => Err(err),
    }
}

pub async fn finalize_paas<C: ClusterClient>(
    ctx: &Context<C>,
    paas: &Paas,
    log: &mut StatusLog,
) -> Result<()> {
    let config = ctx.active_config.current(&ctx.client).await?;
    let uid = paas.uid_or_err()?;
    let project = paas.name_any();
    let counts = namespaces_to_release(&ctx.client, paas).await?;

    for kind in CapabilityKind::ALL {
        let Ok(configured) = config.capability(kind) else {
            continue;
        };
        if !configured.appset.is_empty() {
            remove_appset_entry(
                &ctx.client,
                log,
                &config.clusterwide_argocd_namespace,
                &configured.appset,
                &project,
            )
            .await?;
        }
    }

    let quotas: BTreeSet<String> = counts
        .keys()
        .cloned()
        .chain(CapabilityKind::ALL.into_iter().map(CapabilityKind::clusterwide_quota_name))
        .collect();
    for name in &quotas {
        release::<C, ClusterResourceQuota>(&ctx.client, log, None, name, &uid).await?;
    }

    prune_cluster_role_bindings(&ctx.client, log, paas, &[]).await?;

    retire_groups(&ctx.client, log, &config, paas, &BTreeSet::new()).await?;

    for (name, count) in &counts {
        if *count > 1 {
            debug!(namespace = %name, count, "namespace still claimed");
            continue;
        }
        let Some(namespace) = ctx.client.get::<Namespace>(None, name).await? else {
            continue;
        };
        if is_owned_by(&namespace.metadata, &uid) {
            remove::<C, Namespace>(&ctx.client, log, None, name).await?;
        }
    }

    ctx.decryptors.forget(&project).await;
    Ok(())
}
