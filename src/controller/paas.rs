//! Reconciles a `Paas` into its namespaces, quotas, RBAC, groups,
//! application-set entries, secrets and bootstrap application, in that
//! order. The first failing step ends the pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, instrument};

use super::finalize::finalize_paas;
use super::{
    Context, Step, add_finalizer, finish, next_step, remove_finalizer, report_teardown_failure,
    requeue_now,
};
use crate::client::ClusterClient;
use crate::crd::{CapabilityKind, ClusterResourceQuota, PAAS_FINALIZER, Paas, PaasConfigSpec};
use crate::error::Result;
use crate::hierarchy::resolve_namespaces;
use crate::quota::parse_quota;
use crate::status::StatusLog;
use crate::sync::gitops::{appset_entry, bootstrap_application, remove_appset_entry, upsert_appset_entry};
use crate::sync::group::{add_ldap_queries, desired_groups, retire_groups};
use crate::sync::namespace::{desired_namespace, namespace_labels};
use crate::sync::quota::{capability_quota, capability_quota_group, clusterwide_quota, desired_quota};
use crate::sync::rbac::{
    capability_cluster_role_bindings, prune_cluster_role_bindings, prune_role_bindings,
    role_bindings,
};
use crate::sync::secret::sync_ssh_secrets;
use crate::sync::{ensure, release};

#[instrument(skip_all, fields(paas = %paas.name_any()))]
pub async fn reconcile<C: ClusterClient>(paas: Arc<Paas>, ctx: Arc<Context<C>>) -> Result<Action> {
    let result = drive(&paas, &ctx).await;
    ctx.observe("Paas", &result).await;
    result
}

async fn drive<C: ClusterClient>(paas: &Paas, ctx: &Context<C>) -> Result<Action> {
    match next_step(&paas.metadata, PAAS_FINALIZER) {
        Step::AddFinalizer => {
            add_finalizer(&ctx.client, paas, PAAS_FINALIZER).await?;
            debug!("added finalizer");
            Ok(requeue_now())
        }
        Step::Reconcile => {
            let mut log = StatusLog::new();
            let result = apply(ctx, paas, &mut log).await;
            finish(ctx, paas, paas.status.as_ref(), &log, result).await
        }
        Step::Finalize => {
            let mut log = StatusLog::new();
            if let Err(err) = finalize_paas(ctx, paas, &mut log).await {
                return Err(report_teardown_failure(ctx, paas, paas.status.as_ref(), &log, err).await);
            }
            remove_finalizer(&ctx.client, paas, PAAS_FINALIZER).await?;
            info!("finalized");
            Ok(Action::await_change())
        }
        Step::Ignore => Ok(Action::await_change()),
    }
}

async fn apply<C: ClusterClient>(ctx: &Context<C>, paas: &Paas, log: &mut StatusLog) -> Result<()> {
    let config = ctx.active_config.current(&ctx.client).await?;
    let counts = resolve_namespaces(&ctx.client, paas).await?;
    debug!(namespaces = counts.len(), "resolved namespace tree");

    sync_namespaces(ctx, &config, paas, log).await?;
    sync_quotas(ctx, &config, paas, log).await?;
    sync_rbac(ctx, &config, paas, log).await?;
    sync_groups(ctx, &config, paas, log).await?;
    sync_appsets(ctx, &config, paas, log).await?;
    sync_secrets(ctx, &config, paas, log).await?;
    sync_bootstrap(ctx, paas, log).await
}

/// Quota group of each namespace the project creates itself.
fn seed_quota_groups(config: &PaasConfigSpec, paas: &Paas) -> BTreeMap<String, String> {
    let mut groups: BTreeMap<String, String> = paas
        .seed_namespaces()
        .into_iter()
        .map(|ns| (ns, paas.name_any()))
        .collect();
    for (kind, _) in paas.spec.capabilities.enabled() {
        groups.insert(
            paas.capability_namespace(kind),
            capability_quota_group(config, paas, kind),
        );
    }
    groups
}

async fn sync_namespaces<C: ClusterClient>(
    ctx: &Context<C>,
    config: &PaasConfigSpec,
    paas: &Paas,
    log: &mut StatusLog,
) -> Result<()> {
    let owner = paas.owner_reference()?;
    for (name, quota_group) in seed_quota_groups(config, paas) {
        let labels = namespace_labels(config, paas, &quota_group);
        ensure(&ctx.client, log, &desired_namespace(&name, labels, owner.clone())).await?;
    }
    Ok(())
}

async fn sync_quotas<C: ClusterClient>(
    ctx: &Context<C>,
    config: &PaasConfigSpec,
    paas: &Paas,
    log: &mut StatusLog,
) -> Result<()> {
    let owner = paas.owner_reference()?;
    let uid = paas.uid_or_err()?;
    let values = parse_quota(&paas.spec.quota)?;
    ensure(&ctx.client, log, &desired_quota(config, &paas.name_any(), &values, vec![owner.clone()])).await?;

    for kind in CapabilityKind::ALL {
        let enabled = paas.spec.capabilities.get(kind).filter(|c| c.enabled);
        let Some(capability) = enabled else {
            // A disabled capability gives up whatever quota it held.
            release::<C, ClusterResourceQuota>(&ctx.client, log, None, &paas.capability_quota_name(kind), &uid).await?;
            release::<C, ClusterResourceQuota>(&ctx.client, log, None, &kind.clusterwide_quota_name(), &uid).await?;
            continue;
        };
        let policy = config.capability(kind)?.quotas.policy()?;
        // Whichever variant the policy does not use is given up, so a policy
        // switch leaves no stale owner behind.
        if policy.clusterwide {
            release::<C, ClusterResourceQuota>(&ctx.client, log, None, &paas.capability_quota_name(kind), &uid).await?;
            let (values, owners) = clusterwide_quota(&ctx.client, &policy, kind).await?;
            let desired = desired_quota(config, &kind.clusterwide_quota_name(), &values, owners);
            ensure(&ctx.client, log, &desired).await?;
        } else {
            release::<C, ClusterResourceQuota>(&ctx.client, log, None, &kind.clusterwide_quota_name(), &uid).await?;
            let values = capability_quota(&policy, capability)?;
            let desired = desired_quota(config, &paas.capability_quota_name(kind), &values, vec![owner.clone()]);
            ensure(&ctx.client, log, &desired).await?;
        }
    }
    Ok(())
}

async fn sync_rbac<C: ClusterClient>(
    ctx: &Context<C>,
    config: &PaasConfigSpec,
    paas: &Paas,
    log: &mut StatusLog,
) -> Result<()> {
    let owner = paas.owner_reference()?;
    let uid = paas.uid_or_err()?;
    for namespace in paas.seed_namespaces() {
        let bindings = role_bindings(config, paas, &namespace, |_| true, &owner);
        let mut keep = BTreeSet::new();
        for binding in &bindings {
            keep.insert(ensure(&ctx.client, log, binding).await?.name_any());
        }
        prune_role_bindings(&ctx.client, log, &namespace, &keep, &uid).await?;
    }

    let desired = capability_cluster_role_bindings(config, paas, &paas.shared_owner_reference()?)?;
    for binding in &desired {
        ensure(&ctx.client, log, binding).await?;
    }
    prune_cluster_role_bindings(&ctx.client, log, paas, &desired).await
}

async fn sync_groups<C: ClusterClient>(
    ctx: &Context<C>,
    config: &PaasConfigSpec,
    paas: &Paas,
    log: &mut StatusLog,
) -> Result<()> {
    let groups = desired_groups(config, paas)?;
    let mut keep = BTreeSet::new();
    for group in &groups {
        keep.insert(ensure(&ctx.client, log, group).await?.name_any());
    }
    let queries: Vec<String> = paas
        .spec
        .groups
        .values()
        .filter_map(|g| g.ldap_query().map(String::from))
        .collect();
    add_ldap_queries(&ctx.client, log, config, &queries).await?;

    retire_groups(&ctx.client, log, config, paas, &keep).await
}

async fn sync_appsets<C: ClusterClient>(
    ctx: &Context<C>,
    config: &PaasConfigSpec,
    paas: &Paas,
    log: &mut StatusLog,
) -> Result<()> {
    let namespace = &config.clusterwide_argocd_namespace;
    for kind in CapabilityKind::ALL {
        let capability = paas.spec.capabilities.get(kind).filter(|c| c.enabled);
        match (capability, config.capability(kind)) {
            (Some(capability), configured) => {
                let configured = configured?;
                if configured.appset.is_empty() {
                    continue;
                }
                let entry = appset_entry(paas, kind, capability, configured);
                upsert_appset_entry(&ctx.client, log, namespace, &configured.appset, &entry).await?;
            }
            (None, Ok(configured)) if !configured.appset.is_empty() => {
                remove_appset_entry(&ctx.client, log, namespace, &configured.appset, &paas.name_any()).await?;
            }
            (None, _) => {}
        }
    }
    Ok(())
}

async fn sync_secrets<C: ClusterClient>(
    ctx: &Context<C>,
    config: &PaasConfigSpec,
    paas: &Paas,
    log: &mut StatusLog,
) -> Result<()> {
    let owner = paas.owner_reference()?;
    let enabled: Vec<_> = paas.spec.capabilities.enabled().collect();
    let needed = !paas.spec.ssh_secrets.is_empty() || enabled.iter().any(|(_, c)| !c.ssh_secrets.is_empty());
    let decryptor = ctx
        .decryptor(&paas.name_any(), &config.decrypt_keys_secret, needed)
        .await?;

    for (kind, capability) in enabled {
        let mut secrets = paas.spec.ssh_secrets.clone();
        secrets.extend(capability.ssh_secrets.clone());
        let namespace = paas.capability_namespace(kind);
        sync_ssh_secrets(&ctx.client, log, decryptor.as_ref(), &namespace, &secrets, &owner).await?;
    }
    Ok(())
}

async fn sync_bootstrap<C: ClusterClient>(ctx: &Context<C>, paas: &Paas, log: &mut StatusLog) -> Result<()> {
    for (kind, capability) in paas.spec.capabilities.enabled() {
        if let Some(app) = bootstrap_application(paas, kind, capability)? {
            ensure(&ctx.client, log, &app).await?;
        }
    }
    Ok(())
}
