//! Reconciles a `PaasNS` claim into the extra namespace it asks for.

use std::collections::BTreeSet;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, info, instrument, warn};

use super::{
    Context, Step, add_finalizer, finish, next_step, remove_finalizer, report_teardown_failure,
    requeue_now,
};
use crate::client::ClusterClient;
use crate::crd::{ClusterResourceQuota, PAASNS_FINALIZER, Paas, PaasNS};
use crate::error::{Error, Result};
use crate::hierarchy::resolve_namespaces;
use crate::ownership::is_owned_by;
use crate::quota::parse_quota;
use crate::status::StatusLog;
use crate::sync::namespace::{desired_namespace, namespace_labels};
use crate::sync::quota::desired_quota;
use crate::sync::rbac::{prune_role_bindings, role_bindings};
use crate::sync::secret::sync_ssh_secrets;
use crate::sync::{ensure, release, remove};

#[instrument(skip_all, fields(paasns = %claim.name_any(), namespace = ?claim.namespace()))]
pub async fn reconcile<C: ClusterClient>(claim: Arc<PaasNS>, ctx: Arc<Context<C>>) -> Result<Action> {
    let result = drive(&claim, &ctx).await;
    ctx.observe("PaasNS", &result).await;
    result
}

async fn drive<C: ClusterClient>(claim: &PaasNS, ctx: &Context<C>) -> Result<Action> {
    match next_step(&claim.metadata, PAASNS_FINALIZER) {
        Step::AddFinalizer => {
            add_finalizer(&ctx.client, claim, PAASNS_FINALIZER).await?;
            Ok(requeue_now())
        }
        Step::Reconcile => {
            let mut log = StatusLog::new();
            let result = apply(ctx, claim, &mut log).await;
            finish(ctx, claim, claim.status.as_ref(), &log, result).await
        }
        Step::Finalize => {
            let mut log = StatusLog::new();
            if let Err(err) = finalize(ctx, claim, &mut log).await {
                return Err(report_teardown_failure(ctx, claim, claim.status.as_ref(), &log, err).await);
            }
            remove_finalizer(&ctx.client, claim, PAASNS_FINALIZER).await?;
            info!("finalized");
            Ok(Action::await_change())
        }
        Step::Ignore => Ok(Action::await_change()),
    }
}

fn home_namespace(claim: &PaasNS) -> Result<String> {
    claim.namespace().ok_or(Error::MissingObjectKey("namespace"))
}

/// The project a claim refers to; claims naming an unknown project are
/// invalid until the project shows up.
async fn project_of<C: ClusterClient>(client: &C, claim: &PaasNS) -> Result<Option<Paas>> {
    client.get::<Paas>(None, &claim.spec.paas).await
}

async fn apply<C: ClusterClient>(ctx: &Context<C>, claim: &PaasNS, log: &mut StatusLog) -> Result<()> {
    let config = ctx.active_config.current(&ctx.client).await?;
    let home = home_namespace(claim)?;
    let Some(paas) = project_of(&ctx.client, claim).await? else {
        return Err(Error::Validation(format!("Paas {} does not exist", claim.spec.paas)));
    };

    let counts = resolve_namespaces(&ctx.client, &paas).await?;
    if !counts.contains_key(&home) {
        return Err(Error::Validation(format!(
            "namespace {home} does not belong to Paas {}",
            claim.spec.paas
        )));
    }

    let target = claim.derived_namespace();
    let owner = paas.owner_reference()?;
    let uid = paas.uid_or_err()?;
    let quota_group = if claim.spec.separate_quota {
        target.clone()
    } else {
        paas.name_any()
    };
    debug!(%target, %quota_group, "claimed namespace");

    let labels = namespace_labels(&config, &paas, &quota_group);
    ensure(&ctx.client, log, &desired_namespace(&target, labels, owner.clone())).await?;

    if claim.spec.separate_quota {
        let values = parse_quota(&paas.spec.quota)?;
        ensure(&ctx.client, log, &desired_quota(&config, &target, &values, vec![owner.clone()])).await?;
    }

    let mut keep = BTreeSet::new();
    for binding in &role_bindings(&config, &paas, &target, |key| claim.grants_group(key), &owner) {
        keep.insert(ensure(&ctx.client, log, binding).await?.name_any());
    }
    prune_role_bindings(&ctx.client, log, &target, &keep, &uid).await?;

    let mut secrets = paas.spec.ssh_secrets.clone();
    secrets.extend(claim.spec.ssh_secrets.clone());
    let decryptor = ctx
        .decryptor(&paas.name_any(), &config.decrypt_keys_secret, !secrets.is_empty())
        .await?;
    sync_ssh_secrets(&ctx.client, log, decryptor.as_ref(), &target, &secrets, &owner).await
}

/// Deletes the claimed namespace unless another claim still produces it or
/// the project is already gone.
async fn finalize<C: ClusterClient>(ctx: &Context<C>, claim: &PaasNS, log: &mut StatusLog) -> Result<()> {
    let Some(paas) = project_of(&ctx.client, claim).await? else {
        debug!("project already gone");
        return Ok(());
    };
    let counts = match resolve_namespaces(&ctx.client, &paas).await {
        Ok(counts) => counts,
        Err(err) if err.is_terminal() => {
            warn!(error = %err, "claim tree unusable, keeping claimed namespace");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let home = home_namespace(claim)?;
    if !counts.contains_key(&home) {
        debug!(%home, "claim was never part of the project tree");
        return Ok(());
    }
    let target = claim.derived_namespace();
    if counts.get(&target).copied().unwrap_or_default() > 1 {
        debug!(%target, "namespace claimed elsewhere");
        return Ok(());
    }
    let uid = paas.uid_or_err()?;
    let Some(namespace) = ctx.client.get::<Namespace>(None, &target).await? else {
        return Ok(());
    };
    if !is_owned_by(&namespace.metadata, &uid) {
        return Ok(());
    }
    release::<C, ClusterResourceQuota>(&ctx.client, log, None, &target, &uid).await?;
    remove::<C, Namespace>(&ctx.client, log, None, &target).await
}
