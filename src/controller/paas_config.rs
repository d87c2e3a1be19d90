//! Activation of `PaasConfig` objects and lookup of the active one.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::client::ClusterClient;
use crate::crd::{CapabilityKind, PaasConfig, PaasConfigSpec, PaasConfigStatus};
use crate::error::{Error, Result};
use crate::status::{CONDITION_ACTIVE, set_condition};

pub const REASON_ACTIVATED: &str = "Activated";
pub const REASON_ANOTHER_ACTIVE: &str = "AnotherConfigActive";
pub const REASON_INVALID: &str = "InvalidConfig";

/// Finds the config carrying `Active=True`. The name of the last config
/// found is kept for diagnostics.
#[derive(Default)]
pub struct ActiveConfigSource {
    last_active: RwLock<Option<String>>,
}

impl ActiveConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current<C: ClusterClient>(&self, client: &C) -> Result<PaasConfigSpec> {
        let mut configs: Vec<PaasConfig> = client.list(None, None).await?;
        configs.retain(PaasConfig::is_active);
        configs.sort_by_key(|c| c.name_any());
        let Some(active) = configs.into_iter().next() else {
            *self.last_active.write().await = None;
            return Err(Error::NoActiveConfig);
        };
        *self.last_active.write().await = Some(active.name_any());
        Ok(active.spec)
    }

    pub async fn last_active(&self) -> Option<String> {
        self.last_active.read().await.clone()
    }
}

/// Every configured capability must carry a parseable quota policy and
/// must name a known capability.
fn validate(spec: &PaasConfigSpec) -> Result<()> {
    for (name, capability) in &spec.capabilities {
        if CapabilityKind::from_name(name).is_none() {
            return Err(Error::Validation(format!("unknown capability {name}")));
        }
        capability.quotas.policy()?;
    }
    Ok(())
}

/// Orders activation candidates: oldest first, then by name.
fn is_preferred(config: &PaasConfig, others: &[PaasConfig]) -> bool {
    let key = |c: &PaasConfig| (c.creation_timestamp().map(|t| t.0), c.name_any());
    others.iter().all(|other| key(config) <= key(other))
}

/// Decides the `Active` condition of `config` given every config in the
/// cluster.
pub fn activation(config: &PaasConfig, all: &[PaasConfig]) -> (bool, &'static str, String) {
    if let Err(err) = validate(&config.spec) {
        return (false, REASON_INVALID, err.to_string());
    }
    let name = config.name_any();
    let others: Vec<PaasConfig> = all
        .iter()
        .filter(|c| c.name_any() != name && c.meta().deletion_timestamp.is_none())
        .cloned()
        .collect();

    // Two configs can both carry Active=True; only the preferred one keeps it.
    let active_others: Vec<PaasConfig> = others.iter().filter(|c| c.is_active()).cloned().collect();
    if config.is_active() && is_preferred(config, &active_others) {
        return (true, REASON_ACTIVATED, "this config is active".into());
    }
    if let Some(active) = active_others.first() {
        let message = format!("PaasConfig {} is already active", active.name_any());
        return (false, REASON_ANOTHER_ACTIVE, message);
    }
    let candidates: Vec<PaasConfig> = others
        .into_iter()
        .filter(|c| validate(&c.spec).is_ok())
        .collect();
    if is_preferred(config, &candidates) {
        (true, REASON_ACTIVATED, "this config is active".into())
    } else {
        (false, REASON_ANOTHER_ACTIVE, "an older config takes precedence".into())
    }
}

#[instrument(skip_all, fields(paasconfig = %config.name_any()))]
pub async fn reconcile<C: ClusterClient>(
    config: Arc<PaasConfig>,
    ctx: Arc<Context<C>>,
) -> Result<Action> {
    let result = activate(&config, &ctx).await;
    ctx.observe("PaasConfig", &result).await;
    result
}

async fn activate<C: ClusterClient>(config: &PaasConfig, ctx: &Context<C>) -> Result<Action> {
    if config.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let all: Vec<PaasConfig> = ctx.client.list(None, None).await?;
    let (active, reason, message) = activation(config, &all);

    let mut status = config.status.clone().unwrap_or_default();
    let before = status.conditions.clone();
    set_condition(
        &mut status.conditions,
        CONDITION_ACTIVE,
        active,
        reason,
        &message,
        config.meta().generation,
    );
    let unchanged = before.len() == status.conditions.len()
        && before.iter().zip(&status.conditions).all(|(a, b)| {
            a.status == b.status && a.reason == b.reason && a.message == b.message
                && a.observed_generation == b.observed_generation
        });
    if unchanged {
        debug!(active, "activation unchanged");
        return Ok(Action::requeue(ctx.reconcile.resync()));
    }

    ctx.client
        .patch_status::<PaasConfig>(
            None,
            &config.name_any(),
            serde_json::to_value(PaasConfigStatus {
                conditions: status.conditions,
            })?,
        )
        .await?;
    if active {
        info!(reason, "config activated");
    } else {
        warn!(reason, %message, "config not active");
    }
    Ok(Action::requeue(ctx.reconcile.resync()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::context;
    use crate::crd::paas_config::testing::config_spec;
    use crate::status::is_condition_true;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn config(name: &str, age_secs: i64) -> PaasConfig {
        let mut config = PaasConfig::new(name, config_spec());
        config.meta_mut().creation_timestamp =
            Some(Time(chrono::Utc::now() - chrono::Duration::seconds(age_secs)));
        config
    }

    fn stored(ctx: &Context<crate::client::fake::FakeClient>, name: &str) -> PaasConfig {
        ctx.client.stored(None, name).unwrap()
    }

    #[tokio::test]
    async fn test_single_config_becomes_active() {
        let ctx = context();
        let seeded = ctx.client.seed(config("main", 10));
        let err = tokio_test::assert_err!(ctx.active_config.current(&ctx.client).await);
        assert!(matches!(err, Error::NoActiveConfig));

        reconcile(Arc::new(seeded), ctx.clone()).await.unwrap();
        assert!(stored(&ctx, "main").is_active());
        let spec = ctx.active_config.current(&ctx.client).await.unwrap();
        assert_eq!(spec.capabilities.len(), 3);
        assert_eq!(ctx.active_config.last_active().await.as_deref(), Some("main"));

        let writes = ctx.client.writes();
        reconcile(Arc::new(stored(&ctx, "main")), ctx.clone()).await.unwrap();
        assert_eq!(ctx.client.writes(), writes);
    }

    #[tokio::test]
    async fn test_second_config_stays_inactive() {
        let ctx = context();
        let main = ctx.client.seed(config("main", 10));
        reconcile(Arc::new(main), ctx.clone()).await.unwrap();
        let newer = ctx.client.seed(config("newer", 1));
        reconcile(Arc::new(newer), ctx.clone()).await.unwrap();

        let newer = stored(&ctx, "newer");
        let conditions = &newer.status.as_ref().unwrap().conditions;
        assert!(!is_condition_true(conditions, CONDITION_ACTIVE));
        assert_eq!(conditions[0].reason, REASON_ANOTHER_ACTIVE);
        assert_eq!(ctx.active_config.current(&ctx.client).await.unwrap().capabilities.len(), 3);
    }

    #[test]
    fn test_older_candidate_wins_when_none_active() {
        let (old, new) = (config("b-old", 100), config("a-new", 1));
        let all = vec![old.clone(), new.clone()];
        assert!(activation(&old, &all).0);
        assert!(!activation(&new, &all).0);
    }

    #[tokio::test]
    async fn test_only_older_of_two_active_configs_stays_active() {
        let ctx = context();
        for (name, age) in [("older", 100), ("newer", 1)] {
            let mut c = config(name, age);
            let mut status = PaasConfigStatus::default();
            set_condition(&mut status.conditions, CONDITION_ACTIVE, true, REASON_ACTIVATED, "", None);
            c.status = Some(status);
            ctx.client.seed(c);
        }

        for name in ["newer", "older"] {
            reconcile(Arc::new(stored(&ctx, name)), ctx.clone()).await.unwrap();
        }

        assert!(stored(&ctx, "older").is_active());
        let newer = stored(&ctx, "newer");
        assert!(!newer.is_active());
        assert_eq!(newer.status.unwrap().conditions[0].reason, REASON_ANOTHER_ACTIVE);
        ctx.active_config.current(&ctx.client).await.unwrap();
        assert_eq!(ctx.active_config.last_active().await.as_deref(), Some("older"));
    }

    #[test]
    fn test_invalid_config_is_not_activated() {
        let mut bad = config("bad", 10);
        bad.spec.capabilities.insert("jenkins".into(), Default::default());
        let (active, reason, message) = activation(&bad, &[bad.clone()]);
        assert!(!active);
        assert_eq!(reason, REASON_INVALID);
        assert!(message.contains("jenkins"));
    }
}
