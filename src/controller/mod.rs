//! Reconciler core shared by the `Paas` and `PaasNS` controllers.
//!
//! Both kinds follow the same lifecycle: an active object without our
//! finalizer gets one and is requeued, an active object with the finalizer is
//! synchronized, a terminating object with the finalizer is finalized and
//! released, and a terminating object without it is left alone.

pub mod finalize;
pub mod paas;
pub mod paas_config;
pub mod paasns;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use paas_config::ActiveConfigSource;

use crate::client::{ClusterClient, ClusterObject, KubeClient, describe};
use crate::config::ReconcileConfig;
use crate::crd::{NamespacedName, Paas, PaasConfig, PaasNS, PaasStatus};
use crate::decrypt::{Decrypt, DecryptorRegistry, RsaDecryptor};
use crate::error::{Error, Result};
use crate::status::{StatusLog, summarize};
use crate::sync::managed_selector;

/// Counters for one reconciled kind, served on `/state`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KindCounters {
    pub reconciled: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub last_event: Option<DateTime<Utc>>,
    pub kinds: BTreeMap<String, KindCounters>,
}

impl Diagnostics {
    pub fn record<T>(&mut self, kind: &str, result: &Result<T>) {
        self.last_event = Some(Utc::now());
        let counters = self.kinds.entry(kind.to_string()).or_default();
        match result {
            Ok(_) => counters.reconciled += 1,
            Err(err) => {
                counters.failed += 1;
                counters.last_error = Some(err.to_string());
            }
        }
    }
}

pub type SharedDiagnostics = Arc<RwLock<Diagnostics>>;

/// Everything a reconcile pass needs. Built once at startup and shared by
/// every worker.
pub struct Context<C> {
    pub client: C,
    pub reconcile: ReconcileConfig,
    pub decryptors: DecryptorRegistry,
    pub active_config: ActiveConfigSource,
    pub diagnostics: SharedDiagnostics,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(client: C, reconcile: ReconcileConfig) -> Self {
        Self {
            client,
            reconcile,
            decryptors: DecryptorRegistry::new(),
            active_config: ActiveConfigSource::new(),
            diagnostics: SharedDiagnostics::default(),
        }
    }

    async fn observe<T>(&self, kind: &str, result: &Result<T>) {
        self.diagnostics.write().await.record(kind, result);
    }

    /// Decryptor for `project`. Projects without secrets get one that holds
    /// no keys, so the key secret is only required when there is something
    /// to decrypt.
    pub(crate) async fn decryptor(
        &self,
        project: &str,
        keys: &NamespacedName,
        needed: bool,
    ) -> Result<Arc<dyn Decrypt>> {
        if !needed {
            return Ok(Arc::new(RsaDecryptor::from_pem(std::iter::empty())?));
        }
        self.decryptors.for_project(&self.client, project, keys).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AddFinalizer,
    Reconcile,
    Finalize,
    Ignore,
}

pub fn next_step(meta: &ObjectMeta, finalizer: &str) -> Step {
    let has_finalizer = meta.finalizers.iter().flatten().any(|f| f == finalizer);
    match (meta.deletion_timestamp.is_some(), has_finalizer) {
        (false, false) => Step::AddFinalizer,
        (false, true) => Step::Reconcile,
        (true, true) => Step::Finalize,
        (true, false) => Step::Ignore,
    }
}

pub(crate) async fn add_finalizer<C: ClusterClient, K: ClusterObject>(
    client: &C,
    obj: &K,
    finalizer: &str,
) -> Result<()> {
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    client
        .patch_finalizers::<K>(
            obj.namespace().as_deref(),
            &obj.name_any(),
            finalizers,
            obj.resource_version(),
        )
        .await
}

pub(crate) async fn remove_finalizer<C: ClusterClient, K: ClusterObject>(
    client: &C,
    obj: &K,
    finalizer: &str,
) -> Result<()> {
    let finalizers = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    client
        .patch_finalizers::<K>(
            obj.namespace().as_deref(),
            &obj.name_any(),
            finalizers,
            obj.resource_version(),
        )
        .await
}

/// Writes the status of a pass and turns its outcome into an action.
/// Terminal errors are reported and wait for the object to change; other
/// errors go back to the controller for a requeue.
pub(crate) async fn finish<C: ClusterClient, K: ClusterObject>(
    ctx: &Context<C>,
    obj: &K,
    previous: Option<&PaasStatus>,
    log: &StatusLog,
    result: Result<()>,
) -> Result<Action> {
    let status = summarize(previous, log, obj.meta().generation, result.as_ref().err());
    let target = describe::<K>(obj.namespace().as_deref(), &obj.name_any());
    let written = ctx
        .client
        .patch_status::<K>(
            obj.namespace().as_deref(),
            &obj.name_any(),
            serde_json::to_value(&status)?,
        )
        .await;
    if let Err(err) = &written {
        warn!(object = %target, error = %err, "failed to write status");
    }

    match result {
        Ok(()) => {
            written?;
            info!(object = %target, "reconciled");
            Ok(Action::requeue(ctx.reconcile.resync()))
        }
        Err(err) if err.is_terminal() => {
            warn!(object = %target, error = %err, "reconcile stopped on invalid input");
            Ok(Action::await_change())
        }
        Err(err) => Err(err),
    }
}

/// Writes the status of a failed teardown so a stuck deletion is visible on
/// the object. The error is handed back; the finalizer stays in place.
pub(crate) async fn report_teardown_failure<C: ClusterClient, K: ClusterObject>(
    ctx: &Context<C>,
    obj: &K,
    previous: Option<&PaasStatus>,
    log: &StatusLog,
    err: Error,
) -> Error {
    let status = summarize(previous, log, obj.meta().generation, Some(&err));
    let target = describe::<K>(obj.namespace().as_deref(), &obj.name_any());
    let written = match serde_json::to_value(&status) {
        Ok(value) => {
            ctx.client
                .patch_status::<K>(obj.namespace().as_deref(), &obj.name_any(), value)
                .await
        }
        Err(encode) => Err(encode.into()),
    };
    if let Err(write_err) = written {
        warn!(object = %target, error = %write_err, "failed to write status");
    }
    warn!(object = %target, error = %err, "finalization failed");
    err
}

pub fn error_policy<K: ClusterObject, C: ClusterClient>(
    obj: Arc<K>,
    error: &Error,
    ctx: Arc<Context<C>>,
) -> Action {
    let target = describe::<K>(obj.namespace().as_deref(), &obj.name_any());
    if error.is_conflict() {
        debug!(object = %target, "write conflict, requeuing");
        return Action::requeue(ctx.reconcile.conflict_backoff());
    }
    warn!(object = %target, error = %error, kind = error.metric_label(), "reconcile failed, requeuing");
    Action::requeue(ctx.reconcile.error_backoff())
}

fn requeue_now() -> Action {
    Action::requeue(Duration::ZERO)
}

fn log_outcome<K: Resource>(
    kind: &'static str,
) -> impl Fn(std::result::Result<(ObjectRef<K>, Action), controller::Error<Error, watcher::Error>>) -> futures::future::Ready<()>
{
    move |res| {
        match res {
            Ok((obj, action)) => debug!(kind, name = %obj.name, ?action, "reconcile finished"),
            Err(err) => warn!(kind, error = %err, "controller error"),
        }
        futures::future::ready(())
    }
}

/// Runs the `Paas`, `PaasNS` and `PaasConfig` controllers until shutdown.
pub async fn run(ctx: Arc<Context<KubeClient>>) {
    let client = ctx.client.inner().clone();
    let concurrency = controller::Config::default().concurrency(ctx.reconcile.concurrency);
    let owned = watcher::Config::default().labels(&managed_selector());

    let paas = Controller::new(Api::<Paas>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Namespace>::all(client.clone()), owned)
        .with_config(concurrency.clone())
        .shutdown_on_signal()
        .run(paas::reconcile::<KubeClient>, error_policy::<Paas, KubeClient>, ctx.clone())
        .for_each(log_outcome("Paas"));

    let paasns = Controller::new(Api::<PaasNS>::all(client.clone()), watcher::Config::default())
        .with_config(concurrency)
        .shutdown_on_signal()
        .run(paasns::reconcile::<KubeClient>, error_policy::<PaasNS, KubeClient>, ctx.clone())
        .for_each(log_outcome("PaasNS"));

    let configs = Controller::new(Api::<PaasConfig>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(
            paas_config::reconcile::<KubeClient>,
            error_policy::<PaasConfig, KubeClient>,
            ctx,
        )
        .for_each(log_outcome("PaasConfig"));

    info!("starting controllers");
    tokio::join!(paas, paasns, configs);
    info!("controllers stopped");
}
