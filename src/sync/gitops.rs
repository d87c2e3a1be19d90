use std::collections::BTreeMap;

use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::{Value, json};
use tracing::info;

use super::{Synced, managed_labels};
use crate::client::{ClusterClient, describe};
use crate::crd::{
    Application, ApplicationSet, ApplicationSetGenerator, ApplicationSpec, CapabilityKind,
    ConfigCapability, ListGenerator, Paas, PaasCapability,
};
use crate::crd::foreign::{ApplicationDestination, ApplicationSource};
use crate::error::{Error, Result};
use crate::status::{StatusAction, StatusLog};

/// Key identifying a project's element in an application-set list generator.
pub const ENTRY_KEY: &str = "paas";
pub const BOOTSTRAP_APPLICATION: &str = "paas-bootstrap";

pub type Entry = BTreeMap<String, Value>;

/// Whether a capability's entry points at the project's own git repository.
fn uses_git_source(kind: CapabilityKind) -> bool {
    match kind {
        CapabilityKind::ArgoCd | CapabilityKind::Tekton => true,
        CapabilityKind::Keycloak | CapabilityKind::Grafana => false,
    }
}

/// The list element describing `paas` to the capability's application set.
/// Custom fields from the config are defaults the capability may override.
pub fn appset_entry(
    paas: &Paas,
    kind: CapabilityKind,
    capability: &PaasCapability,
    configured: &ConfigCapability,
) -> Entry {
    let mut entry = Entry::new();
    entry.insert(ENTRY_KEY.into(), json!(paas.name_any()));
    entry.insert("requestor".into(), json!(paas.spec.requestor));
    entry.insert("service".into(), json!(kind.name()));
    for (field, value) in configured.custom_fields.iter().chain(&capability.custom_fields) {
        entry.insert(field.clone(), json!(value));
    }
    if uses_git_source(kind) {
        let git = [
            ("git_url", &capability.git_url),
            ("git_revision", &capability.git_revision),
            ("git_path", &capability.git_path),
        ];
        for (field, value) in git {
            if let Some(value) = value {
                entry.insert(field.into(), json!(value));
            }
        }
    }
    entry
}

fn entry_name(entry: &Entry) -> Option<&str> {
    entry.get(ENTRY_KEY).and_then(Value::as_str)
}

/// Puts `entry` in the first list generator, replacing any element with the
/// same project name. Returns whether anything changed.
fn upsert(appset: &mut ApplicationSet, entry: &Entry) -> bool {
    let generators = &mut appset.spec.generators;
    if !generators.iter().any(|g| g.list.is_some()) {
        generators.push(ApplicationSetGenerator {
            list: Some(ListGenerator::default()),
            ..Default::default()
        });
    }
    let Some(list) = generators.iter_mut().find_map(|g| g.list.as_mut()) else {
        return false;
    };
    let name = entry_name(entry);
    match list.elements.iter_mut().find(|e| entry_name(e) == name) {
        Some(existing) if *existing == *entry => false,
        Some(existing) => {
            *existing = entry.clone();
            true
        }
        None => {
            list.elements.push(entry.clone());
            true
        }
    }
}

fn remove_entry(appset: &mut ApplicationSet, project: &str) -> bool {
    let mut changed = false;
    for list in appset.spec.generators.iter_mut().filter_map(|g| g.list.as_mut()) {
        let before = list.elements.len();
        list.elements.retain(|e| entry_name(e) != Some(project));
        changed |= before != list.elements.len();
    }
    changed
}

async fn edit_appset<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    namespace: &str,
    name: &str,
    missing_ok: bool,
    edit: impl FnOnce(&mut ApplicationSet) -> bool,
) -> Result<()> {
    let target = describe::<ApplicationSet>(Some(namespace), name);
    let found = match client.get::<ApplicationSet>(Some(namespace), name).await {
        Ok(found) => found,
        Err(err) => {
            log.error(StatusAction::Find, &target, &err.to_string());
            return Err(err);
        }
    };
    let Some(mut appset) = found else {
        if missing_ok {
            log.info(StatusAction::Find, &target, "not found");
            return Ok(());
        }
        let err = Error::Validation(format!("{target} does not exist"));
        log.error(StatusAction::Find, &target, &err.to_string());
        return Err(err);
    };

    if !edit(&mut appset) {
        log.info(StatusAction::Find, &target, "unchanged");
        return Ok(());
    }
    match client.replace(&appset).await {
        Ok(_) => {
            info!(object = %target, "updated application set");
            log.info(StatusAction::Update, &target, "list entries updated");
            Ok(())
        }
        Err(err) => {
            log.error(StatusAction::Update, &target, &err.to_string());
            Err(err)
        }
    }
}

/// Merges the project's entry into the application set, keyed by project.
pub async fn upsert_appset_entry<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    namespace: &str,
    appset: &str,
    entry: &Entry,
) -> Result<()> {
    edit_appset(client, log, namespace, appset, false, |set| upsert(set, entry)).await
}

pub async fn remove_appset_entry<C: ClusterClient>(
    client: &C,
    log: &mut StatusLog,
    namespace: &str,
    appset: &str,
    project: &str,
) -> Result<()> {
    edit_appset(client, log, namespace, appset, true, |set| remove_entry(set, project)).await
}

impl Synced for Application {
    fn spec_matches(&self, desired: &Self) -> bool {
        self.spec.project == desired.spec.project
            && self.spec.destination == desired.spec.destination
            && self.spec.source == desired.spec.source
    }

    fn merge_spec(&mut self, desired: &Self) {
        self.spec.project = desired.spec.project.clone();
        self.spec.destination = desired.spec.destination.clone();
        self.spec.source = desired.spec.source.clone();
        if self.spec.sync_policy.is_none() {
            self.spec.sync_policy = desired.spec.sync_policy.clone();
        }
    }
}

/// The application that bootstraps a capability from the project's own
/// repository, for the capabilities that have one.
pub fn bootstrap_application(
    paas: &Paas,
    kind: CapabilityKind,
    capability: &PaasCapability,
) -> Result<Option<Application>> {
    let repo_url = match kind {
        CapabilityKind::ArgoCd => capability.git_url.as_ref(),
        CapabilityKind::Tekton | CapabilityKind::Keycloak | CapabilityKind::Grafana => None,
    };
    let Some(repo_url) = repo_url.filter(|url| !url.is_empty()) else {
        return Ok(None);
    };

    let namespace = paas.capability_namespace(kind);
    let mut app = Application::new(
        BOOTSTRAP_APPLICATION,
        ApplicationSpec {
            project: "default".into(),
            destination: ApplicationDestination {
                server: Some("https://kubernetes.default.svc".into()),
                namespace: Some(namespace.clone()),
            },
            source: ApplicationSource {
                repo_url: repo_url.clone(),
                path: capability.git_path.clone().unwrap_or_else(|| ".".into()),
                target_revision: capability.git_revision.clone().unwrap_or_else(|| "HEAD".into()),
            },
            sync_policy: Some(json!({ "automated": { "prune": false, "selfHeal": true } })),
            extra: BTreeMap::new(),
        },
    );
    app.metadata = ObjectMeta {
        name: Some(BOOTSTRAP_APPLICATION.into()),
        namespace: Some(namespace),
        labels: Some(managed_labels()),
        owner_references: Some(vec![paas.owner_reference()?]),
        ..Default::default()
    };
    Ok(Some(app))
}
