use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, CustomResourceExt, Resource};
use serde_json::json;

use paas_operator::crd::{Paas, PaasConfig, PaasConfigSpec, PaasNS, PaasSpec};

/// Kinds normally installed by OpenShift and Argo CD: (group, kind, plural, namespaced).
const FOREIGN_KINDS: [(&str, &str, &str, bool); 4] = [
    ("quota.openshift.io", "ClusterResourceQuota", "clusterresourcequotas", false),
    ("user.openshift.io", "Group", "groups", false),
    ("argoproj.io", "ApplicationSet", "applicationsets", true),
    ("argoproj.io", "Application", "applications", true),
];

pub struct TestResources {
    pub client: Client,
}

/// Schemaless CRD standing in for a kind another operator would install.
fn foreign_crd(group: &str, kind: &str, plural: &str, namespaced: bool) -> serde_json::Result<CustomResourceDefinition> {
    serde_json::from_value(json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{plural}.{group}") },
        "spec": {
            "group": group,
            "names": { "kind": kind, "plural": plural },
            "scope": if namespaced { "Namespaced" } else { "Cluster" },
            "versions": [{
                "name": "v1",
                "served": true,
                "storage": true,
                "schema": { "openAPIV3Schema": {
                    "type": "object",
                    "x-kubernetes-preserve-unknown-fields": true
                }}
            }]
        }
    }))
}

impl TestResources {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn install_crds(&self) -> Result<(), Box<dyn std::error::Error>> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let mut all = vec![Paas::crd(), PaasNS::crd(), PaasConfig::crd()];
        for (group, kind, plural, namespaced) in FOREIGN_KINDS {
            all.push(foreign_crd(group, kind, plural, namespaced)?);
        }
        for crd in &all {
            match crds.create(&PostParams::default(), crd).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
        // CRDs take a moment before their endpoints are served.
        let configs: Api<PaasConfig> = Api::all(self.client.clone());
        for _ in 0..60 {
            if configs.list(&Default::default()).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err("custom resource definitions were not served in time".into())
    }

    pub async fn create_config(&self, name: &str) -> Result<PaasConfig, Box<dyn std::error::Error>> {
        let spec: PaasConfigSpec = serde_json::from_value(json!({
            "capabilities": {
                "argocd": { "quotas": { "defaults": { "cpu": "1" } } }
            },
            "roleMappings": { "admin": ["admin"] }
        }))?;
        let configs: Api<PaasConfig> = Api::all(self.client.clone());
        Ok(configs.create(&PostParams::default(), &PaasConfig::new(name, spec)).await?)
    }

    pub async fn create_paas(&self, name: &str) -> Result<Paas, Box<dyn std::error::Error>> {
        let spec: PaasSpec = serde_json::from_value(json!({
            "requestor": "functional",
            "quota": { "cpu": "2" },
            "capabilities": { "argocd": { "enabled": true } },
            "groups": { "ops": { "users": ["alice"] } }
        }))?;
        let projects: Api<Paas> = Api::all(self.client.clone());
        Ok(projects.create(&PostParams::default(), &Paas::new(name, spec)).await?)
    }

    pub async fn create_claim(
        &self,
        namespace: &str,
        name: &str,
        paas: &str,
    ) -> Result<PaasNS, Box<dyn std::error::Error>> {
        let claim: PaasNS = serde_json::from_value(json!({
            "apiVersion": "cpet.belastingdienst.nl/v1alpha1",
            "kind": "PaasNS",
            "metadata": { "name": name, "namespace": namespace },
            "spec": { "paas": paas }
        }))?;
        let claims: Api<PaasNS> = Api::namespaced(self.client.clone(), namespace);
        Ok(claims.create(&PostParams::default(), &claim).await?)
    }

    pub async fn delete_paas(&self, name: &str) -> Result<(), Box<dyn std::error::Error>> {
        let projects: Api<Paas> = Api::all(self.client.clone());
        match projects.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Polls `api` until `check` accepts the object (or its absence).
    pub async fn wait_for<K>(
        &self,
        api: &Api<K>,
        name: &str,
        check: impl Fn(Option<&K>) -> bool,
    ) -> Result<(), Box<dyn std::error::Error>>
    where
        K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        for _ in 0..90 {
            let found = api.get_opt(name).await?;
            if check(found.as_ref()) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(format!("{name} did not reach the expected state").into())
    }
}
