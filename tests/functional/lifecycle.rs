use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::Api;
use serde_json::Value;
use tokio::time::{Duration, sleep};

use paas_operator::client::KubeClient;
use paas_operator::config::ReconcileConfig;
use paas_operator::controller::{self, Context};
use paas_operator::crd::{ClusterResourceQuota, Paas, PaasNS};
use paas_operator::server::OperatorServer;
use paas_operator::status::{CONDITION_READY, is_condition_true};

use crate::{TestCluster, TestResources};

async fn start_operator(cluster: &TestCluster) -> Result<String, Box<dyn std::error::Error>> {
    let ctx = Arc::new(Context::new(
        KubeClient::new(cluster.client.clone(), "paas-operator-functional"),
        ReconcileConfig::default(),
    ));
    let server = OperatorServer::new("127.0.0.1:0", ctx.clone()).await?;
    let server_url = format!("http://{}", server.addr);
    tokio::spawn(server.serve());
    tokio::spawn(controller::run(ctx));
    Ok(server_url)
}

fn ready(paas: Option<&Paas>) -> bool {
    paas.and_then(|p| p.status.as_ref())
        .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY))
}

fn gone_or_terminating(ns: Option<&Namespace>) -> bool {
    ns.is_none_or(|ns| ns.metadata.deletion_timestamp.is_some())
}

#[tokio::test]
async fn test_paas_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TestResources::new(cluster.client.clone());
    resources.install_crds().await?;
    let server_url = start_operator(&cluster).await?;

    resources.create_config("paas-config").await?;
    resources.create_paas("func").await?;

    let projects: Api<Paas> = Api::all(cluster.client.clone());
    resources.wait_for(&projects, "func", ready).await?;

    let namespaces: Api<Namespace> = Api::all(cluster.client.clone());
    for name in ["func", "func-argocd"] {
        let ns = namespaces.get(name).await?;
        assert_eq!(ns.metadata.labels.unwrap()["clusterquotagroup"], name);
    }
    let quotas: Api<ClusterResourceQuota> = Api::all(cluster.client.clone());
    assert!(quotas.get_opt("func").await?.is_some());
    assert!(quotas.get_opt("func-argocd").await?.is_some());
    let bindings: Api<RoleBinding> = Api::namespaced(cluster.client.clone(), "func");
    let admin = bindings.get("paas-admin").await?;
    assert_eq!(admin.subjects.unwrap()[0].name, "func-ops");

    let state: Value = reqwest::get(format!("{server_url}/state")).await?.json().await?;
    assert_eq!(state["activeConfig"], "paas-config");
    assert!(state["kinds"]["Paas"]["reconciled"].as_u64().unwrap() >= 1);

    resources.delete_paas("func").await?;
    resources.wait_for(&projects, "func", |p| p.is_none()).await?;
    resources.wait_for(&namespaces, "func", gone_or_terminating).await?;
    resources.wait_for(&namespaces, "func-argocd", gone_or_terminating).await?;
    assert!(quotas.get_opt("func").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_claim_creates_namespace_and_rejects_strangers() -> Result<(), Box<dyn std::error::Error>> {
    let cluster = TestCluster::new().await?;
    let resources = TestResources::new(cluster.client.clone());
    resources.install_crds().await?;
    start_operator(&cluster).await?;

    resources.create_config("paas-config").await?;
    resources.create_paas("team").await?;
    let projects: Api<Paas> = Api::all(cluster.client.clone());
    resources.wait_for(&projects, "team", ready).await?;

    resources.create_claim("team", "extra", "team").await?;
    let namespaces: Api<Namespace> = Api::all(cluster.client.clone());
    resources.wait_for(&namespaces, "team-extra", |ns| ns.is_some()).await?;

    resources.create_claim("default", "rogue", "team").await?;
    let claims: Api<PaasNS> = Api::namespaced(cluster.client.clone(), "default");
    resources
        .wait_for(&claims, "rogue", |claim| {
            claim
                .and_then(|c| c.status.as_ref())
                .is_some_and(|s| s.messages.iter().any(|m| m.contains("does not belong to Paas team")))
        })
        .await?;
    sleep(Duration::from_secs(2)).await;
    assert!(namespaces.get_opt("team-rogue").await?.is_none());
    Ok(())
}
