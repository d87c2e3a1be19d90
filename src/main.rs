use std::sync::Arc;

use envconfig::Envconfig;
use tracing::{error, info};

use paas_operator::client::KubeClient;
use paas_operator::config::OperatorConfig;
use paas_operator::controller::{self, Context};
use paas_operator::server::OperatorServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    paas_operator::init_tracing("paas_operator=info");

    let config = OperatorConfig::init_from_env()?;
    let client = kube::Client::try_default().await?;
    let ctx = Arc::new(Context::new(
        KubeClient::new(client, config.field_manager.clone()),
        config.reconcile.clone(),
    ));

    let server = OperatorServer::new(&config.http_addr, ctx.clone()).await?;
    info!(addr = %server.addr, "serving health and state");

    tokio::select! {
        served = server.serve() => {
            if let Err(err) = &served {
                error!(error = %err, "http server stopped");
            }
            served?;
        }
        _ = controller::run(ctx) => info!("controllers stopped"),
    }
    Ok(())
}
