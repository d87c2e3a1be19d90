use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::ClusterClient;
use crate::controller::Context;
use crate::router;

pub struct OperatorServer {
    pub addr: SocketAddr,
    pub listener: tokio::net::TcpListener,
    pub router: axum::Router,
}

impl OperatorServer {
    pub async fn new<C: ClusterClient>(bind_addr: &str, ctx: Arc<Context<C>>) -> std::io::Result<Self> {
        let router = router::new_router(ctx);
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;

        Ok(OperatorServer {
            addr,
            listener,
            router,
        })
    }

    pub async fn serve(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router).await
    }
}
