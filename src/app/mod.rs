pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::forward::{Forwarder, Handler};
use crate::router::provider::{spawn_scope_reload, ScopeSource, SharedScope};

use server::DnsServer;

pub struct App {
    listen: SocketAddr,
    handler: Arc<dyn Handler>,
    reloaders: Vec<JoinHandle<()>>,
}

impl App {
    /// Build the forwarder chain; stanza i hands out-of-scope queries to stanza i+1.
    pub fn new(config: Config) -> Result<Self> {
        let listen: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", config.listen, e))?;

        let mut next: Option<Arc<dyn Handler>> = None;
        let mut reloaders = Vec::new();
        for forward in config.forwards.iter().rev() {
            let source = ScopeSource::new(forward.from.clone());
            let scope: SharedScope = Arc::new(ArcSwap::from_pointee(source.build()?));

            let mut forwarder = Forwarder::from_config(forward, scope.clone())?;
            if let Some(next) = next.take() {
                forwarder = forwarder.with_next(next);
            }
            if let Some(handle) =
                spawn_scope_reload(forward.name.clone(), scope, source, forward.reload_interval())
            {
                reloaders.push(handle);
            }
            next = Some(Arc::new(forwarder));
        }
        let handler = next.ok_or_else(|| anyhow::anyhow!("at least one forward is required"))?;

        Ok(Self {
            listen,
            handler,
            reloaders,
        })
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    pub async fn run(self) -> Result<()> {
        let server = DnsServer::bind(self.listen, self.handler.clone()).await?;
        let cancel = CancellationToken::new();
        let serve = tokio::spawn(server.run(cancel.clone()));
        info!(listen = %self.listen, "geoforward started");

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        cancel.cancel();
        for handle in &self.reloaders {
            handle.abort();
        }
        let _ = serve.await;
        Ok(())
    }
}
