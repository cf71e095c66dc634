//! Process-wide state, built once at startup and passed down explicitly.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::connection::Registry;
use crate::endpoint::{KernelSide, NetworkSide};
use crate::router::{self, LoadReport, Router};
use crate::shutdown::Shutdown;

/// Everything the core shares between tasks.
pub struct Context {
    pub config: Config,
    pub router: Arc<Router>,
    pub kernel: Arc<dyn KernelSide>,
    pub network: Arc<dyn NetworkSide>,
    pub registry: Arc<Registry>,
    pub shutdown: Shutdown,
}

impl Context {
    /// Build the context and load the static routing table, if configured.
    ///
    /// A table that cannot be read is logged and the gateway starts with no
    /// static routes.
    pub fn new(config: Config, kernel: Arc<dyn KernelSide>, network: Arc<dyn NetworkSide>) -> Self {
        let router = Arc::new(Router::new());
        let context = Self::with_router(config, router, kernel, network);

        if let Some(path) = &context.config.routing.table_path {
            if let Err(e) = router::table::load(&context.router, path) {
                warn!(path = %path.display(), error = %e, "Continuing without static routes");
            }
        }

        context
    }

    /// Build the context around an existing router.
    pub fn with_router(
        config: Config,
        router: Arc<Router>,
        kernel: Arc<dyn KernelSide>,
        network: Arc<dyn NetworkSide>,
    ) -> Self {
        let registry = Arc::new(Registry::new(
            config.connection.clone(),
            Arc::clone(&router),
            Arc::clone(&kernel),
            Arc::clone(&network),
        ));
        let shutdown = Shutdown::new(config.shutdown.clone());

        info!(
            idle_threshold = ?config.connection.idle_threshold,
            reclaim_interval = ?config.connection.reclaim_interval,
            "Context ready"
        );

        Self {
            config,
            router,
            kernel,
            network,
            registry,
            shutdown,
        }
    }

    /// Load additional routing entries.
    pub fn load_routes(&self, entries: Vec<serde_json::Value>) -> LoadReport {
        self.router.load_table(entries)
    }
}
