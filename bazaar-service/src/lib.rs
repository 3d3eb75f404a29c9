pub mod api;
pub mod bootstrap;
pub mod config;
pub mod model;
pub mod repo;
pub mod service;

#[cfg(test)]
test_r::enable!();

use crate::bootstrap::Services;
use crate::config::BazaarConfig;
use anyhow::{anyhow, Context};
use bazaar_service_base::db;
use poem::endpoint::PrometheusExporter;
use poem::listener::{Acceptor, Listener, TcpListener};
use poem::middleware::Cors;
use poem::{EndpointExt, Route};
use prometheus::Registry;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub struct RunDetails {
    pub http_port: u16,
}

/// The assembled control plane: configuration, wired services and the
/// shutdown signal shared with the background tasks.
pub struct ModelBazaar {
    config: BazaarConfig,
    services: Services,
    prometheus_registry: Registry,
    shutdown: CancellationToken,
}

impl ModelBazaar {
    pub async fn new(
        config: BazaarConfig,
        prometheus_registry: Registry,
    ) -> Result<Self, anyhow::Error> {
        debug!("initializing model bazaar");

        let db_pool = db::create_postgres_pool(&config.db)
            .await
            .context("DB pool creation")?;
        sqlx::migrate!("./db/migration/postgres")
            .run(&db_pool)
            .await
            .context("DB migration")?;

        let services = Services::new(&config, db_pool)
            .await
            .map_err(|err| anyhow!(err).context("service initialization"))?;

        services
            .user_service
            .ensure_initial_admin(
                &config.admin.username,
                &config.admin.email,
                &config.admin.password,
            )
            .await
            .context("initial admin creation")?;

        Ok(Self {
            config,
            services,
            prometheus_registry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Starts platform jobs, the reconciler, the upload janitor and the HTTP
    /// server. Long-lived tasks land in the join set.
    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        self.services
            .platform_jobs
            .start_all()
            .await
            .context("platform job startup")?;

        let reconciler_handle = self
            .services
            .reconciler
            .clone()
            .spawn(self.shutdown.clone());
        join_set.spawn(async move { reconciler_handle.await.map_err(|e| e.into()) });

        let upload_service = self.services.upload_service.clone();
        let janitor_interval = self.config.uploads.janitor_interval;
        let cancel = self.shutdown.clone();
        join_set.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    _ = tokio::time::sleep(janitor_interval) => {
                        if let Err(error) = upload_service.reap_expired().await {
                            warn!("upload janitor failed: {error}");
                        }
                    }
                }
            }
        });

        let http_port = self.start_http_server(join_set).await?;
        info!("model bazaar listening on port {http_port}");
        Ok(RunDetails { http_port })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn start_http_server(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<u16, anyhow::Error> {
        let api_service = api::make_open_api_service(&self.services);

        let ui = api_service.swagger_ui();
        let spec = api_service.spec_endpoint_yaml();
        let metrics = PrometheusExporter::new(self.prometheus_registry.clone());

        let cors = Cors::new()
            .allow_origin_regex(&self.config.cors_origin_regex)
            .allow_credentials(true);

        let app = Route::new()
            .nest("/", api_service)
            .nest("/docs", ui)
            .nest("/specs", spec)
            .nest("/metrics", metrics)
            .with(api::AuditMiddleware::new(self.services.audit_log.clone()))
            .with(cors);

        let listener = TcpListener::bind(format!("0.0.0.0:{}", self.config.http_port));
        let acceptor = listener.into_acceptor().await?;
        let port = acceptor.local_addr()[0]
            .as_socket_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.http_port);

        join_set.spawn(
            async move {
                poem::Server::new_with_acceptor(acceptor)
                    .run(app)
                    .await
                    .map_err(|e| e.into())
            }
            .in_current_span(),
        );

        Ok(port)
    }
}
