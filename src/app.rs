use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::{
    api,
    config::Config,
    engine::{EngineSettings, LocalQueue, ProviderRegistry, VerificationEngine},
    observability::Telemetry,
    providers::{
        GrisProvider, IncandescentProvider, IzitruProvider, TinEyeProvider, build_http_client,
    },
    store::{Collaborators, PgStore, StoreHealth},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    engine: VerificationEngine,
    queue: LocalQueue,
    health: Arc<dyn StoreHealth>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn engine(&self) -> &VerificationEngine {
        &self.registry.engine
    }

    pub(crate) fn queue(&self) -> &LocalQueue {
        &self.registry.queue
    }

    pub(crate) fn health(&self) -> Arc<dyn StoreHealth> {
        Arc::clone(&self.registry.health)
    }
}

impl ComponentRegistry {
    /// 構成情報から DB プール、プロバイダー、タスクキューとエンジンを初期化する。
    ///
    /// スキーマは起動時に適用し、失敗した場合は起動を中止する。
    ///
    /// # Errors
    /// Telemetry の初期化、スキーマ適用、HTTP クライアント構築が失敗した場合はエラーを返す。
    pub async fn build(config: Config) -> Result<Self> {
        let telemetry = Telemetry::new()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.verify_db_max_connections())
            .min_connections(config.verify_db_min_connections())
            .acquire_timeout(config.verify_db_acquire_timeout())
            .idle_timeout(Some(config.verify_db_idle_timeout()))
            .max_lifetime(Some(config.verify_db_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.verify_db_dsn())
            .context("failed to configure verify_db connection pool")?;
        let store = Arc::new(PgStore::new(pool));
        store.ensure_schema().await?;

        let providers = build_provider_registry(&config)?;
        let stores = Collaborators::from_backend(Arc::clone(&store));
        Ok(Self::assemble(config, telemetry, stores, store, providers))
    }

    /// Wires an engine over the given collaborators and starts its workers.
    ///
    /// Must run inside a Tokio runtime.
    pub fn assemble(
        config: Config,
        telemetry: Telemetry,
        stores: Collaborators,
        health: Arc<dyn StoreHealth>,
        providers: ProviderRegistry,
    ) -> Self {
        let config = Arc::new(config);
        let metrics = telemetry.metrics();
        let queue = LocalQueue::new(Arc::clone(&metrics));
        let engine = VerificationEngine::new(
            stores,
            providers,
            Arc::new(queue.clone()),
            EngineSettings {
                desk_name: config.verified_desk_name().to_string(),
                write_policy: config.store_write_policy(),
            },
            metrics,
        );
        let _workers = queue.start(
            Arc::new(engine.clone()),
            config.worker_concurrency().get(),
        );

        Self {
            config,
            telemetry,
            engine,
            queue,
            health,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &VerificationEngine {
        &self.engine
    }

    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }
}

/// 認証情報が揃ったプロバイダーだけを登録する。
fn build_provider_registry(config: &Config) -> Result<ProviderRegistry> {
    let client = build_http_client(config.provider_http_settings())?;
    let policy = config.provider_retry_policy();
    let credentials = config.providers();
    let mut registry = ProviderRegistry::new();

    if let Some(tineye) = &credentials.tineye {
        let provider = TinEyeProvider::new(client.clone(), &tineye.api_url, tineye.api_key.clone())?;
        registry = registry.with_sync(Arc::new(provider), policy)?;
    }
    if let Some(gris) = &credentials.gris {
        let provider = GrisProvider::new(
            client.clone(),
            &gris.api_url,
            gris.api_key.clone(),
            gris.cx.clone(),
        )?;
        registry = registry.with_sync(Arc::new(provider), policy)?;
    }
    if let Some(izitru) = &credentials.izitru {
        let provider = IzitruProvider::new(
            client.clone(),
            &izitru.api_url,
            izitru.activation_key.clone(),
            izitru.private_key.clone(),
        )?;
        registry = registry.with_sync(Arc::new(provider), policy)?;
    }
    if let Some(incandescent) = &credentials.incandescent {
        let provider = IncandescentProvider::new(
            client,
            &incandescent.api_url,
            incandescent.uid.clone(),
            incandescent.api_key.clone(),
        )?;
        registry = registry.with_async(
            Arc::new(provider),
            policy,
            config.resolve_retry_policy(),
        )?;
    }

    if registry.is_empty() {
        warn!("no provider credentials configured, items will be finalized without verification");
    } else {
        info!(providers = ?registry.branch_ids(), "registered verification providers");
    }
    Ok(registry)
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
