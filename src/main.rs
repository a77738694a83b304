use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use table_match::config::{Settings, StorageBackend};
use table_match::core::CompatibilityScorer;
use table_match::routes::{self, handle_json_payload_error, handle_path_error, AppState};
use table_match::services::{
    CacheManager, ChatProvisioner, EligibilityResolver, EngineContext, HttpChatProvisioner,
    InMemoryDirectory, InMemoryMatchingStore, LoggingProvisioner, ManualOverrideService,
    MatchingCoordinator, MatchingRepository, ParticipantDirectory, PostgresClient,
    ProvisioningDispatcher,
};

fn io_error(context: &str, err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, err))
}

fn init_logging(settings: &Settings) {
    // LOG_LEVEL / LOG_FORMAT win over the config file
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| settings.logging.level.clone());
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| settings.logging.format.clone());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    if format == "pretty" {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenv::dotenv().ok();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Err(io_error("configuration error", e));
        }
    };

    init_logging(&settings);

    info!("Starting table-match group matching service...");

    // Storage: Postgres for deployments, memory for local runs
    let (repository, directory): (Arc<dyn MatchingRepository>, Arc<dyn ParticipantDirectory>) =
        match settings.storage.backend {
            StorageBackend::Postgres => {
                let postgres = Arc::new(
                    PostgresClient::from_settings(
                        &settings.database.url,
                        settings.database.max_connections,
                        settings.database.min_connections,
                        settings.database.acquire_timeout_secs,
                        settings.database.idle_timeout_secs,
                    )
                    .await
                    .map_err(|e| {
                        error!("Failed to connect to PostgreSQL: {}", e);
                        io_error("PostgreSQL connection error", e)
                    })?,
                );
                info!("PostgreSQL client initialized");
                let repository: Arc<dyn MatchingRepository> = postgres.clone();
                let directory: Arc<dyn ParticipantDirectory> = postgres;
                (repository, directory)
            }
            StorageBackend::Memory => {
                let directory = match &settings.storage.seed_file {
                    Some(path) => InMemoryDirectory::from_seed_file(path).map_err(|e| {
                        error!("Failed to load seed file {}: {}", path, e);
                        io_error("seed file error", e)
                    })?,
                    None => InMemoryDirectory::new(),
                };
                warn!("Using in-memory storage; state is lost on restart");
                let repository: Arc<dyn MatchingRepository> = Arc::new(InMemoryMatchingStore::new());
                let directory: Arc<dyn ParticipantDirectory> = Arc::new(directory);
                (repository, directory)
            }
        };

    // Preview store: Redis-backed when configured, in-process otherwise
    let cache = match &settings.cache.redis_url {
        Some(url) => match CacheManager::new(url, settings.cache.l1_cache_size, settings.cache.ttl_secs).await {
            Ok(c) => {
                info!(
                    "Cache manager initialized (L1: {} entries, TTL: {}s)",
                    settings.cache.l1_cache_size, settings.cache.ttl_secs
                );
                c
            }
            Err(e) => {
                warn!("Failed to connect to Redis ({}), previews stay local to this instance", e);
                CacheManager::in_memory(settings.cache.l1_cache_size, settings.cache.ttl_secs)
            }
        },
        None => CacheManager::in_memory(settings.cache.l1_cache_size, settings.cache.ttl_secs),
    };

    let provisioner: Arc<dyn ChatProvisioner> = match &settings.provisioner.endpoint {
        Some(endpoint) => Arc::new(
            HttpChatProvisioner::new(
                endpoint.clone(),
                settings.provisioner.api_key.clone(),
                settings.provisioner.request_timeout(),
            )
            .map_err(|e| io_error("chat provisioner error", e))?,
        ),
        None => {
            info!("No chat endpoint configured, provisioning will only be logged");
            Arc::new(LoggingProvisioner)
        }
    };

    let policy = settings
        .matching
        .policy()
        .map_err(|e| io_error("matching policy error", e))?;
    let scorer = CompatibilityScorer::new(settings.scoring.weights());

    info!("Matching policy: {:?}, weights: {:?}", policy, scorer.weights());

    let ctx = EngineContext {
        repository: Arc::clone(&repository),
        resolver: EligibilityResolver::new(directory, Arc::clone(&repository), scorer.dimensions()),
        policy,
        provisioning: ProvisioningDispatcher::new(provisioner, settings.provisioner.retry_policy()),
        operation_timeout: settings.matching.operation_timeout(),
    };

    let app_state = AppState {
        coordinator: Arc::new(MatchingCoordinator::new(ctx.clone(), scorer, Arc::new(cache))),
        overrides: Arc::new(ManualOverrideService::new(ctx)),
        repository,
    };

    // Configure HTTP server
    let host = settings.server.host.clone();
    let port = settings.server.port;
    let workers = settings.server.workers.unwrap_or(4);

    info!("Starting HTTP server on {}:{}", host, port);

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .app_data(web::PathConfig::default().error_handler(handle_path_error))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes::configure_routes)
    })
    .workers(workers)
    .bind((host, port))?
    .run()
    .await
}
