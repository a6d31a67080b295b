mod auth;
mod config;
mod constants;
mod db;
mod error;
mod mint;
mod model;
mod proxy_client;
mod routes;
mod session;
mod spawn_controller;
mod spawner;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use auth::{Authenticator, PamAuthenticator};
use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use clap::Parser;
use config::{Config, CorsMode};
use model::NewServer;
use proxy_client::ProxyClient;
use reqwest::Client;
use routes::dispatcher::AppState;
use session::SessionManager;
use spawn_controller::SpawnController;
use spawner::SpawnerConfig;
use store::Store;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

#[derive(Parser)]
#[command(name = "spawnhub")]
#[command(about = "Multi-user authentication and spawn-lifecycle hub")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "HUB_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "HUB_PORT")]
    port: Option<u16>,

    /// argv template for the single-user server, e.g. "notebook --port {port}"
    #[arg(long, env = "HUB_SPAWN_CMD", value_delimiter = ' ')]
    spawn_cmd: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    let database = db::open(&config.db_path)
        .await
        .expect("failed to initialize database");
    let store = Store::new(Arc::new(database));

    let hub_server_defaults = NewServer {
        ip: host.clone(),
        port,
        proto: "http".to_string(),
        base_url: config.base_url.clone(),
        cookie_name: config.cookie_name.clone(),
        ..NewServer::default()
    };

    let hub = match store.get_hub().await.expect("failed to load hub row") {
        Some(hub) => hub,
        None => store
            .put_hub(&hub_server_defaults)
            .await
            .map(|server| model::Hub { server })
            .expect("failed to persist hub row"),
    };

    if store.get_proxy().await.expect("failed to load proxy row").is_none() {
        let public_url = url::Url::parse(&config.proxy_public_url).expect("invalid PROXY_PUBLIC_URL");
        let public = NewServer {
            ip: public_url.host_str().unwrap_or("localhost").to_string(),
            port: public_url.port_or_known_default().unwrap_or(80),
            base_url: "/".to_string(),
            ..NewServer::default()
        };
        let api = NewServer {
            base_url: "/api".to_string(),
            ..NewServer::default()
        };
        store
            .put_proxy(&public, &api, &config.proxy_auth_token)
            .await
            .expect("failed to persist proxy row");
    }

    let http_client = Client::builder()
        .timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .build()
        .expect("failed to build HTTP client");

    let proxy_client = ProxyClient::new(http_client, config.proxy_api_url.clone(), config.proxy_auth_token.clone());

    let spawner_config = SpawnerConfig {
        cmd: args.spawn_cmd,
        env: std::collections::HashMap::new(),
        ip: "127.0.0.1".to_string(),
        port: None,
        spawn_timeout: config.spawn_timeout,
    };

    let controller = Arc::new(SpawnController::new(store.clone(), proxy_client, spawner_config));
    let session = SessionManager::new(store.clone(), config.cookie_name.clone(), config.base_url.clone());
    let authenticator: Arc<dyn Authenticator> = Arc::new(PamAuthenticator::new(config.pam_service.clone()));

    let state = AppState {
        store,
        session,
        controller,
        authenticator,
        hub_base_url: config.base_url.clone(),
    };

    let cors_mode = config.cors_mode.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };
            match &cors_mode {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: localhost only"),
        CorsMode::AllowList(list) => info!("CORS: allowing origins: {list:?}"),
    }

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .route("/login", post(routes::dispatcher::login))
            .route("/user/{name}", get(routes::dispatcher::user_route))
            .route(
                "/api/authorizations/{token}",
                get(routes::dispatcher::authorize_cookie),
            )
            .fallback(routes::dispatcher::fallback)
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{host}:{port}").parse().expect("invalid address");
    info!("Starting spawnhub v{VERSION}-{GIT_HASH} (built {BUILD_TIME})");
    info!("Hub listening on http://{addr}, base_url={}", hub.server.base_url);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        axum::ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .await
    .unwrap();
}
