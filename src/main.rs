use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use channel_gateway::config::Config;
use channel_gateway::fd::FdAllocator;
use channel_gateway::http_gateway::http_gateway;
use channel_gateway::profile::{shared, Profile, StaticProfileLoader};
use channel_gateway::router::{GatewayRouter, Scope};
use channel_gateway::state::AppState;
use channel_gateway::tables::SharedTables;
use channel_gateway::task_pool::TaskPool;
use channel_gateway::websocket::{websocket_handler, ConnectionManager};
use channel_gateway::{cache_bridge, handlers};

/// Middleware that restricts access to the metrics endpoint to loopback
/// connections only.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /health` — reports Shared Table occupancy, a cheap operational
/// signal that falls directly out of the tables' fixed capacities.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "channel-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "tables": state.tables.occupancy(),
        "connections": state.connections.connection_count(),
        "tasks_in_flight": state.task_pool.in_flight_count(),
    }))
}

/// Reload the mutable slice of config on `SIGHUP`/`SIGUSR1`, without
/// dropping the listening socket or the Shared Tables. There are no worker
/// processes to recycle here — only the tunables that can change without a
/// schema-affecting restart are re-read.
fn spawn_reload_listener(config: Arc<RwLock<Config>>) {
    tokio::spawn(async move {
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = ?e, "failed to install SIGHUP handler; config reload via signal disabled");
                return;
            }
        };
        let mut sigusr1 = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = ?e, "failed to install SIGUSR1 handler; config reload via signal disabled");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = sighup.recv() => {}
                _ = sigusr1.recv() => {}
            }
            match Config::from_env() {
                Ok(fresh) => {
                    *config.write().await = fresh;
                    info!("configuration reloaded; listening socket and shared tables untouched");
                }
                Err(e) => tracing::error!(error = %e, "config reload failed; keeping previous configuration"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining in-flight work");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("failed to load configuration");

    // RUST_LOG still wins when set; LOG_LEVEL only supplies the default
    // filter directive, scoped the way the hardcoded fallback used to be.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.filter_directive().parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("channel gateway starting");
    info!(port = config.port, "configuration loaded");

    let cors = if config.is_dev {
        info!("CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        let methods: Vec<Method> = config
            .cors_allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        let headers: Vec<header::HeaderName> = config
            .cors_allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!("CORS: no CORS_ALLOWED_ORIGINS configured — all cross-origin requests will be denied");
        }
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(headers)
    };

    let addr = config.server_addr();
    let system_key = config.system_key.clone();
    let task_worker_num = config.task_worker_num;

    let tables = SharedTables::new();
    let connections = ConnectionManager::new();
    let task_pool = Arc::new(TaskPool::new(task_worker_num));
    task_pool.set_delivery(Arc::new({
        let connections = connections.clone();
        move |completion| connections.deliver_task_completion(completion)
    }));

    // A single demonstration profile so `whoami`/`echo`/the end-to-end test
    // scenarios have something real to authenticate as; production swaps
    // `StaticProfileLoader` for a database-backed `ProfileLoader` behind the
    // same trait without touching the pipeline.
    let mut demo_perms = HashMap::new();
    demo_perms.insert("*".to_string(), Scope::Private);
    let profiles = shared(StaticProfileLoader::new().with_profile(
        1,
        Profile {
            profile_id: 42,
            default_scope_entity_id: 7,
            accessible_scopes: [7].into_iter().collect(),
            permissions: demo_perms,
        },
    ));

    let mut gateway_router = GatewayRouter::new(system_key);

    let config_lock = Arc::new(RwLock::new(config.clone()));
    let state = AppState {
        config: config_lock.clone(),
        tables: tables.clone(),
        router: Arc::new(GatewayRouter::new(None)), // replaced below once routes are registered
        profiles,
        connections: connections.clone(),
        task_pool: task_pool.clone(),
        fds: Arc::new(FdAllocator::new()),
    };

    handlers::register(&mut gateway_router, &state);
    cache_bridge::register(&mut gateway_router, tables.clone());
    let route_count = gateway_router.route_count();
    let state = AppState {
        router: Arc::new(gateway_router),
        ..state
    };
    info!(routes = route_count, "router ready");

    spawn_reload_listener(config_lock);

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("invalid governor configuration"),
    );

    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() })
                .route_layer(middleware::from_fn(require_loopback)),
        )
        .route("/ws", get(websocket_handler))
        .route("/api/*rest", any(http_gateway))
        .layer(GovernorLayer { config: governor_conf })
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(state);

    info!(%addr, "channel gateway listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed to start");
}
