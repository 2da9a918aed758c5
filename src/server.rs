use crate::clock::{system_clock, SharedClock};
use crate::config::Config;
use crate::database::ConnectionGovernor;
use crate::error::{Error, Result};
use crate::governance::RequestGovernor;
use crate::handlers::{
    create_user, delete_user, get_user, health_check, index, list_users, login, metrics,
    not_found, search_users, update_user, AppState,
};
use crate::health::{database_probe, memory_probe, HealthRunner};
use crate::middleware::{
    admission_middleware, client_identity_middleware, logging_middleware, metrics_middleware,
    Admission, ClientIdentity,
};
use crate::rate_limit_config::policy;
use crate::users::UserStore;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue};
use axum::routing::{delete, get, post, put, MethodRouter};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    governor: Arc<RequestGovernor>,
    cleanup_interval: Duration,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let state = build_state(&config, system_clock()).await?;
        let governor = state.governor.clone();
        let app = create_app(state, &config)?;

        Ok(Self {
            app,
            bind_addr: config.bind_addr,
            governor,
            cleanup_interval: config.cleanup_interval(),
        })
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let sweeper = spawn_sweeper(self.governor.clone(), self.cleanup_interval);

        info!("warden listening on {}", self.bind_addr);
        info!("Health check available at /health");
        info!("Metrics available at /metrics");

        // Run server with graceful shutdown
        let served = axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        sweeper.abort();
        served?;
        Ok(())
    }
}

/// Wire every component. Nothing outlives the returned state.
pub async fn build_state(config: &Config, clock: SharedClock) -> Result<AppState> {
    let database = ConnectionGovernor::new(config.database());

    let users = UserStore::new(database.clone());
    users.init().await?;

    let mut health = HealthRunner::new(clock.clone());
    health.register_probe("database", database_probe(database.clone()));
    health.register_probe("memory", memory_probe(config.memory_threshold));

    let governor = RequestGovernor::new(config.governance(), health, database, clock);

    Ok(AppState {
        governor: Arc::new(governor),
        users,
        health_timeout: config.health_timeout(),
    })
}

pub fn create_app(state: AppState, config: &Config) -> Result<Router> {
    let governed = |route: MethodRouter<AppState>, policy: &'static str| {
        route.route_layer(middleware::from_fn_with_state(
            Admission::new(state.governor.clone(), policy),
            admission_middleware,
        ))
    };

    let identity = ClientIdentity {
        trust_proxy_headers: config.trust_proxy_headers,
    };

    let app = Router::new()
        .route("/", governed(get(index), policy::INDEX))
        .route("/health", governed(get(health_check), policy::HEALTH))
        .route("/metrics", governed(get(metrics), policy::METRICS))
        .route("/users", governed(get(list_users), policy::LIST_USERS))
        .route("/users", governed(post(create_user), policy::CREATE_USER))
        .route("/user/:id", governed(get(get_user), policy::GET_USER))
        .route("/user/:id", governed(put(update_user), policy::UPDATE_USER))
        .route("/user/:id", governed(delete(delete_user), policy::DELETE_USER))
        .route("/search", governed(get(search_users), policy::SEARCH))
        .route("/login", governed(post(login), policy::LOGIN))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.governor.clone(),
            metrics_middleware,
        ))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(config)?)
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::X_XSS_PROTECTION,
                    HeaderValue::from_static("1; mode=block"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::STRICT_TRANSPORT_SECURITY,
                    HeaderValue::from_static("max-age=31536000; includeSubDomains"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::CONTENT_SECURITY_POLICY,
                    HeaderValue::from_static("default-src 'self'"),
                ))
                .layer(middleware::from_fn_with_state(
                    identity,
                    client_identity_middleware,
                ))
                .layer(middleware::from_fn(logging_middleware))
                .layer(RequestBodyLimitLayer::new(config.max_body_bytes)),
        );

    Ok(app)
}

fn cors_layer(config: &Config) -> Result<CorsLayer> {
    let Some(origins) = config.allowed_origins() else {
        return Ok(CorsLayer::permissive());
    };

    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|_| Error::Configuration(format!("invalid CORS origin '{}'", origin)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any))
}

/// Periodically drop idle clients and expired blocks
pub fn spawn_sweeper(governor: Arc<RequestGovernor>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stats = governor.sweep();
            debug!(
                rate_limit_keys = stats.rate_limit_keys,
                lockout_entries = stats.lockout_entries,
                "Swept idle governance state"
            );
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
