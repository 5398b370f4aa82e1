use crate::config::Config;
use crate::errors::ServiceError;
use axum::Router;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// The HTTP-hosting sibling of `Service`: instead of binding a `Handler` to
/// a broker, binds an `axum::Router` to a TCP listener derived from
/// `<api>_listen`/`<api>_listen_port`. Mirrors the source's `_run_wsgi`,
/// which reads the same two settings per named api and returns nothing if
/// the api has no routes configured.
pub struct WsgiService {
    api: String,
    addr: SocketAddr,
    router: Option<Router>,
    handle: Option<JoinHandle<()>>,
}

impl WsgiService {
    /// Resolves `<api>_listen:<api>_listen_port` from `config` and pairs it
    /// with `router`. Returns `None` when `router` is `None` — the
    /// equivalent of the source deciding there's nothing to serve for this
    /// api and skipping it entirely rather than binding an empty app.
    pub fn create(api: impl Into<String>, router: Option<Router>, config: &Config, default_port: u16) -> Result<Option<Self>, ServiceError> {
        let Some(router) = router else {
            return Ok(None);
        };
        let api = api.into();
        let host = config.api_listen(&api);
        let port = config
            .api_listen_port(&api, default_port)
            .map_err(|e| ServiceError::Config(e.to_string()))?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| ServiceError::Config(format!("invalid listen address for api '{}': {}", api, e)))?;

        let layered = router.layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(Any)),
        );

        Ok(Some(Self {
            api,
            addr,
            router: Some(layered),
            handle: None,
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Binds the listener and starts serving in a background task.
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        let router = self.router.take().expect("WsgiService::start called twice");
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServiceError::WsgiBind(self.api.clone(), e))?;
        log::info!("rpc-core: wsgi api '{}' listening on {}", self.api, self.addr);

        let api = self.api.clone();
        self.handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                log::error!("rpc-core: wsgi api '{}' server task ended: {}", api, e);
            }
        }));
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::warn!("rpc-core: wsgi api '{}' task panicked: {}", self.api, e);
                }
            }
        }
    }
}

/// One api's router plus the port to fall back to when the deploy config
/// doesn't override it, paired up by the caller before handing the set to
/// `start_many`.
pub struct AppSpec {
    pub name: String,
    pub router: Router,
    pub default_port: u16,
}

/// Reads the deploy config file and returns the set of apis it configures —
/// mirrors `wsgi.load_paste_configuration` returning `None` for an api with
/// no matching section, which `_run_wsgi` uses to decide which apis to skip.
/// Each top-level table in the file names one app; an app's own settings
/// (beyond the listen address/port, which stay in the environment-backed
/// `Config`) are not modeled here.
pub fn configured_apps(deploy_config: &Path) -> Result<HashSet<String>, ServiceError> {
    let raw = std::fs::read_to_string(deploy_config).map_err(|e| {
        ServiceError::Config(format!(
            "failed to read deploy config '{}': {}",
            deploy_config.display(),
            e
        ))
    })?;
    let table: toml::Table = toml::from_str(&raw).map_err(|e| {
        ServiceError::Config(format!(
            "failed to parse deploy config '{}': {}",
            deploy_config.display(),
            e
        ))
    })?;
    Ok(table.keys().cloned().collect())
}

/// Loads every api named in `config.api_paste_config` and starts a
/// `WsgiService` for each `AppSpec` that appears in it, skipping the rest.
/// Mirrors `_run_wsgi(paste_config_file, apis)`: an api absent from the
/// deploy config is logged at debug and quietly skipped, not an error, and
/// an empty result (no configured app matched any `AppSpec`) is logged at
/// error but still returned as `Ok(vec![])` — there's simply nothing to
/// serve.
pub async fn start_many(config: &Config, apps: Vec<AppSpec>) -> Result<Vec<WsgiService>, ServiceError> {
    let deploy_config = Path::new(&config.api_paste_config);
    log::debug!(
        "rpc-core: using deploy config at '{}'",
        deploy_config.display()
    );
    let configured = configured_apps(deploy_config)?;

    let mut started = Vec::new();
    for app in apps {
        if !configured.contains(&app.name) {
            log::debug!("rpc-core: no deploy config section for app '{}'", app.name);
            continue;
        }
        log::info!("rpc-core: running '{}' api", app.name);
        let Some(mut service) = WsgiService::create(app.name.clone(), Some(app.router), config, app.default_port)? else {
            continue;
        };
        service.start().await?;
        started.push(service);
    }

    if started.is_empty() {
        log::error!(
            "rpc-core: no known api applications configured in '{}'",
            deploy_config.display()
        );
    }
    Ok(started)
}
