use std::convert::Infallible;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use warp::filters::BoxedFilter;
use warp::reply::Reply;
use warp::Filter;

use crate::errors::ApiError;
use crate::handlers;
use crate::matchmaker::Matchmaker;
use crate::metrics::MetricsCollector;
use crate::registry::GameRegistry;
use crate::settings::{ServerSettings, SettingsError, StorageBackendKind};
use crate::store::{GameStore, MemoryBackend, SledBackend, StorageBackend};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    host: String,
    port: u16,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn for_tests() -> Self {
        Self::new("127.0.0.1", 0)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Shared server state handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    settings: Arc<ServerSettings>,
    store: Arc<GameStore>,
    matchmaker: Arc<Matchmaker>,
    metrics: MetricsCollector,
}

impl AppContext {
    pub fn new(settings: ServerSettings) -> Result<Self, ServerError> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let backend: Arc<dyn StorageBackend> = match settings.storage_backend {
            StorageBackendKind::Memory => Arc::new(MemoryBackend),
            StorageBackendKind::Durable => {
                let path = settings
                    .storage_path
                    .as_ref()
                    .ok_or_else(|| {
                        ServerError::ConfigError("durable backend requires storage_path".into())
                    })?;
                Arc::new(SledBackend::open(path).map_err(|e| ServerError::Storage(e.to_string()))?)
            }
        };
        let registry = Arc::new(GameRegistry::with_builtin());
        let store = Arc::new(GameStore::new(backend, registry, Arc::clone(&settings)));
        let matchmaker = Arc::new(Matchmaker::new(settings.matchmaking_ttl()));
        Ok(Self { settings, store, matchmaker, metrics: MetricsCollector::new() })
    }

    pub fn new_for_tests() -> Self {
        Self::new(ServerSettings::default()).expect("test context")
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn store(&self) -> Arc<GameStore> {
        Arc::clone(&self.store)
    }

    pub fn matchmaker(&self) -> Arc<Matchmaker> {
        Arc::clone(&self.matchmaker)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// One housekeeping tick: idle sockets, expired pendings, stale
    /// queue entries, idle session eviction.
    pub async fn housekeeping(&self) {
        for session in self.store.cached_sessions() {
            session.sweep().await;
        }
        self.store.evict_idle();
        self.matchmaker.evict_expired();
    }
}

pub struct WebServer {
    config: ServerConfig,
    context: AppContext,
}

impl WebServer {
    pub fn new(config: ServerConfig, settings: ServerSettings) -> Result<Self, ServerError> {
        Ok(Self { config, context: AppContext::new(settings)? })
    }

    pub fn from_context(config: ServerConfig, context: AppContext) -> Self {
        Self { config, context }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let WebServer { config, context } = self;
        let bind_addr = Self::bind_addr(&config)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let routes = Self::routes(&context);
        let shutdown_signal = async move {
            let _ = shutdown_rx.await;
        };

        let (addr, server_future) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(bind_addr, shutdown_signal)
            .map_err(Self::map_warp_error)?;

        tracing::info!(address = %addr, "game server listening");

        let task = tokio::spawn(async move {
            server_future.await;
            Ok(())
        });

        let sweeper_context = context.clone();
        let sweeper = tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tick.tick().await;
                sweeper_context.housekeeping().await;
            }
        });

        Ok(ServerHandle { addr, shutdown: Some(shutdown_tx), task: Some(task), sweeper, context })
    }

    fn bind_addr(config: &ServerConfig) -> Result<SocketAddr, ServerError> {
        let host = config.host();
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(addr);
        }
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, config.port()));
        }
        let candidate = format!("{}:{}", host, config.port());
        let mut addrs = candidate.to_socket_addrs().map_err(|err| {
            ServerError::ConfigError(format!("failed to resolve address `{candidate}`: {err}"))
        })?;
        addrs.next().ok_or_else(|| {
            ServerError::ConfigError(format!("failed to resolve address `{candidate}`"))
        })
    }

    fn map_warp_error(err: warp::Error) -> ServerError {
        use std::error::Error as StdError;
        if let Some(source) = err.source() {
            if let Some(io_err) = source.downcast_ref::<std::io::Error>() {
                let recreated = std::io::Error::new(io_err.kind(), io_err.to_string());
                return ServerError::BindError(recreated);
            }
        }
        ServerError::ConfigError(err.to_string())
    }

    /// The full route tree. Public so tests can drive the HTTP surface
    /// with `warp::test` without binding a socket.
    pub fn routes(context: &AppContext) -> BoxedFilter<(warp::reply::Response,)> {
        Self::health_route(context)
            .or(Self::ws_route(context))
            .unify()
            .or(Self::game_routes(context))
            .unify()
            .or(Self::lobby_routes(context))
            .unify()
            .or(Self::pending_routes(context))
            .unify()
            .or(Self::matchmaking_routes(context))
            .unify()
            .boxed()
    }

    fn with_context(
        context: AppContext,
    ) -> impl Filter<Extract = (AppContext,), Error = Infallible> + Clone {
        warp::any().map(move || context.clone())
    }

    fn health_route(context: &AppContext) -> BoxedFilter<(warp::reply::Response,)> {
        warp::path!("health")
            .and(warp::get())
            .and(Self::with_context(context.clone()))
            .map(|ctx: AppContext| handlers::health::health(&ctx).into_response())
            .boxed()
    }

    /// WebSocket upgrade on `GET /games/{id}`. Must precede the plain
    /// GET state route so upgrade requests land here.
    fn ws_route(context: &AppContext) -> BoxedFilter<(warp::reply::Response,)> {
        warp::path!("games" / String)
            .and(warp::ws())
            .and(warp::query::<handlers::ws::WsQuery>())
            .and(Self::with_context(context.clone()))
            .map(
                |game_id: String,
                 ws: warp::ws::Ws,
                 query: handlers::ws::WsQuery,
                 ctx: AppContext| {
                    ws.on_upgrade(move |socket| {
                        handlers::ws::handle_socket(socket, game_id, query, ctx)
                    })
                    .into_response()
                },
            )
            .boxed()
    }

    fn game_routes(context: &AppContext) -> BoxedFilter<(warp::reply::Response,)> {
        let ctx = Self::with_context(context.clone());

        let create = warp::path!("games")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|ctx, body| async move {
                Ok::<_, Infallible>(handlers::game::create_game(ctx, body).await)
            });

        let list = warp::path!("games")
            .and(warp::get())
            .and(ctx.clone())
            .and_then(|ctx| async move {
                Ok::<_, Infallible>(handlers::game::list_games(ctx).await)
            });

        let state = warp::path!("games" / String)
            .and(warp::get())
            .and(ctx.clone())
            .and(warp::query::<handlers::game::StateQuery>())
            .and_then(|game_id, ctx, query| async move {
                Ok::<_, Infallible>(handlers::game::get_state(ctx, game_id, query).await)
            });

        let action = warp::path!("games" / String / "action")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|game_id, ctx, body| async move {
                Ok::<_, Infallible>(handlers::game::post_action(ctx, game_id, body).await)
            });

        let history = warp::path!("games" / String / "history")
            .and(warp::get())
            .and(ctx.clone())
            .and_then(|game_id, ctx| async move {
                Ok::<_, Infallible>(handlers::game::get_history(ctx, game_id).await)
            });

        let undo = warp::path!("games" / String / "undo")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|game_id, ctx, body| async move {
                Ok::<_, Infallible>(handlers::game::post_undo(ctx, game_id, body).await)
            });

        let restart = warp::path!("games" / String / "restart")
            .and(warp::post())
            .and(ctx.clone())
            .and_then(|game_id, ctx| async move {
                Ok::<_, Infallible>(handlers::game::post_restart(ctx, game_id).await)
            });

        let rewind = warp::path!("games" / String / "rewind")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|game_id, ctx, body| async move {
                Ok::<_, Infallible>(handlers::game::post_rewind(ctx, game_id, body).await)
            });

        let state_at = warp::path!("games" / String / "state-at" / usize)
            .and(warp::get())
            .and(ctx.clone())
            .and(warp::query::<handlers::game::StateQuery>())
            .and_then(|game_id, idx, ctx, query| async move {
                Ok::<_, Infallible>(handlers::game::get_state_at(ctx, game_id, idx, query).await)
            });

        let state_diff = warp::path!("games" / String / "state-diff")
            .and(warp::get())
            .and(ctx)
            .and(warp::query::<handlers::game::DiffQuery>())
            .and_then(|game_id, ctx, query| async move {
                Ok::<_, Infallible>(handlers::game::get_state_diff(ctx, game_id, query).await)
            });

        create
            .or(list)
            .unify()
            .or(action)
            .unify()
            .or(history)
            .unify()
            .or(undo)
            .unify()
            .or(restart)
            .unify()
            .or(rewind)
            .unify()
            .or(state_at)
            .unify()
            .or(state_diff)
            .unify()
            .or(state)
            .unify()
            .boxed()
    }

    fn lobby_routes(context: &AppContext) -> BoxedFilter<(warp::reply::Response,)> {
        let ctx = Self::with_context(context.clone());

        macro_rules! lobby_post {
            ($path:literal, $handler:path) => {
                warp::path!("games" / String / $path)
                    .and(warp::post())
                    .and(ctx.clone())
                    .and(warp::body::json())
                    .and_then(|game_id, ctx, body| async move {
                        Ok::<_, Infallible>($handler(ctx, game_id, body).await)
                    })
            };
        }

        let get_lobby = warp::path!("games" / String / "lobby")
            .and(warp::get())
            .and(ctx.clone())
            .and_then(|game_id, ctx| async move {
                Ok::<_, Infallible>(handlers::lobby::get_lobby(ctx, game_id).await)
            });

        get_lobby
            .or(lobby_post!("claim-position", handlers::lobby::claim_position))
            .unify()
            .or(lobby_post!("leave-position", handlers::lobby::leave_position))
            .unify()
            .or(lobby_post!("set-ready", handlers::lobby::set_ready))
            .unify()
            .or(lobby_post!("update-name", handlers::lobby::update_name))
            .unify()
            .or(lobby_post!("add-slot", handlers::lobby::add_slot))
            .unify()
            .or(lobby_post!("remove-slot", handlers::lobby::remove_slot))
            .unify()
            .or(lobby_post!("set-slot-ai", handlers::lobby::set_slot_ai))
            .unify()
            .or(lobby_post!("kick-player", handlers::lobby::kick_player))
            .unify()
            .or(lobby_post!("player-options", handlers::lobby::player_options))
            .unify()
            .or(lobby_post!("slot-player-options", handlers::lobby::slot_player_options))
            .unify()
            .or(lobby_post!("game-options", handlers::lobby::game_options))
            .unify()
            .or(lobby_post!("start", handlers::lobby::start_game))
            .unify()
            .boxed()
    }

    fn pending_routes(context: &AppContext) -> BoxedFilter<(warp::reply::Response,)> {
        let ctx = Self::with_context(context.clone());

        let start_action = warp::path!("games" / String / "start-action")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|game_id, ctx, body| async move {
                Ok::<_, Infallible>(handlers::pending::start_action(ctx, game_id, body).await)
            });

        let selection_step = warp::path!("games" / String / "selection-step")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|game_id, ctx, body| async move {
                Ok::<_, Infallible>(handlers::pending::selection_step(ctx, game_id, body).await)
            });

        let cancel_action = warp::path!("games" / String / "cancel-action")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|game_id, ctx, body| async move {
                Ok::<_, Infallible>(handlers::pending::cancel_action(ctx, game_id, body).await)
            });

        let get_pending = warp::path!("games" / String / "pending-action")
            .and(warp::get())
            .and(ctx.clone())
            .and(warp::query::<handlers::pending::PendingQuery>())
            .and_then(|game_id, ctx, query| async move {
                Ok::<_, Infallible>(handlers::pending::get_pending(ctx, game_id, query).await)
            });

        let choices = warp::path!("games" / String / "selection-choices")
            .and(warp::get())
            .and(ctx)
            .and(warp::query::<handlers::pending::ChoicesQuery>())
            .and_then(|game_id, ctx, query| async move {
                Ok::<_, Infallible>(
                    handlers::pending::selection_choices(ctx, game_id, query).await,
                )
            });

        start_action
            .or(selection_step)
            .unify()
            .or(cancel_action)
            .unify()
            .or(get_pending)
            .unify()
            .or(choices)
            .unify()
            .boxed()
    }

    fn matchmaking_routes(context: &AppContext) -> BoxedFilter<(warp::reply::Response,)> {
        let ctx = Self::with_context(context.clone());

        let join = warp::path!("matchmaking" / "join")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|ctx, body| async move {
                Ok::<_, Infallible>(handlers::matchmaking::join(ctx, body).await)
            });

        let leave = warp::path!("matchmaking" / "leave")
            .and(warp::post())
            .and(ctx.clone())
            .and(warp::body::json())
            .and_then(|ctx, body| async move {
                Ok::<_, Infallible>(handlers::matchmaking::leave(ctx, body).await)
            });

        let status = warp::path!("matchmaking" / "status")
            .and(warp::get())
            .and(ctx)
            .and(warp::query::<handlers::matchmaking::StatusQuery>())
            .and_then(|ctx, query| async move {
                Ok::<_, Infallible>(handlers::matchmaking::status(ctx, query).await)
            });

        join.or(leave).unify().or(status).unify().boxed()
    }
}

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
    sweeper: JoinHandle<()>,
    context: AppContext,
}

impl ServerHandle {
    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    /// Graceful shutdown: stop accepting, drain in-flight requests,
    /// flush every session's durable state, then return.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.sweeper.abort();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result?,
                Err(err) => {
                    return Err(ServerError::ConfigError(format!(
                        "server task join error: {err}"
                    )))
                }
            }
        }
        self.context
            .store()
            .flush_all()
            .map_err(|err: ApiError| ServerError::Storage(err.message))?;
        tracing::info!("server stopped cleanly");
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.sweeper.abort();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
