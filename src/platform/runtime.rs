//! Platform boot and shutdown harness, grounded on the teacher's
//! `Platform`/`PlatformRuntime`/`ServiceRegistration` shape: every background
//! concern (scheduler tick loop, housekeeping sweep, agent session server,
//! telemetry) is a `ServiceRegistration` spawned under one root
//! `CancellationToken`, so shutdown drains each the same way.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as AxumPath, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::CoreError;
use crate::events::EventLog;
use crate::filesync::DataDir;
use crate::persistence::{PgStore, Store};
use crate::platform::config::AppConfig;
use crate::platform::context::PlatformContext;
use crate::platform::service::ServiceRegistration;
use crate::platform::telemetry::telemetry_service;
use crate::scheduler::JobScheduler;
use crate::session::{self, SessionRegistry};
use crate::types::AgentId;

/// An unstarted platform: the configuration plus any extra
/// `ServiceRegistration`s the caller wants spawned alongside the built-in
/// ones (telemetry, scheduler tick, housekeeping, agent session server).
pub struct Platform {
    config: AppConfig,
    extra_services: Vec<ServiceRegistration>,
}

impl Platform {
    pub fn new(config: AppConfig) -> Self {
        Self { config, extra_services: Vec::new() }
    }

    pub fn register_service(&mut self, service: ServiceRegistration) {
        self.extra_services.push(service);
    }

    /// Connects to storage, builds the scheduler and session registry, and
    /// spawns every service. Returns a handle that drains all of them on
    /// `shutdown`.
    pub async fn start(self) -> Result<PlatformRuntime> {
        initialize_logging(&self.config);

        let pool = PgPoolOptions::new()
            .max_connections(self.config.database.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(self.config.database.connect_timeout_seconds))
            .connect(&self.config.database.url)
            .await?;
        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

        let sessions = Arc::new(SessionRegistry::new());
        let events = Arc::new(EventLog::default());
        let data_dir = DataDir::new(self.config.data_dir.root.clone());
        let scheduler_settings = self.config.scheduler_settings();
        let scheduler = Arc::new(JobScheduler::new(
            store.clone(),
            sessions.clone(),
            events.clone(),
            data_dir.clone(),
            scheduler_settings,
        ));

        let root_token = CancellationToken::new();
        let context = PlatformContext::new(
            self.config.clone(),
            store,
            sessions,
            events,
            data_dir,
            scheduler.clone(),
            root_token.child_token(),
        );

        let mut services = vec![
            telemetry_service(self.config.observability.clone()),
            scheduler_tick_service(),
            housekeeping_service(),
            agent_server_service(),
        ];
        services.extend(self.extra_services);

        let mut tasks = Vec::new();
        for service in services {
            let handle = service.spawn(context.clone(), root_token.child_token());
            tasks.push((service.name().to_string(), handle));
        }

        info!("krakenhashes core boot completed");

        Ok(PlatformRuntime { context, cancel_token: root_token, tasks })
    }
}

pub struct PlatformRuntime {
    context: PlatformContext,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl PlatformRuntime {
    pub fn context(&self) -> PlatformContext {
        self.context.clone()
    }

    /// Cancels the shared token and drains every spawned service in order,
    /// matching spec.md §5's shutdown contract: "shutting down the scheduler
    /// drains the tick, then exits".
    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(service = %name, "service shutdown cleanly"),
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

fn initialize_logging(config: &AppConfig) {
    let _ = tracing_subscriber::fmt().with_env_filter(config.observability.log_level.as_str()).try_init();
}

/// Wraps `JobScheduler::run_tick_loop` as a `ServiceRegistration` so it
/// shuts down through the same path as every other background task.
fn scheduler_tick_service() -> ServiceRegistration {
    ServiceRegistration::new(
        "scheduler-tick",
        Arc::new(|ctx: PlatformContext, token: CancellationToken| {
            tokio::spawn(async move {
                ctx.scheduler().run_tick_loop(token).await;
                Ok(())
            })
        }),
    )
}

/// Wraps `JobScheduler::run_housekeeping_loop` (spec.md §4.6 step 3,
/// §4.7 stale recovery).
fn housekeeping_service() -> ServiceRegistration {
    ServiceRegistration::new(
        "housekeeping",
        Arc::new(|ctx: PlatformContext, token: CancellationToken| {
            tokio::spawn(async move {
                ctx.scheduler().run_housekeeping_loop(token).await;
                Ok(())
            })
        }),
    )
}

#[derive(Debug, Deserialize)]
struct AgentWsQuery {
    agent_id: AgentId,
}

/// The agent WebSocket endpoint plus the read-only status surface (spec.md
/// §6 "Exposed" contracts: job status, agent status, queue status), bound on
/// `server.bind_host:bind_port`. Authentication is out of scope (spec.md
/// §1); the agent is assumed already registered via the (external) voucher
/// redemption flow and simply presents its assigned id.
fn agent_server_service() -> ServiceRegistration {
    ServiceRegistration::new(
        "agent-server",
        Arc::new(move |ctx: PlatformContext, token: CancellationToken| {
            tokio::spawn(async move {
                let addr: SocketAddr = format!("{}:{}", ctx.config().server.bind_host, ctx.config().server.bind_port).parse()?;
                let app = Router::new()
                    .route("/ws/agent", get(agent_ws_handler))
                    .route("/status/jobs", get(list_jobs))
                    .route("/status/jobs/:id", get(get_job))
                    .route("/status/agents", get(list_agents))
                    .route("/status/agents/:id", get(get_agent))
                    .route("/status/queue", get(queue_status))
                    .with_state(ctx);

                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!(%addr, "agent server listening");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        token.cancelled().await;
                        info!("shutting down agent server");
                    })
                    .await?;
                Ok(())
            })
        }),
    )
}

async fn agent_ws_handler(
    State(ctx): State<PlatformContext>,
    Query(query): Query<AgentWsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let agent_id = query.agent_id;
        let store = ctx.store();
        let sessions = ctx.sessions();
        let events = ctx.events();
        let data_dir = ctx.data_dir().clone();
        let lifecycle_settings = ctx.config().scheduler_settings().lifecycle_settings();

        session::drive_session(socket, agent_id, sessions.clone(), move |message| {
            let store = store.clone();
            let events = events.clone();
            let sessions = sessions.clone();
            let data_dir = data_dir.clone();
            async move {
                session::handle_message(store.as_ref(), events.as_ref(), sessions.as_ref(), &data_dir, lifecycle_settings, agent_id, message)
                    .await;
            }
        })
        .await;

        // The session just closed: spec.md §4.2's disconnect path. Mark the
        // agent inactive and demote its non-terminal tasks to
        // `reconnect_pending` rather than resetting them immediately
        // (spec.md §4.7 Scenario D).
        let _ = store.update_agent_status(agent_id, crate::types::AgentStatus::Inactive).await;
        let _ = crate::lifecycle::demote_agent_tasks_to_reconnect_pending(store.as_ref(), agent_id).await;
    })
}

async fn list_jobs(State(ctx): State<PlatformContext>) -> Result<Json<Vec<crate::types::JobExecution>>, ApiError> {
    let jobs = ctx.store().next_jobs_with_available_work(ctx.config().scheduler.max_job_priority).await?;
    Ok(Json(jobs))
}

async fn get_job(State(ctx): State<PlatformContext>, AxumPath(id): AxumPath<Uuid>) -> Result<Json<JobDetail>, ApiError> {
    let job = ctx.store().get_job(id).await?;
    let tasks = ctx.store().tasks_by_job(id).await?;
    Ok(Json(JobDetail { job, tasks }))
}

#[derive(serde::Serialize)]
struct JobDetail {
    job: crate::types::JobExecution,
    tasks: Vec<crate::types::JobTask>,
}

async fn list_agents(State(ctx): State<PlatformContext>) -> Result<Json<Vec<crate::types::Agent>>, ApiError> {
    Ok(Json(ctx.store().all_agents().await?))
}

async fn get_agent(State(ctx): State<PlatformContext>, AxumPath(id): AxumPath<AgentId>) -> Result<Json<AgentDetail>, ApiError> {
    let agent = ctx.store().get_agent(id).await?;
    let devices = ctx.store().list_devices(id).await?;
    Ok(Json(AgentDetail { agent, devices }))
}

#[derive(serde::Serialize)]
struct AgentDetail {
    agent: crate::types::Agent,
    devices: Vec<crate::types::Device>,
}

#[derive(serde::Serialize)]
struct QueueStatus {
    queued_jobs: usize,
    idle_agents: usize,
}

async fn queue_status(State(ctx): State<PlatformContext>) -> Result<Json<QueueStatus>, ApiError> {
    let queued = ctx.store().next_jobs_with_available_work(ctx.config().scheduler.max_job_priority).await?;
    let idle = ctx.store().agents_idle().await?;
    Ok(Json(QueueStatus { queued_jobs: queued.len(), idle_agents: idle.len() }))
}

/// Thin wrapper so handler bodies can use `?` against `CoreError` while
/// returning a proper HTTP response; the read-only status surface is a
/// convenience contract, not the authenticated admin API (spec.md §1).
struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let status = match &self.0 {
            CoreError::JobNotFound(_) | CoreError::TaskNotFound(_) | CoreError::AgentNotFound(_) | CoreError::HashlistNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}
