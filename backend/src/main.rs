use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod automation;
mod config;
mod database;
mod error;
mod handlers;
mod services;

use automation::{
    AuditLedger, Clock, DeliveryGateway, LogGateway, PgAuditLedger, PgRecordStore, RecordStore,
    Scheduler, SystemClock, WorkflowExecutor, WorkflowRegistry,
};
use services::EmailService;


pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub scheduler: Arc<Scheduler>,
    pub ledger: Arc<dyn AuditLedger>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;

    // Registry problems halt startup before anything touches the database.
    let registry = match &config.automation.workflows_file {
        Some(path) => {
            info!("Loading workflow registry from {}", path.display());
            WorkflowRegistry::from_file(path)?
        }
        None => WorkflowRegistry::builtin()?,
    };
    info!("Workflow registry loaded: {} workflows", registry.len());

    let db_pool = database::create_pool(&config.database_url).await?;
    database::migrate(&db_pool).await?;

    let gateway: Arc<dyn DeliveryGateway> = if config.smtp.is_configured() {
        Arc::new(EmailService::new(&config.smtp)?)
    } else {
        warn!("SMTP is not configured, notifications will be written to the log only");
        Arc::new(LogGateway)
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger: Arc<dyn AuditLedger> = Arc::new(PgAuditLedger::new(db_pool.clone()));
    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(db_pool.clone()));

    let executor = Arc::new(WorkflowExecutor::new(
        store,
        ledger.clone(),
        gateway,
        registry.templates(),
        clock.clone(),
        config.automation.execution_settings(),
    ));

    let mut scheduler = Scheduler::new(executor, clock, config.automation.scheduler_config());
    scheduler.register_all(&registry)?;
    let scheduler = Arc::new(scheduler);

    // Bind first: a bad address must fail startup before any workflow fires.
    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    info!("Status surface running on {}", config.server_addr);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let app = handlers::app_router(Arc::new(AppState {
        db_pool,
        scheduler: scheduler.clone(),
        ledger,
    }));

    serve_until_shutdown(listener, app, scheduler, shutdown).await
}

/// Run the scheduler and the status surface until `shutdown` fires or the
/// server fails. In-flight executions drain before this returns either way.
async fn serve_until_shutdown(
    listener: tokio::net::TcpListener,
    app: Router,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let scheduler_task = {
        let cancel = shutdown.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let server_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;
    if let Err(e) = &served {
        error!("Status surface failed: {}", e);
    }

    shutdown.cancel();
    scheduler_task.await?;
    info!("Automation engine stopped");

    served?;
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining automation workflows");
    token.cancel();
}
