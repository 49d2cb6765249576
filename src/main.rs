use crawl_session::backoff::ReconnectBackoff;
use crawl_session::cli::{Cli, Commands};
use crawl_session::config::Config;
use crawl_session::logging::init_logging;
use crawl_session::{
    classify_workers, Session, SessionError, SessionLookup, SessionManager, SessionStatus,
    SubscribeTarget,
};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MainError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {id} has stale metadata (version {version:?}), migrate it before use")]
    Stale { id: String, version: Option<u32> },

    #[error("Redis is not reachable at {0}")]
    Unreachable(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Resolve an id to a usable session, reporting stale metadata separately from absence.
async fn resolve(manager: &SessionManager, id: &str) -> Result<Session, MainError> {
    match manager.lookup(id).await? {
        SessionLookup::Valid(session) => Ok(session),
        SessionLookup::Stale { version, .. } => Err(MainError::Stale {
            id: id.to_string(),
            version,
        }),
        SessionLookup::NotFound => Err(MainError::NotFound(id.to_string())),
    }
}

async fn run_show_command(manager: &SessionManager, id: &str) -> Result<(), MainError> {
    let session = resolve(manager, id).await?;
    let meta = session.get_meta().await?;
    let url_entries = session.url_count().await?;

    println!("{}", serde_json::to_string_pretty(&meta)?);
    if url_entries != meta.total_tasks {
        eprintln!(
            "Warning: {} url entries but total_tasks is {}",
            url_entries, meta.total_tasks
        );
    }
    Ok(())
}

async fn run_workers_command(
    manager: &SessionManager,
    id: &str,
    stale_after: u64,
) -> Result<(), MainError> {
    let session = resolve(manager, id).await?;
    let heartbeats = session.get_heartbeats().await?;
    let now = chrono::Utc::now().timestamp();

    if heartbeats.is_empty() {
        println!("No heartbeats recorded for {}", id);
        return Ok(());
    }

    for worker in classify_workers(&heartbeats, now, Duration::from_secs(stale_after)) {
        let age = worker
            .age_secs
            .map(|a| format!("{}s ago", a))
            .unwrap_or_else(|| "never".to_string());
        let marker = if worker.stale { "STALE" } else { "ok" };
        println!("{:<40} {:>12} {}", worker.worker_id, age, marker);
    }
    Ok(())
}

/// Stream events until Ctrl+C, resubscribing with backoff when the subscription drops.
async fn run_watch_command(manager: &SessionManager, id: Option<String>) -> Result<(), MainError> {
    let target = match id {
        Some(id) => SubscribeTarget::Session(id),
        None => SubscribeTarget::All,
    };
    let mut backoff =
        ReconnectBackoff::new(Config::WATCH_BACKOFF_BASE_MS, Config::WATCH_BACKOFF_MAX_MS);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let mut subscription = match manager.subscribe(target.clone()).await {
            Ok(subscription) => {
                backoff.reset();
                subscription
            }
            Err(e) if e.is_connectivity() => {
                let delay = backoff.next_delay();
                tracing::warn!("Subscribe failed ({}), retrying in {:?}", e, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = &mut ctrl_c => return Ok(()),
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(?target, "Watching stats events, Ctrl+C to exit");

        loop {
            tokio::select! {
                event = subscription.next_event() => match event {
                    Some(event) => println!("{} {}", event.session_id, event.kind),
                    None => {
                        tracing::warn!("Stats subscription dropped");
                        break;
                    }
                },
                _ = &mut ctrl_c => return Ok(()),
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = &mut ctrl_c => return Ok(()),
        }
    }
}

async fn run_command(manager: &SessionManager, cli: Cli) -> Result<(), MainError> {
    match cli.command {
        Commands::Create { hint_id, url } => {
            let session = manager.create(&hint_id, &url).await?;
            println!("{}", session.id());
        }

        Commands::Show { id } => run_show_command(manager, &id).await?,

        Commands::List { limit } => {
            for id in manager.get_ids(limit).await? {
                println!("{}", id);
            }
        }

        Commands::Stop { id } => {
            resolve(manager, &id).await?.set_status(SessionStatus::Stopped).await?;
            println!("Stopped {}", id);
        }

        Commands::Resume { id } => {
            resolve(manager, &id).await?.set_status(SessionStatus::Normal).await?;
            println!("Resumed {}", id);
        }

        Commands::Remove { id } => {
            if !manager.has(&id).await? {
                return Err(MainError::NotFound(id));
            }
            manager.remove(&id).await?;
            println!("Removed {}", id);
        }

        Commands::Workers { id, stale_after } => {
            run_workers_command(manager, &id, stale_after).await?
        }

        Commands::Watch { id } => run_watch_command(manager, id).await?,

        Commands::Ping => {
            if !manager.is_ready().await {
                return Err(MainError::Unreachable(cli.redis_url));
            }
            println!("PONG");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let cli = Cli::parse_args();

    let _log_guard = init_logging(cli.log_dir.as_deref().map(Path::new))
        .map_err(|e| MainError::Logging(e.to_string()))?;

    let manager = SessionManager::connect(&cli.redis_url).await?;
    let result = run_command(&manager, cli).await;
    manager.stop();

    result
}
