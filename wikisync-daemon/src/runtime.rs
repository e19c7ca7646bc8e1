use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use wikisync_core::config::{LogFormat, LoggingConfig};
use wikisync_core::paths::{socket_path, wikisync_root};
use wikisync_core::{Config, Repository, Store};
use wikisync_sync::{
    trigger_manual_update, CommandGenerator, LogNotifier, Notifiers, Orchestrator,
    WebhookNotifier, WorkspaceManager,
};

use crate::error::{io_err, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::Scheduler;

/// Shared by every socket client.
struct ServerState {
    home: PathBuf,
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
}

/// Load config, install tracing and block the current thread until the daemon exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = Config::load_at(home)?;
    init_tracing(&config.logging);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Wire store, workspaces, generator and notifiers into a scheduler and serve
/// until `stop` or ctrl-c.
pub async fn run(home: PathBuf, config: Config) -> Result<(), DaemonError> {
    let store = Arc::new(Store::open_at(&home)?);
    let workspaces = WorkspaceManager::new(
        config.workspace.repositories_dir_at(&home),
        &config.workspace,
    );
    let generator = CommandGenerator::from_config(&config.generator)
        .map_err(|err| DaemonError::Config(format!("{err:#}")))?
        .ok_or_else(|| {
            DaemonError::Config("generator.command must be set to run the daemon".to_string())
        })?;

    let mut notifiers = Notifiers::new().with(LogNotifier);
    if let Some(url) = &config.notifier.webhook_url {
        notifiers = notifiers.with(WebhookNotifier::new(url.clone()));
    }

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        workspaces,
        Arc::new(generator),
        Arc::new(notifiers),
        config.scheduler.manual_trigger_priority,
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::new(orchestrator),
        config.scheduler.clone(),
    ));

    let cancel = CancellationToken::new();
    let signal_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        tracing::info!("received ctrl-c, shutting down daemon");
                        cancel.cancel();
                        Ok(())
                    }
                    Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                }
            }
        })
    };

    let served = serve(home, store, scheduler, cancel.clone()).await;
    cancel.cancel();
    handle_join("signal_handler", signal_handle.await)?;
    served
}

/// Run the scheduler and the control socket until `cancel` fires.
pub async fn serve(
    home: PathBuf,
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
) -> Result<(), DaemonError> {
    let root = wikisync_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let state = Arc::new(ServerState {
        home,
        store,
        scheduler: Arc::clone(&scheduler),
        cancel: cancel.clone(),
        started_at: Utc::now(),
    });

    let scheduler_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = scheduler.run(cancel.clone()).await;
            cancel.cancel();
            result
        })
    };

    let socket_handle = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let result = socket_server_task(state.clone()).await;
            state.cancel.cancel();
            result
        })
    };

    tracing::info!(pid = std::process::id(), "daemon started");
    let (scheduler_result, socket_result) = tokio::join!(scheduler_handle, socket_handle);
    handle_join("scheduler", scheduler_result)?;
    handle_join("socket_server", socket_result)?;
    tracing::info!("daemon stopped");
    Ok(())
}

async fn socket_server_task(state: Arc<ServerState>) -> Result<(), DaemonError> {
    let socket = socket_path(&state.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    let result = accept_loop(&listener, &socket, &state).await;
    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    result
}

async fn accept_loop(
    listener: &UnixListener,
    socket: &Path,
    state: &Arc<ServerState>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(socket, e))?;
                let state = Arc::clone(state);
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<ServerState>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request == DaemonRequest::Stop;
        let response = match request {
            DaemonRequest::Status => match build_status_payload(&state).await {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            DaemonRequest::Trigger { repository, branch } => {
                match handle_trigger(&state, repository, branch).await {
                    Ok(payload) => DaemonResponse::ok(payload),
                    Err(err) => DaemonResponse::error(err.to_string()),
                }
            }
            DaemonRequest::Stop => {
                tracing::info!("stop requested over control socket");
                state.cancel.cancel();
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

/// Queue a manual task for the named branch (or every branch) and wake the scheduler.
async fn handle_trigger(
    state: &Arc<ServerState>,
    reference: String,
    branch: Option<String>,
) -> Result<Value, DaemonError> {
    let store = Arc::clone(&state.store);
    let priority = state.scheduler.config().manual_trigger_priority;

    let tasks = tokio::task::spawn_blocking(move || -> Result<Vec<Value>, DaemonError> {
        let repository = store.resolve_repository(&reference)?;
        let branches = match branch {
            Some(name) => vec![store.find_branch(&repository.id, &name)?],
            None => store.branches_of(&repository.id)?,
        };
        let mut tasks = Vec::with_capacity(branches.len());
        for branch in branches {
            let outcome =
                trigger_manual_update(&store, &repository.id, &branch.id, priority, Utc::now())?;
            tasks.push(json!({
                "repository": repository.full_name(),
                "branch": branch.name,
                "task_id": outcome.task.id,
                "status": outcome.task.status,
                "created": outcome.created,
            }));
        }
        Ok(tasks)
    })
    .await
    .map_err(|err| DaemonError::Protocol(format!("trigger join error: {err}")))??;

    state.scheduler.wake();
    Ok(json!({ "tasks": tasks }))
}

async fn build_status_payload(state: &Arc<ServerState>) -> Result<Value, DaemonError> {
    let store = Arc::clone(&state.store);
    let snapshot = tokio::task::spawn_blocking(move || store.snapshot())
        .await
        .map_err(|err| DaemonError::Protocol(format!("status join error: {err}")))??;

    let mut repositories = BTreeMap::<String, usize>::new();
    for repository in &snapshot.repositories {
        *repositories.entry(repository.status.to_string()).or_default() += 1;
    }
    let mut tasks = BTreeMap::<String, usize>::new();
    for task in &snapshot.tasks {
        *tasks.entry(task.status.to_string()).or_default() += 1;
    }
    let tracked: Vec<String> = snapshot
        .repositories
        .iter()
        .map(Repository::full_name)
        .collect();

    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": state.started_at,
        "socket": socket_path(&state.home).display().to_string(),
        "last_iteration": state.scheduler.last_iteration(),
        "repositories": repositories,
        "tasks": tasks,
        "tracked": tracked,
    }))
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join error: {err}"
        ))),
    }
}

/// `RUST_LOG` wins over `logging.filter`.
pub fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = match config.format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
