use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use slotsync_core::Config;
use slotsync_notifier::notifier_from_config;
use slotsync_sync::discovery::OWNER_FILE_PREFIX;
use slotsync_sync::{NamingRules, SyncPipeline};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{io_err, DaemonError};
use crate::lifecycle::{CycleJob, LifecycleController, Trigger};
use crate::paths::{
    logs_dir, socket_path, stderr_log_path, stdout_log_path, DEBOUNCE_WINDOW, LOG_JSON_ENV,
};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Pending cycle requests beyond the running one.
const JOB_QUEUE_CAPACITY: usize = 8;

const ROTATION_INTERVAL: Duration = Duration::from_secs(5);

/// Knobs for [`serve`] that are not part of the controller.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub cycle_interval: Duration,
    /// Source directory to watch; `None` disables the watcher.
    pub watch_dir: Option<PathBuf>,
    pub rules: NamingRules,
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cycle_interval: config.cycle_interval(),
            watch_dir: config
                .watch_source_dir
                .then(|| config.source_dir.clone()),
            rules: NamingRules::new(config.file_prefix.clone(), &config.file_extensions),
        }
    }
}

/// Load `~/.slotsync/config.yaml`, start the runtime and block the current
/// thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    ensure_runtime_dirs(home)?;
    init_tracing(home);
    let config = slotsync_core::config::load_at(home)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Build the production pipeline and notifier for `config` and serve.
pub async fn run(home: PathBuf, config: Config) -> Result<(), DaemonError> {
    let pipeline = SyncPipeline::from_config(&config, &home, false)?;
    let notifier = notifier_from_config(&config)?;
    let controller = Arc::new(LifecycleController::new(
        Arc::new(pipeline),
        notifier,
        config.shutdown_deadline(),
    ));
    tracing::info!(
        source_dir = %config.source_dir.display(),
        interval_secs = config.cycle_interval_secs,
        max_concurrency = config.max_concurrency,
        "daemon starting"
    );
    serve(home, controller, RuntimeSettings::from_config(&config)).await
}

/// Run scheduler, watcher, socket server, log rotation and signal handling
/// around `controller` until stopped.
///
/// A stop (signal or socket `stop`) and a fatal cycle both go through
/// [`LifecycleController::shutdown`]; the other tasks are stopped after it
/// returns. A fatal cycle makes this return [`DaemonError::Fatal`].
pub async fn serve(
    home: PathBuf,
    controller: Arc<LifecycleController>,
    settings: RuntimeSettings,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let (job_tx, job_rx) = mpsc::channel::<CycleJob>(JOB_QUEUE_CAPACITY);
    // Stop requested from outside.
    let stop = CancellationToken::new();
    // Cancelled once the controller has shut down.
    let services = CancellationToken::new();

    let scheduler_handle = {
        let controller = controller.clone();
        let interval = settings.cycle_interval;
        tokio::spawn(async move { controller.run(interval, job_rx).await })
    };

    let supervisor_handle = {
        let controller = controller.clone();
        let stop = stop.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let root = controller.root_token();
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = root.cancelled() => {}
            }
            let report = controller.shutdown().await;
            if let Some(summary) = &report.abandoned {
                tracing::warn!(
                    cycle_id = %summary.cycle_id,
                    failed = summary.failed,
                    "cycle abandoned during shutdown"
                );
            }
            services.cancel();
            Ok::<(), DaemonError>(())
        })
    };

    let watcher_handle = {
        let jobs = job_tx.clone();
        let services = services.clone();
        let stop = stop.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let result = watcher_task(settings.watch_dir, settings.rules, jobs, services).await;
            if result.is_err() {
                stop.cancel();
            }
            result
        })
    };

    let socket_handle = {
        let home = home.clone();
        let controller = controller.clone();
        let jobs = job_tx.clone();
        let stop = stop.clone();
        let services = services.clone();
        tokio::spawn(async move {
            let result = socket_server_task(home, controller, jobs, stop.clone(), services).await;
            if result.is_err() {
                stop.cancel();
            }
            result
        })
    };
    drop(job_tx);

    let rotation_handle = {
        let home = home.clone();
        let services = services.clone();
        tokio::spawn(async move { log_rotation_task(home, services).await })
    };

    let signal_handle = {
        let stop = stop.clone();
        let services = services.clone();
        tokio::spawn(async move { signal_task(stop, services).await })
    };

    let (scheduler, supervisor, watcher, socket, rotation, signal) = tokio::join!(
        scheduler_handle,
        supervisor_handle,
        watcher_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    handle_join("scheduler", scheduler)?;
    handle_join("supervisor", supervisor)?;
    handle_join("watcher", watcher)?;
    handle_join("socket_server", socket)?;
    handle_join("log_rotation", rotation)?;
    handle_join("signal_handler", signal)?;
    tracing::info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Source directory watcher
// ---------------------------------------------------------------------------

async fn watcher_task(
    dir: Option<PathBuf>,
    rules: NamingRules,
    jobs: mpsc::Sender<CycleJob>,
    services: CancellationToken,
) -> Result<(), DaemonError> {
    let Some(dir) = dir else {
        return Ok(());
    };
    // FSEvents reports real paths (/private/var/... on macOS).
    let dir = fs::canonicalize(&dir).unwrap_or(dir);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    if let Err(err) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        tracing::warn!(
            dir = %dir.display(),
            error = %err,
            "cannot watch source directory, relying on the interval"
        );
        return Ok(());
    }
    tracing::info!(dir = %dir.display(), "watching source directory");

    let mut quiet_until: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = services.cancelled() => break,
            _ = quiet_period_elapsed(quiet_until) => {
                quiet_until = None;
                match jobs.try_send(CycleJob::background(Trigger::Watcher)) {
                    Ok(()) => tracing::debug!("source change queued a cycle"),
                    Err(TrySendError::Full(_)) => {
                        tracing::debug!("cycle queue full, change will be picked up by a queued cycle")
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    Ok(event) if is_source_event(&event, &rules) => {
                        quiet_until = Some(Instant::now() + DEBOUNCE_WINDOW);
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "watcher event error"),
                }
            }
        }
    }
    Ok(())
}

/// Resolves once `deadline` passes; never when there is none.
async fn quiet_period_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A create/modify/remove touching a source file or its office owner file.
fn is_source_event(event: &Event, rules: &NamingRules) -> bool {
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|path| {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|name| name.strip_prefix(OWNER_FILE_PREFIX).unwrap_or(name))
            .is_some_and(|name| rules.partition_name(name).is_some())
    })
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn socket_server_task(
    home: PathBuf,
    controller: Arc<LifecycleController>,
    jobs: mpsc::Sender<CycleJob>,
    stop: CancellationToken,
    services: CancellationToken,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = services.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let controller = controller.clone();
                let jobs = jobs.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, home, controller, jobs, stop).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    controller: Arc<LifecycleController>,
    jobs: mpsc::Sender<CycleJob>,
    stop: CancellationToken,
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

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
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

        let response = match request {
            DaemonRequest::Status => {
                let status = controller.status().await;
                DaemonResponse::ok(json!({
                    "running": true,
                    "pid": std::process::id(),
                    "socket": socket_path(&home).display().to_string(),
                    "controller": status,
                }))
            }
            DaemonRequest::Sync => {
                let (job, reply) = CycleJob::awaited(Trigger::Socket);
                if jobs.send(job).await.is_err() {
                    DaemonResponse::error(DaemonError::ShuttingDown.to_string())
                } else {
                    match reply.await {
                        Ok(Ok(summary)) => DaemonResponse::ok(json!(summary)),
                        Ok(Err(message)) => DaemonResponse::error(message),
                        Err(_) => DaemonResponse::error(DaemonError::ShuttingDown.to_string()),
                    }
                }
            }
            DaemonRequest::Stop => {
                stop.cancel();
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if request == DaemonRequest::Stop {
            break;
        }
    }

    Ok(())
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
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

async fn log_rotation_task(home: PathBuf, services: CancellationToken) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(ROTATION_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick is immediate; skip rotating on startup.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = services.cancelled() => break,
            _ = interval.tick() => {
                let home = home.clone();
                // Failures are logged inside rotate_logs.
                let _ = tokio::task::spawn_blocking(move || crate::log_rotation::rotate_logs(&home)).await;
            }
        }
    }
    Ok(())
}

async fn signal_task(stop: CancellationToken, services: CancellationToken) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = services.cancelled() => {}
        _ = stop.cancelled() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| io_err("ctrl-c handler", e))?;
            tracing::info!("received ctrl-c, shutting down daemon");
            stop.cancel();
        }
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            stop.cancel();
        }
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let logs = logs_dir(home);
    if !logs.exists() {
        fs::create_dir_all(&logs).map_err(|e| io_err(&logs, e))?;
    }
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Install the daemon subscriber: everything at the `RUST_LOG` level
/// (default `info`) into `daemon.log`, warnings and errors also into
/// `daemon-err.log`. `SLOTSYNC_LOG_JSON=1` switches both to JSON lines.
pub fn init_tracing(home: &Path) {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter, Layer};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let out = append_writer(stdout_log_path(home));
    let err = append_writer(stderr_log_path(home));

    let layers = if json_logs_requested() {
        vec![
            fmt::layer().json().with_writer(out).with_filter(filter).boxed(),
            fmt::layer()
                .json()
                .with_writer(err)
                .with_filter(LevelFilter::WARN)
                .boxed(),
        ]
    } else {
        vec![
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(out)
                .with_filter(filter)
                .boxed(),
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(err)
                .with_filter(LevelFilter::WARN)
                .boxed(),
        ]
    };
    let _ = tracing_subscriber::registry().with(layers).try_init();
}

fn json_logs_requested() -> bool {
    std::env::var(LOG_JSON_ENV)
        .is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Opens `path` for append on every event so rotation never strands the
/// writer on a renamed file. Falls back to stderr if the log is unwritable.
fn append_writer(path: PathBuf) -> impl Fn() -> Box<dyn Write> + Send + Sync + 'static {
    move || match fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Box::new(file) as Box<dyn Write>,
        Err(_) => Box::new(std::io::stderr()),
    }
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use tempfile::TempDir;

    fn rules() -> NamingRules {
        NamingRules::new("reservations_", &["csv".to_string(), "tsv".to_string()])
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn sheet_changes_are_source_events() {
        let rules = rules();
        assert!(is_source_event(
            &event(EventKind::Modify(ModifyKind::Any), "/data/reservations_north.csv"),
            &rules
        ));
        assert!(is_source_event(
            &event(EventKind::Create(CreateKind::File), "/data/reservations_south.tsv"),
            &rules
        ));
        // Owner file going away means the sheet was closed.
        assert!(is_source_event(
            &event(EventKind::Remove(RemoveKind::File), "/data/~$reservations_north.csv"),
            &rules
        ));
    }

    #[test]
    fn unrelated_files_and_access_events_are_ignored() {
        let rules = rules();
        assert!(!is_source_event(
            &event(EventKind::Modify(ModifyKind::Any), "/data/notes.txt"),
            &rules
        ));
        assert!(!is_source_event(
            &event(EventKind::Modify(ModifyKind::Any), "/data/reservations_north.xlsx"),
            &rules
        ));
        assert!(!is_source_event(
            &event(
                EventKind::Access(notify::event::AccessKind::Any),
                "/data/reservations_north.csv"
            ),
            &rules
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_waits_for_deadline() {
        let start = Instant::now();
        quiet_period_elapsed(Some(start + DEBOUNCE_WINDOW)).await;
        assert!(start.elapsed() >= DEBOUNCE_WINDOW);
    }

    #[test]
    fn stale_socket_is_removed_before_bind() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("daemon.sock");
        fs::write(&socket, b"").unwrap();
        prepare_socket_for_bind(&socket).unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config {
            source_dir: PathBuf::from("/data/sheets"),
            ..Config::default()
        };
        let settings = RuntimeSettings::from_config(&config);
        assert_eq!(settings.watch_dir, Some(PathBuf::from("/data/sheets")));
        assert_eq!(settings.cycle_interval, config.cycle_interval());

        config.watch_source_dir = false;
        assert!(RuntimeSettings::from_config(&config).watch_dir.is_none());
    }
}
