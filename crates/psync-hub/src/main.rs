use clap::Parser;
use psync_core::config::{config_path, SyncConfig};
use psync_engine::{ReconciliationSupervisor, SyncContext};
use psync_storage::{OperationLedger, StoreHub};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

mod socket;
mod source;

use socket::HubSocketConfig;
use source::LedgerSource;

#[derive(Clone, Debug)]
struct Config {
    sync: SyncConfig,
    store_path: PathBuf,
    socket_path: PathBuf,
    debug: bool,
    write_timeout: Duration,
    queue_capacity: usize,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "psync-hub")]
struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    company: String,
    #[arg(long, default_value = "")]
    store: String,
    #[arg(long, default_value = "")]
    config: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("config_error: {err}");
            return;
        }
    };
    let _log_guard = init_logging(&config);
    if config.sync.company_id.trim().is_empty() {
        warn!(event = "hub_no_company", "accepting pushes for every company");
    }

    let store = match StoreHub::sqlite(&config.store_path) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", stage = "store", error = %err);
            return;
        }
    };
    let ledger = match OperationLedger::open(&config.store_path) {
        Ok(value) => Arc::new(value),
        Err(err) => {
            error!(event = "hub_error", stage = "ledger", error = %err);
            return;
        }
    };

    let ctx = SyncContext::new(store.context("psync-hub"), config.sync.clone());
    let source = Arc::new(LedgerSource::new(ledger));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor =
        ReconciliationSupervisor::new(ctx.clone(), source.clone()).spawn(shutdown_rx.clone());

    info!(
        event = "hub_start",
        company_id = %config.sync.company_id,
        store = %config.store_path.display(),
        socket = %config.socket_path.display()
    );

    let socket_config = HubSocketConfig {
        company_id: config.sync.company_id.clone(),
        socket_path: config.socket_path.clone(),
        write_timeout: config.write_timeout,
        queue_capacity: config.queue_capacity,
    };
    let server = tokio::spawn(socket::run(socket_config, ctx, source, shutdown_rx));

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "hub_shutdown");
    let _ = shutdown_tx.send(true);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(event = "hub_error", stage = "socket", error = %err),
        Err(err) => error!(event = "hub_error", stage = "socket", error = %err),
    }
    let _ = supervisor.await;
}

fn load_config() -> Result<Config, psync_core::config::ConfigError> {
    let args = Args::parse();
    let path = if args.config.trim().is_empty() {
        config_path()
    } else {
        PathBuf::from(&args.config)
    };
    let mut sync = SyncConfig::load(&path)?;
    sync.apply_env_overrides();
    if !args.company.trim().is_empty() {
        sync.company_id = args.company.trim().to_string();
    }
    if !args.store.trim().is_empty() {
        sync.store_path = Some(PathBuf::from(&args.store));
    }

    let store_path = sync.store_path.clone().unwrap_or_else(default_store_path);
    Ok(Config {
        sync,
        store_path,
        socket_path: resolve_socket_path(&args.socket),
        debug: args.debug || env_true("PSYNC_HUB_DEBUG"),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        queue_capacity: args.queue_capacity.max(1),
        log_dir: resolve_log_dir(&args.log_dir),
    })
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("PSYNC_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("psync-hub.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn runtime_dir() -> PathBuf {
    if let Ok(value) = std::env::var("XDG_RUNTIME_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value).join("psync");
        }
    }
    std::env::temp_dir().join("psync")
}

fn resolve_socket_path(socket_flag: &str) -> PathBuf {
    if !socket_flag.trim().is_empty() {
        return PathBuf::from(socket_flag);
    }
    if let Ok(value) = std::env::var("PSYNC_HUB_SOCKET") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    runtime_dir().join("hub.sock")
}

fn default_store_path() -> PathBuf {
    if let Ok(value) = std::env::var("XDG_STATE_HOME") {
        if !value.trim().is_empty() {
            return PathBuf::from(value).join("psync/progress.sqlite3");
        }
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/state/psync/progress.sqlite3"),
        Err(_) => PathBuf::from(".psync/progress.sqlite3"),
    }
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("PSYNC_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}
