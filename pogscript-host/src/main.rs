mod dispatch;

use std::time::Duration;

use pogscript_core::config::{default_config_path, ConfigStore};
use pogscript_core::executable::{configured_resolver, InstalledExecutable};
use pogscript_core::protocol::HostEvent;
use pogscript_core::RunManager;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use dispatch::{parse_request, Flow, Host};

/// How long to wait for final run events after shutdown was requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() {
    env_logger::init();

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve()) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn serve() -> Result<(), String> {
    let config = ConfigStore::load_or_init(default_config_path())?;
    log::info!("Loaded config from {}", config.path().display());

    let installed = InstalledExecutable::detect();
    let resolver = configured_resolver(config.settings().executable_path.as_deref(), &installed);
    let runs = RunManager::new(resolver);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_events(events_rx));
    let host = Host::new(runs, config, installed, events_tx);

    host.auto_install().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read request: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let flow = match parse_request(&line) {
            Ok(request) => host.handle(request),
            Err(event) => {
                log::warn!("Rejected request line: {}", line);
                host.emit(event);
                Flow::Continue
            }
        };
        if flow == Flow::Shutdown {
            break;
        }
    }

    let killed = host.shutdown();
    log::info!("Shutting down ({} run(s) killed)", killed);
    drop(host);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer).await;
    Ok(())
}

async fn write_events(mut events: mpsc::UnboundedReceiver<HostEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let mut line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Failed to serialize event: {}", e);
                continue;
            }
        };
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if stdout.flush().await.is_err() {
            break;
        }
    }
}
