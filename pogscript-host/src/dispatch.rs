use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use pogscript_core::config::ConfigStore;
use pogscript_core::executable::{InstalledExecutable, UNSUPPORTED_PLATFORM};
use pogscript_core::installer;
use pogscript_core::protocol::{HostEvent, HostRequest};
use pogscript_core::{OwnerId, RunEventSender, RunManager, RunMessage};
use tokio::sync::mpsc;

/// Whether the request loop keeps reading after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Routes one surface's run messages onto the shared event stream, tagged
/// with the surface id.
///
/// Messages are held back until [`SurfaceSender::open`] so the `RunStarted`
/// reply always precedes the run's own events.
#[derive(Clone)]
struct SurfaceSender {
    owner: OwnerId,
    events: mpsc::UnboundedSender<HostEvent>,
    held: Arc<Mutex<Option<Vec<HostEvent>>>>,
}

impl SurfaceSender {
    fn new(owner: OwnerId, events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self {
            owner,
            events,
            held: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Emit `first`, then everything held so far, then pass messages through.
    fn open(&self, first: HostEvent) {
        let mut held = self.held.lock();
        let _ = self.events.send(first);
        for event in held.take().unwrap_or_default() {
            let _ = self.events.send(event);
        }
    }
}

impl RunEventSender for SurfaceSender {
    fn send(&self, msg: RunMessage) {
        let event = HostEvent::from_run_message(self.owner, msg);
        let mut held = self.held.lock();
        match held.as_mut() {
            Some(queue) => queue.push(event),
            None => {
                let _ = self.events.send(event);
            }
        }
    }
}

/// Parse one request line. Malformed lines become a `ProtocolError` event.
pub fn parse_request(line: &str) -> Result<HostRequest, HostEvent> {
    serde_json::from_str(line).map_err(|e| HostEvent::ProtocolError {
        message: format!("Invalid request: {}", e),
    })
}

pub struct Host {
    runs: Arc<RunManager>,
    config: Arc<Mutex<ConfigStore>>,
    installed: InstalledExecutable,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl Host {
    pub fn new(
        runs: RunManager,
        config: ConfigStore,
        installed: InstalledExecutable,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            runs: Arc::new(runs),
            config: Arc::new(Mutex::new(config)),
            installed,
            events,
        }
    }

    pub fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    /// Handle one request. Long-running requests continue on their own task.
    pub fn handle(&self, request: HostRequest) -> Flow {
        match request {
            HostRequest::StartRun { owner, source } => {
                let sender = SurfaceSender::new(owner, self.events.clone());
                let outcome = self.runs.start_run(owner, &source, sender.clone());
                sender.open(HostEvent::run_started(owner, outcome));
            }
            HostRequest::RunInput { owner, data } => {
                self.runs.send_input(owner, data);
            }
            HostRequest::StopRun { owner } => {
                let outcome = self.runs.stop_run(owner);
                self.emit(HostEvent::RunStopped {
                    owner,
                    stopped: outcome.stopped,
                });
            }
            HostRequest::CloseSurface { owner } => {
                self.runs.close_owner(owner);
            }
            HostRequest::RunCode { request_id, source } => {
                let runs = Arc::clone(&self.runs);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let text = runs.run_one_shot(&source).await;
                    let _ = events.send(HostEvent::RunResult { request_id, text });
                });
            }
            HostRequest::BuildCode {
                request_id,
                source,
                output_path,
            } => {
                let runs = Arc::clone(&self.runs);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let text = runs
                        .build_archive(&source, &PathBuf::from(output_path))
                        .await;
                    let _ = events.send(HostEvent::BuildResult { request_id, text });
                });
            }
            HostRequest::IsCodeRunning { request_id } => {
                self.emit(HostEvent::CodeRunning {
                    request_id,
                    running: self.runs.is_running(),
                });
            }
            HostRequest::SaveUiState {
                request_id,
                key,
                value,
            } => {
                let result = self.config.lock().update_ui_state(&key, value);
                if let Err(e) = &result {
                    log::error!("Error saving UI state: {}", e);
                }
                self.emit(HostEvent::ui_state_saved(request_id, result));
            }
            HostRequest::GetUiState { request_id, key } => {
                let value = self.config.lock().ui_state(&key);
                self.emit(HostEvent::UiState {
                    request_id,
                    success: true,
                    value: Some(value.unwrap_or(serde_json::Value::Null)),
                    error: None,
                });
            }
            HostRequest::SetAutoInstall {
                request_id,
                enabled,
            } => {
                let result = self.config.lock().set_auto_install(enabled);
                if let Err(e) = &result {
                    log::error!("Error saving settings: {}", e);
                }
                self.emit(HostEvent::setting_saved(request_id, result));
            }
            HostRequest::InstallPogscript { request_id } => {
                self.spawn_install(Some(request_id));
            }
            HostRequest::UninstallPogscript { request_id } => {
                let path = self.installed.path.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = tokio::task::spawn_blocking(move || installer::uninstall(&path))
                        .await
                        .unwrap_or_else(|e| Err(format!("Uninstall failed: {}", e)));
                    let _ = events.send(HostEvent::install_result(request_id, result));
                });
            }
            HostRequest::Shutdown => return Flow::Shutdown,
        }
        Flow::Continue
    }

    fn spawn_install(&self, request_id: Option<u64>) -> tokio::task::JoinHandle<()> {
        let installed = self.installed.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let progress_events = events.clone();
            let result = tokio::task::spawn_blocking(move || -> Result<String, String> {
                let platform = installed
                    .platform
                    .ok_or_else(|| UNSUPPORTED_PLATFORM.to_string())?;
                installer::install(platform, &installed.path, |message| {
                    let _ = progress_events.send(HostEvent::InstallStatus {
                        request_id,
                        message: message.to_string(),
                    });
                })
            })
            .await
            .unwrap_or_else(|e| Err(format!("Download failed: {}", e)));

            match request_id {
                Some(request_id) => {
                    let _ = events.send(HostEvent::install_result(request_id, result));
                }
                None => {
                    let message = result.unwrap_or_else(|e| e);
                    let _ = events.send(HostEvent::InstallStatus {
                        request_id: None,
                        message,
                    });
                }
            }
        })
    }

    /// Install the executable at startup when the config asks for it and it
    /// is missing.
    pub async fn auto_install(&self) {
        let wants_install = {
            let config = self.config.lock();
            let settings = config.settings();
            settings.auto_install_pogscript && settings.executable_path.is_none()
        };
        if !wants_install || self.installed.platform.is_none() || self.installed.exists() {
            return;
        }
        log::info!(
            "pogscript missing at {}, installing",
            self.installed.path.display()
        );
        let _ = self.spawn_install(None).await;
    }

    /// Close every surface. Returns the number of runs killed.
    pub fn shutdown(&self) -> usize {
        self.runs.close_all()
    }
}
