use serde::{Deserialize, Serialize};

use crate::run::{OwnerId, RunMessage, StartOutcome};

// ---------------------------------------------------------------------------
// Requests: UI surface → host (one JSON object per line on stdin)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostRequest {
    StartRun {
        owner: OwnerId,
        source: String,
    },
    RunInput {
        owner: OwnerId,
        data: String,
    },
    StopRun {
        owner: OwnerId,
    },
    /// The surface was destroyed.
    CloseSurface {
        owner: OwnerId,
    },
    RunCode {
        request_id: u64,
        source: String,
    },
    BuildCode {
        request_id: u64,
        source: String,
        output_path: String,
    },
    IsCodeRunning {
        request_id: u64,
    },
    SaveUiState {
        request_id: u64,
        key: String,
        value: serde_json::Value,
    },
    GetUiState {
        request_id: u64,
        key: String,
    },
    SetAutoInstall {
        request_id: u64,
        enabled: bool,
    },
    InstallPogscript {
        request_id: u64,
    },
    UninstallPogscript {
        request_id: u64,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// Events: host → UI surface (one JSON object per line on stdout)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    RunOutput {
        owner: OwnerId,
        data: String,
    },
    RunError {
        owner: OwnerId,
        data: String,
    },
    RunExit {
        owner: OwnerId,
        code: Option<i32>,
    },
    RunStarted {
        owner: OwnerId,
        started: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RunStopped {
        owner: OwnerId,
        stopped: bool,
    },
    RunResult {
        request_id: u64,
        text: String,
    },
    BuildResult {
        request_id: u64,
        text: String,
    },
    CodeRunning {
        request_id: u64,
        running: bool,
    },
    UiState {
        request_id: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SettingSaved {
        request_id: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    InstallStatus {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
    },
    InstallResult {
        request_id: u64,
        success: bool,
        message: String,
    },
    ProtocolError {
        message: String,
    },
}

impl HostEvent {
    /// Tag a streamed run message with the surface it belongs to.
    pub fn from_run_message(owner: OwnerId, msg: RunMessage) -> Self {
        match msg {
            RunMessage::Output { data } => HostEvent::RunOutput { owner, data },
            RunMessage::Error { data } => HostEvent::RunError { owner, data },
            RunMessage::Exit { code } => HostEvent::RunExit { owner, code },
        }
    }

    pub fn run_started(owner: OwnerId, outcome: StartOutcome) -> Self {
        HostEvent::RunStarted {
            owner,
            started: outcome.started,
            reason: outcome.reason,
        }
    }

    pub fn ui_state_saved(request_id: u64, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => HostEvent::UiState {
                request_id,
                success: true,
                value: None,
                error: None,
            },
            Err(error) => HostEvent::UiState {
                request_id,
                success: false,
                value: None,
                error: Some(error),
            },
        }
    }

    pub fn setting_saved(request_id: u64, result: Result<(), String>) -> Self {
        HostEvent::SettingSaved {
            request_id,
            success: result.is_ok(),
            error: result.err(),
        }
    }

    pub fn install_result(request_id: u64, result: Result<String, String>) -> Self {
        let (success, message) = match result {
            Ok(message) => (true, message),
            Err(message) => (false, message),
        };
        HostEvent::InstallResult {
            request_id,
            success,
            message,
        }
    }
}
