use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::executable::{ExecutableResolver, InstalledExecutable};

pub const ALREADY_RUNNING: &str = "A program is already running";
const NO_OUTPUT: &str = "No output";
const READ_CHUNK_SIZE: usize = 8192;

/// Identity of the UI surface that requested a run. Stable for the lifetime
/// of the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// Trait for sending run events to the surface that owns the run.
/// Implement this for your UI framework's event channel.
pub trait RunEventSender: Send + Sync + 'static {
    fn send(&self, msg: RunMessage);
}

impl RunEventSender for mpsc::UnboundedSender<RunMessage> {
    fn send(&self, msg: RunMessage) {
        let _ = mpsc::UnboundedSender::send(self, msg);
    }
}

/// Messages streamed from a running program to its owning surface.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum RunMessage {
    Output { data: String },
    Error { data: String },
    /// Always the last message of a run. `None` when the process was
    /// terminated by a signal.
    Exit { code: Option<i32> },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StartOutcome {
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StartOutcome {
    pub fn started() -> Self {
        Self {
            started: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            started: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopOutcome {
    pub stopped: bool,
}

/// Spawns the pogscript executable. The returned child must have piped
/// stdin, stdout and stderr.
pub trait ProcessSpawner: Send + Sync + 'static {
    fn spawn(&self, program: &Path, args: &[OsString]) -> io::Result<Child>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, program: &Path, args: &[OsString]) -> io::Result<Child> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

struct RunSession {
    id: Uuid,
    kill: Option<oneshot::Sender<()>>,
    stdin: mpsc::UnboundedSender<Vec<u8>>,
}

impl RunSession {
    fn is_live(&self) -> bool {
        self.kill.is_some()
    }

    /// Issue the kill if it has not been issued yet.
    fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct RunState {
    /// The run currently holding the single execution slot.
    slot: Option<Uuid>,
    sessions: HashMap<OwnerId, RunSession>,
}

/// Holds the execution slot. Dropping it removes the owner's registry entry
/// (if it still belongs to this run) and frees the slot.
struct SlotGuard {
    state: Arc<Mutex<RunState>>,
    id: Uuid,
    owner: Option<OwnerId>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(owner) = self.owner {
            if state.sessions.get(&owner).is_some_and(|s| s.id == self.id) {
                state.sessions.remove(&owner);
            }
        }
        if state.slot == Some(self.id) {
            state.slot = None;
        }
    }
}

/// Temporary file holding the source text handed to the executable.
/// Removed on drop; removal failures are ignored.
struct SourceFile {
    path: PathBuf,
}

impl SourceFile {
    fn create(dir: &Path, source: &str) -> Result<Self, String> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = dir.join(format!(
            "temp_code_{}_{}.txt",
            millis,
            Uuid::new_v4().simple()
        ));
        fs::write(&path, source)
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
        Ok(Self { path })
    }
}

impl Drop for SourceFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("Could not remove {}: {}", self.path.display(), e);
        }
    }
}

// ---------------------------------------------------------------------------
// Run manager
// ---------------------------------------------------------------------------

/// Owns every run of the pogscript executable. At most one run, interactive
/// or one-shot, is active across all surfaces.
pub struct RunManager {
    state: Arc<Mutex<RunState>>,
    resolver: Arc<dyn ExecutableResolver>,
    spawner: Arc<dyn ProcessSpawner>,
    temp_dir: PathBuf,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new(Arc::new(InstalledExecutable::detect()))
    }
}

impl RunManager {
    pub fn new(resolver: Arc<dyn ExecutableResolver>) -> Self {
        Self::with_spawner(resolver, Arc::new(TokioSpawner))
    }

    pub fn with_spawner(
        resolver: Arc<dyn ExecutableResolver>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState::default())),
            resolver,
            spawner,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Directory temporary source files are written to.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Whether any run currently holds the execution slot.
    pub fn is_running(&self) -> bool {
        self.state.lock().slot.is_some()
    }

    /// Whether `owner` has a registered interactive session.
    pub fn has_session(&self, owner: OwnerId) -> bool {
        self.state.lock().sessions.contains_key(&owner)
    }

    fn try_acquire(&self) -> Option<SlotGuard> {
        let mut state = self.state.lock();
        if state.slot.is_some() {
            return None;
        }
        let id = Uuid::new_v4();
        state.slot = Some(id);
        Some(SlotGuard {
            state: Arc::clone(&self.state),
            id,
            owner: None,
        })
    }

    /// Start an interactive run for `owner`, streaming its output to `sender`.
    ///
    /// Must be called from within a Tokio runtime. Returns immediately; the
    /// run's progress is reported through `sender`, ending with a single
    /// [`RunMessage::Exit`].
    pub fn start_run(
        &self,
        owner: OwnerId,
        source: &str,
        sender: impl RunEventSender,
    ) -> StartOutcome {
        let Some(mut slot) = self.try_acquire() else {
            return StartOutcome::rejected(ALREADY_RUNNING);
        };

        let exe = match self.resolver.resolve() {
            Ok(path) => path,
            Err(reason) => {
                log::info!("Run rejected for {}: {}", owner, reason);
                return StartOutcome::rejected(reason);
            }
        };

        let source_file = match SourceFile::create(&self.temp_dir, source) {
            Ok(file) => file,
            Err(e) => return StartOutcome::rejected(format!("Error: {}", e)),
        };

        let args = [source_file.path.clone().into_os_string()];
        let mut child = match self.spawner.spawn(&exe, &args) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Failed to spawn '{}' for {}: {}", exe.display(), owner, e);
                drop(source_file);
                drop(slot);
                sender.send(RunMessage::Error {
                    data: format!("Error: {}", e),
                });
                sender.send(RunMessage::Exit { code: Some(-1) });
                return StartOutcome::started();
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (kill_tx, kill_rx) = oneshot::channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        slot.owner = Some(owner);
        self.state.lock().sessions.insert(
            owner,
            RunSession {
                id: slot.id,
                kill: Some(kill_tx),
                stdin: stdin_tx,
            },
        );

        let sender: Arc<dyn RunEventSender> = Arc::new(sender);
        if let Some(stdin) = stdin {
            tokio::spawn(stdin_writer(stdin, stdin_rx));
        }
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(forward_stream(
                stdout,
                StreamKind::Stdout,
                Arc::clone(&sender),
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(forward_stream(
                stderr,
                StreamKind::Stderr,
                Arc::clone(&sender),
            )));
        }

        log::info!(
            "Run {} started for {} ({})",
            slot.id,
            owner,
            source_file.path.display()
        );
        tokio::spawn(supervise(child, kill_rx, readers, source_file, slot, sender));

        StartOutcome::started()
    }

    /// Write `data` to the stdin of the owner's live run. No-op otherwise.
    pub fn send_input(&self, owner: OwnerId, data: impl Into<Vec<u8>>) {
        let state = self.state.lock();
        if let Some(session) = state.sessions.get(&owner) {
            if session.is_live() {
                let _ = session.stdin.send(data.into());
            }
        }
    }

    /// Kill the owner's live run. Cleanup happens when the process exits.
    pub fn stop_run(&self, owner: OwnerId) -> StopOutcome {
        let mut state = self.state.lock();
        let stopped = state
            .sessions
            .get_mut(&owner)
            .map(RunSession::kill)
            .unwrap_or(false);
        if stopped {
            log::info!("Run stopped for {}", owner);
        }
        StopOutcome { stopped }
    }

    /// Tear down everything the surface owns. Safe to call repeatedly.
    /// Returns whether a kill was issued.
    pub fn close_owner(&self, owner: OwnerId) -> bool {
        let removed = self.state.lock().sessions.remove(&owner);
        match removed {
            Some(mut session) => {
                let killed = session.kill();
                log::info!("Closed {} (killed live run: {})", owner, killed);
                killed
            }
            None => false,
        }
    }

    /// Close every surface, killing live runs. Returns the number of kills.
    pub fn close_all(&self) -> usize {
        let sessions: Vec<RunSession> = {
            let mut state = self.state.lock();
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        sessions
            .into_iter()
            .map(|mut session| session.kill())
            .filter(|killed| *killed)
            .count()
    }

    /// Run `source` to completion and return the formatted result.
    pub async fn run_one_shot(&self, source: &str) -> String {
        match self.run_to_completion(source, |path| vec![path.into()]).await {
            Ok(output) => format_run_output(&output.stdout, &output.stderr),
            Err(message) => format!("Error: {}", message),
        }
    }

    /// Build `source` into an archive at `output_path`.
    pub async fn build_archive(&self, source: &str, output_path: &Path) -> String {
        let archive_args = |path: &Path| {
            vec![
                OsString::from("--archive"),
                output_path.as_os_str().to_os_string(),
                path.into(),
            ]
        };
        match self.run_to_completion(source, archive_args).await {
            Ok(output) => format_build_output(&output.stdout, &output.stderr, output_path),
            Err(message) => format!("Build Error: {}", message),
        }
    }

    async fn run_to_completion(
        &self,
        source: &str,
        args_for: impl FnOnce(&Path) -> Vec<OsString>,
    ) -> Result<CapturedOutput, String> {
        let _slot = self
            .try_acquire()
            .ok_or_else(|| ALREADY_RUNNING.to_string())?;
        let exe = self.resolver.resolve()?;
        let source_file = SourceFile::create(&self.temp_dir, source)?;

        let child = self
            .spawner
            .spawn(&exe, &args_for(&source_file.path))
            .map_err(|e| {
                log::warn!("Failed to spawn '{}': {}", exe.display(), e);
                e.to_string()
            })?;
        let output = child.wait_with_output().await.map_err(|e| e.to_string())?;
        log::info!("One-shot run finished with {}", output.status);

        Ok(CapturedOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Drop for RunManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

struct CapturedOutput {
    stdout: String,
    stderr: String,
}

/// Format a one-shot result: stderr first, then stdout, or "No output".
pub fn format_run_output(stdout: &str, stderr: &str) -> String {
    let mut sections = Vec::with_capacity(2);
    if !stderr.is_empty() {
        sections.push(format!("Error:\n{}", stderr));
    }
    if !stdout.is_empty() {
        sections.push(format!("Output:\n{}", stdout));
    }
    if sections.is_empty() {
        return NO_OUTPUT.to_string();
    }
    sections.join("\n\n")
}

pub fn format_build_output(stdout: &str, stderr: &str, output_path: &Path) -> String {
    let mut result = if stderr.is_empty() {
        format!(
            "Build completed successfully!\nArchive saved to: {}",
            output_path.display()
        )
    } else {
        format!("Build Error:\n{}", stderr)
    };
    if !stdout.is_empty() {
        result.push_str("\nBuild Output:\n");
        result.push_str(stdout);
    }
    result
}

// ---------------------------------------------------------------------------
// Stream plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn message(self, data: String) -> RunMessage {
        match self {
            StreamKind::Stdout => RunMessage::Output { data },
            StreamKind::Stderr => RunMessage::Error { data },
        }
    }
}

async fn stdin_writer(mut stdin: ChildStdin, mut receiver: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = receiver.recv().await {
        if stdin.write_all(&data).await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn forward_stream<R: AsyncRead + Unpin>(
    mut stream: R,
    kind: StreamKind,
    sender: Arc<dyn RunEventSender>,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut decoder = Utf8Chunker::default();
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() {
                    sender.send(kind.message(text));
                }
            }
            Err(e) => {
                log::warn!("Run {:?} read error: {}", kind, e);
                break;
            }
        }
    }
    let rest = decoder.finish();
    if !rest.is_empty() {
        sender.send(kind.message(rest));
    }
}

/// Waits for the process, drains its output, cleans up, then reports the exit.
async fn supervise(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    source_file: SourceFile,
    slot: SlotGuard,
    sender: Arc<dyn RunEventSender>,
) {
    // A dropped kill sender means the session was torn down; treat it as a kill.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                log::debug!("Kill for run {} failed: {}", slot.id, e);
            }
            child.wait().await
        }
    };

    for reader in readers {
        let _ = reader.await;
    }

    let run_id = slot.id;
    drop(source_file);
    drop(slot);

    let code = match status {
        Ok(status) => {
            log::info!("Run {} exited with {}", run_id, status);
            status.code()
        }
        Err(e) => {
            log::warn!("Run {} failed: {}", run_id, e);
            sender.send(RunMessage::Error {
                data: format!("Error: {}", e),
            });
            Some(-1)
        }
    };
    sender.send(RunMessage::Exit { code });
}

/// Decodes a byte stream chunk by chunk, holding back a UTF-8 sequence that
/// is split across reads.
#[derive(Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let split = incomplete_suffix_start(&self.pending);
        let tail = self.pending.split_off(split);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

fn incomplete_suffix_start(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                match e.error_len() {
                    None => return valid_end,
                    Some(len) => start = valid_end + len,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_run_output_no_output() {
        assert_eq!(format_run_output("", ""), "No output");
    }

    #[test]
    fn format_run_output_stdout_only() {
        assert_eq!(format_run_output("hi\n", ""), "Output:\nhi\n");
    }

    #[test]
    fn format_run_output_stderr_only() {
        let text = format_run_output("", "boom\n");
        assert_eq!(text, "Error:\nboom\n");
        assert!(!text.contains("Output:"));
    }

    #[test]
    fn format_run_output_stderr_first() {
        assert_eq!(
            format_run_output("out", "err"),
            "Error:\nerr\n\nOutput:\nout"
        );
    }

    #[test]
    fn format_build_output_success() {
        assert_eq!(
            format_build_output("", "", Path::new("/tmp/build.pogx")),
            "Build completed successfully!\nArchive saved to: /tmp/build.pogx"
        );
    }

    #[test]
    fn format_build_output_error_with_output() {
        assert_eq!(
            format_build_output("log", "bad", Path::new("/tmp/build.pogx")),
            "Build Error:\nbad\nBuild Output:\nlog"
        );
    }

    #[test]
    fn start_outcome_serialization() {
        assert_eq!(
            serde_json::to_value(StartOutcome::started()).unwrap(),
            serde_json::json!({ "started": true })
        );
        assert_eq!(
            serde_json::to_value(StartOutcome::rejected(ALREADY_RUNNING)).unwrap(),
            serde_json::json!({ "started": false, "reason": "A program is already running" })
        );
    }

    #[test]
    fn run_message_serialization() {
        let json = serde_json::to_value(RunMessage::Exit { code: Some(0) }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "Exit", "code": 0 }));
    }

    #[test]
    fn utf8_chunker_passes_ascii_through() {
        let mut decoder = Utf8Chunker::default();
        assert_eq!(decoder.push(b"hello"), "hello");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn utf8_chunker_holds_split_sequence() {
        let bytes = "héllo".as_bytes();
        let mut decoder = Utf8Chunker::default();
        // Split inside the two-byte 'é'.
        assert_eq!(decoder.push(&bytes[..2]), "h");
        assert_eq!(decoder.push(&bytes[2..]), "éllo");
    }

    #[test]
    fn utf8_chunker_replaces_invalid_bytes() {
        let mut decoder = Utf8Chunker::default();
        assert_eq!(decoder.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }

    #[test]
    fn utf8_chunker_flushes_truncated_tail_on_finish() {
        let mut decoder = Utf8Chunker::default();
        assert_eq!(decoder.push(&[b'a', 0xe2, 0x82]), "a");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn owner_id_display() {
        assert_eq!(OwnerId(7).to_string(), "surface-7");
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::executable::FixedExecutable;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;
        use tempfile::TempDir;

        const SHELL: &str = "/bin/sh";
        const OWNER: OwnerId = OwnerId(1);

        struct CountingSpawner {
            count: Arc<AtomicUsize>,
        }

        impl ProcessSpawner for CountingSpawner {
            fn spawn(&self, program: &Path, args: &[OsString]) -> io::Result<Child> {
                self.count.fetch_add(1, Ordering::SeqCst);
                TokioSpawner.spawn(program, args)
            }
        }

        struct Fixture {
            dir: TempDir,
            spawns: Arc<AtomicUsize>,
            manager: RunManager,
        }

        impl Fixture {
            fn temp_file_count(&self) -> usize {
                fs::read_dir(self.dir.path()).unwrap().count()
            }
        }

        /// The shell stands in for pogscript: the source text is a shell
        /// script and gets the same single path argument.
        fn fixture(executable: &str) -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let spawns = Arc::new(AtomicUsize::new(0));
            let manager = RunManager::with_spawner(
                Arc::new(FixedExecutable(PathBuf::from(executable))),
                Arc::new(CountingSpawner {
                    count: Arc::clone(&spawns),
                }),
            )
            .with_temp_dir(dir.path());
            Fixture {
                dir,
                spawns,
                manager,
            }
        }

        async fn collect_until_exit(
            rx: &mut mpsc::UnboundedReceiver<RunMessage>,
        ) -> Vec<RunMessage> {
            let mut messages = Vec::new();
            loop {
                let msg = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .expect("timed out waiting for run events")
                    .expect("event channel closed before exit");
                let done = matches!(msg, RunMessage::Exit { .. });
                messages.push(msg);
                if done {
                    return messages;
                }
            }
        }

        fn stdout_text(messages: &[RunMessage]) -> String {
            messages
                .iter()
                .filter_map(|m| match m {
                    RunMessage::Output { data } => Some(data.as_str()),
                    _ => None,
                })
                .collect()
        }

        fn stderr_text(messages: &[RunMessage]) -> String {
            messages
                .iter()
                .filter_map(|m| match m {
                    RunMessage::Error { data } => Some(data.as_str()),
                    _ => None,
                })
                .collect()
        }

        #[tokio::test]
        async fn second_start_is_rejected_until_first_exits() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert_eq!(
                fx.manager.start_run(OWNER, "echo print", tx.clone()),
                StartOutcome::started()
            );
            assert_eq!(
                fx.manager.start_run(OWNER, "echo print", tx.clone()),
                StartOutcome::rejected("A program is already running")
            );

            let messages = collect_until_exit(&mut rx).await;
            assert_eq!(stdout_text(&messages), "print\n");
            assert_eq!(messages.last(), Some(&RunMessage::Exit { code: Some(0) }));

            assert_eq!(
                fx.manager.start_run(OWNER, "echo print", tx),
                StartOutcome::started()
            );
            collect_until_exit(&mut rx).await;
            assert_eq!(fx.spawns.load(Ordering::SeqCst), 2);
        }

        #[tokio::test]
        async fn other_surfaces_share_the_single_slot() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();
            let (other_tx, _other_rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx.manager.start_run(OWNER, "echo one", tx).started);
            let outcome = fx.manager.start_run(OwnerId(2), "echo two", other_tx);
            assert!(!outcome.started);
            assert!(!fx.manager.has_session(OwnerId(2)));

            collect_until_exit(&mut rx).await;
        }

        #[tokio::test]
        async fn terminal_state_clears_registry_slot_and_temp_file() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx.manager.start_run(OWNER, "echo oops >&2; exit 3", tx).started);
            assert!(fx.manager.is_running());
            assert!(fx.manager.has_session(OWNER));
            assert_eq!(fx.temp_file_count(), 1);

            let messages = collect_until_exit(&mut rx).await;
            assert_eq!(stderr_text(&messages), "oops\n");
            assert_eq!(messages.last(), Some(&RunMessage::Exit { code: Some(3) }));

            assert!(!fx.manager.is_running());
            assert!(!fx.manager.has_session(OWNER));
            assert_eq!(fx.temp_file_count(), 0);
        }

        #[tokio::test]
        async fn input_reaches_the_running_program() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx
                .manager
                .start_run(OWNER, "read line; echo \"got $line\"", tx)
                .started);
            fx.manager.send_input(OWNER, "world\n");

            let messages = collect_until_exit(&mut rx).await;
            assert_eq!(stdout_text(&messages), "got world\n");
        }

        #[tokio::test]
        async fn input_after_exit_is_ignored() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx.manager.start_run(OWNER, "exit 0", tx).started);
            collect_until_exit(&mut rx).await;

            fx.manager.send_input(OWNER, "late\n");
            fx.manager.send_input(OwnerId(99), "nobody\n");
            assert!(!fx.manager.has_session(OWNER));
        }

        #[tokio::test]
        async fn stop_without_session_is_a_no_op() {
            let fx = fixture(SHELL);
            assert_eq!(fx.manager.stop_run(OWNER), StopOutcome { stopped: false });
            assert!(!fx.manager.is_running());
        }

        #[tokio::test]
        async fn stop_kills_and_cleanup_follows_exit() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx.manager.start_run(OWNER, "exec sleep 30", tx).started);
            assert_eq!(fx.manager.stop_run(OWNER), StopOutcome { stopped: true });
            // Already killed: no second kill.
            assert_eq!(fx.manager.stop_run(OWNER), StopOutcome { stopped: false });

            let messages = collect_until_exit(&mut rx).await;
            assert_eq!(messages.last(), Some(&RunMessage::Exit { code: None }));
            assert!(!fx.manager.is_running());
            assert!(!fx.manager.has_session(OWNER));
            assert_eq!(fx.temp_file_count(), 0);
        }

        #[tokio::test]
        async fn close_owner_kills_once_and_removes_entry() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx.manager.start_run(OWNER, "exec sleep 30", tx).started);
            assert!(fx.manager.close_owner(OWNER));
            assert!(!fx.manager.has_session(OWNER));
            assert!(!fx.manager.close_owner(OWNER));

            let messages = collect_until_exit(&mut rx).await;
            assert_eq!(messages.last(), Some(&RunMessage::Exit { code: None }));
            assert!(!fx.manager.is_running());
            assert_eq!(fx.temp_file_count(), 0);
        }

        #[tokio::test]
        async fn close_owner_without_session_is_idempotent() {
            let fx = fixture(SHELL);
            assert!(!fx.manager.close_owner(OWNER));
            assert!(!fx.manager.close_owner(OWNER));
        }

        #[tokio::test]
        async fn close_all_kills_live_runs() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx.manager.start_run(OWNER, "exec sleep 30", tx).started);
            assert_eq!(fx.manager.close_all(), 1);
            assert_eq!(fx.manager.close_all(), 0);

            let messages = collect_until_exit(&mut rx).await;
            assert_eq!(messages.last(), Some(&RunMessage::Exit { code: None }));
            assert!(!fx.manager.is_running());
        }

        #[tokio::test]
        async fn missing_executable_rejects_without_spawning() {
            let fx = fixture("/nonexistent/bin/pogscript");
            let (tx, _rx) = mpsc::unbounded_channel::<RunMessage>();

            let outcome = fx.manager.start_run(OWNER, "echo hi", tx);
            assert!(!outcome.started);
            assert!(outcome
                .reason
                .unwrap()
                .contains("/nonexistent/bin/pogscript"));
            assert_eq!(fx.spawns.load(Ordering::SeqCst), 0);
            assert_eq!(fx.temp_file_count(), 0);
            assert!(!fx.manager.is_running());
        }

        #[tokio::test]
        async fn spawn_error_reports_error_then_sentinel_exit() {
            use std::os::unix::fs::PermissionsExt;

            let exe_dir = tempfile::tempdir().unwrap();
            let exe = exe_dir.path().join("pogscript");
            fs::write(&exe, b"not a program").unwrap();
            fs::set_permissions(&exe, fs::Permissions::from_mode(0o644)).unwrap();

            let fx = fixture(exe.to_str().unwrap());
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert_eq!(
                fx.manager.start_run(OWNER, "print", tx.clone()),
                StartOutcome::started()
            );
            let messages = collect_until_exit(&mut rx).await;
            assert_eq!(messages.len(), 2);
            assert!(matches!(
                &messages[0],
                RunMessage::Error { data } if data.starts_with("Error: ")
            ));
            assert_eq!(messages[1], RunMessage::Exit { code: Some(-1) });

            assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);
            assert!(!fx.manager.is_running());
            assert!(!fx.manager.has_session(OWNER));
            assert_eq!(fx.temp_file_count(), 0);

            // The slot is free again for the next attempt.
            assert_eq!(
                fx.manager.start_run(OWNER, "print", tx),
                StartOutcome::started()
            );
            collect_until_exit(&mut rx).await;
        }

        #[tokio::test]
        async fn one_shot_empty_output() {
            let fx = fixture(SHELL);
            assert_eq!(fx.manager.run_one_shot(":").await, "No output");
            assert_eq!(fx.temp_file_count(), 0);
            assert!(!fx.manager.is_running());
        }

        #[tokio::test]
        async fn one_shot_stderr_only() {
            let fx = fixture(SHELL);
            let text = fx.manager.run_one_shot("echo bad >&2").await;
            assert_eq!(text, "Error:\nbad\n");
            assert!(!text.contains("Output:"));
        }

        #[tokio::test]
        async fn one_shot_reports_stderr_before_stdout() {
            let fx = fixture(SHELL);
            let text = fx.manager.run_one_shot("echo out; echo err >&2").await;
            assert_eq!(text, "Error:\nerr\n\n\nOutput:\nout\n");
        }

        #[tokio::test]
        async fn one_shot_is_refused_while_interactive_run_is_active() {
            let fx = fixture(SHELL);
            let (tx, mut rx) = mpsc::unbounded_channel::<RunMessage>();

            assert!(fx.manager.start_run(OWNER, "exec sleep 30", tx).started);
            assert_eq!(
                fx.manager.run_one_shot("echo hi").await,
                "Error: A program is already running"
            );

            fx.manager.stop_run(OWNER);
            collect_until_exit(&mut rx).await;
            assert_eq!(fx.manager.run_one_shot("echo hi").await, "Output:\nhi\n");
        }

        #[tokio::test]
        async fn one_shot_missing_executable() {
            let fx = fixture("/nonexistent/bin/pogscript");
            let text = fx.manager.run_one_shot("echo hi").await;
            assert_eq!(
                text,
                "Error: pogscript not found at: /nonexistent/bin/pogscript"
            );
            assert_eq!(fx.spawns.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn build_passes_archive_arguments() {
            let fx = fixture("/bin/echo");
            let output = fx.dir.path().join("out.pogx");
            let text = fx.manager.build_archive("source", &output).await;

            let expected_prefix = format!(
                "Build completed successfully!\nArchive saved to: {}\nBuild Output:\n--archive {} ",
                output.display(),
                output.display()
            );
            assert!(text.starts_with(&expected_prefix), "{}", text);
            assert!(text.contains("temp_code_"));
            assert_eq!(fx.temp_file_count(), 0);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn concurrent_starts_admit_exactly_one() {
            let fx = Arc::new(fixture(SHELL));
            let mut handles = Vec::new();
            let mut receivers = Vec::new();
            for owner in 0..8u64 {
                let (tx, rx) = mpsc::unbounded_channel::<RunMessage>();
                receivers.push(rx);
                let fx = Arc::clone(&fx);
                handles.push(tokio::spawn(async move {
                    fx.manager.start_run(OwnerId(owner), "sleep 1", tx).started
                }));
            }

            let mut started = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    started += 1;
                }
            }
            assert_eq!(started, 1);
            assert_eq!(fx.spawns.load(Ordering::SeqCst), 1);

            for (owner, rx) in receivers.iter_mut().enumerate() {
                if fx.manager.has_session(OwnerId(owner as u64)) {
                    collect_until_exit(rx).await;
                }
            }
            assert!(!fx.manager.is_running());
        }
    }
}
