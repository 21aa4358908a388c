use std::path::{Path, PathBuf};
use std::sync::Arc;

const RELEASE_BASE_URL: &str =
    "https://github.com/daniel4-scratch/pogger-script/releases/download/0.1.0a-b1";

pub const UNSUPPORTED_PLATFORM: &str = "Unsupported platform";

/// Platforms with a published pogscript release binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    WindowsX64,
    MacosArm64,
}

impl Platform {
    /// The platform this process runs on, if a release binary exists for it.
    pub fn current() -> Option<Self> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_parts(os: &str, arch: &str) -> Option<Self> {
        match (os, arch) {
            ("windows", "x86_64") => Some(Platform::WindowsX64),
            ("macos", "aarch64") => Some(Platform::MacosArm64),
            _ => None,
        }
    }

    pub fn executable_name(self) -> &'static str {
        match self {
            Platform::WindowsX64 => "pogscript.exe",
            Platform::MacosArm64 => "pogscript",
        }
    }

    pub fn release_url(self) -> String {
        let asset = match self {
            Platform::WindowsX64 => "windows-x84_64.exe",
            Platform::MacosArm64 => "macos-arm64",
        };
        format!("{}/{}", RELEASE_BASE_URL, asset)
    }
}

/// Directory the installer places the pogscript binary in.
pub fn default_install_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("pogscript-ide").join("bin"))
}

fn executable_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "pogscript".to_string())
}

fn missing_executable_message(path: &Path) -> String {
    format!(
        "{} not found at: {}",
        executable_file_name(path),
        path.display()
    )
}

/// Locates the pogscript executable a run should be started with.
pub trait ExecutableResolver: Send + Sync + 'static {
    /// Return the path of a runnable executable, or the reason there is none.
    fn resolve(&self) -> Result<PathBuf, String>;
}

/// The executable managed by the installer for the current platform.
#[derive(Debug, Clone)]
pub struct InstalledExecutable {
    pub platform: Option<Platform>,
    pub path: PathBuf,
}

impl InstalledExecutable {
    /// The managed install location for the current platform.
    pub fn detect() -> Self {
        let platform = Platform::current();
        let name = platform
            .map(Platform::executable_name)
            .unwrap_or("pogscript");
        let path = default_install_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(name);
        Self { platform, path }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl ExecutableResolver for InstalledExecutable {
    fn resolve(&self) -> Result<PathBuf, String> {
        if self.platform.is_none() {
            return Err(UNSUPPORTED_PLATFORM.to_string());
        }
        if !self.path.exists() {
            return Err(missing_executable_message(&self.path));
        }
        Ok(self.path.clone())
    }
}

/// An executable at a fixed location, regardless of platform.
#[derive(Debug, Clone)]
pub struct FixedExecutable(pub PathBuf);

impl ExecutableResolver for FixedExecutable {
    fn resolve(&self) -> Result<PathBuf, String> {
        if !self.0.exists() {
            return Err(missing_executable_message(&self.0));
        }
        Ok(self.0.clone())
    }
}

/// Resolver for a run: the configured path when one is set, otherwise the
/// managed install.
pub fn configured_resolver(
    configured: Option<&str>,
    installed: &InstalledExecutable,
) -> Arc<dyn ExecutableResolver> {
    match configured.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => Arc::new(FixedExecutable(PathBuf::from(path))),
        None => Arc::new(installed.clone()),
    }
}
