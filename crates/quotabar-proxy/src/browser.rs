//! Login windows backed by a Chromium-family browser.
//!
//! Each window is a separate browser process with a throw-away profile and
//! its traffic routed through the capture proxy. OAuth popups open inside
//! the same process, so killing it closes every window of the flow.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use quotabar_core::capture::{LoginWindow, TrafficEvent};

use crate::error::{ProxyError, Result};

/// Executables looked up on `PATH`, in preference order.
const PATH_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "microsoft-edge",
    "microsoft-edge-stable",
    "brave-browser",
    "chrome",
    "msedge",
];

#[cfg(target_os = "macos")]
const INSTALL_CANDIDATES: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
    "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
];

#[cfg(windows)]
const INSTALL_CANDIDATES: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
    r"C:\Program Files\Microsoft\Edge\Application\msedge.exe",
];

#[cfg(not(any(target_os = "macos", windows)))]
const INSTALL_CANDIDATES: &[&str] = &[];

/// Starts login windows.
#[derive(Debug, Clone)]
pub struct BrowserLauncher {
    executable: PathBuf,
}

impl BrowserLauncher {
    /// Uses a specific browser executable.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Finds a browser. `preferred` may be a path or a command name.
    pub fn detect(preferred: Option<&str>) -> Result<Self> {
        if let Some(preferred) = preferred.map(str::trim).filter(|p| !p.is_empty()) {
            let path = Path::new(preferred);
            if path.is_file() {
                return Ok(Self::new(path));
            }
            return which::which(preferred).map(Self::new).map_err(|_| {
                ProxyError::Browser(format!("configured browser {} not found", preferred))
            });
        }

        PATH_CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .or_else(|| {
                INSTALL_CANDIDATES
                    .iter()
                    .map(PathBuf::from)
                    .find(|p| p.is_file())
            })
            .map(Self::new)
            .ok_or_else(|| {
                ProxyError::Browser(
                    "no Chromium-based browser found; set one with `quotabar config set browser <path>`"
                        .to_string(),
                )
            })
    }

    /// The browser executable.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Command-line arguments for a login window.
    pub fn launch_args(proxy: SocketAddr, profile_dir: &Path, url: &str) -> Vec<String> {
        vec![
            format!("--proxy-server=http://{}", proxy),
            // Keep loopback traffic of the browser itself off the proxy.
            "--proxy-bypass-list=<-loopback>".to_string(),
            format!("--user-data-dir={}", profile_dir.display()),
            "--ignore-certificate-errors".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--new-window".to_string(),
            url.to_string(),
        ]
    }

    /// Opens `url` in a new window routed through `proxy`.
    ///
    /// When the user closes the browser, [`TrafficEvent::WindowClosed`] is
    /// sent on `events`.
    pub fn open(
        &self,
        url: &str,
        proxy: SocketAddr,
        events: mpsc::Sender<TrafficEvent>,
    ) -> Result<BrowserWindow> {
        let profile_dir = tempfile::Builder::new().prefix("quotabar-login-").tempdir()?;

        let child = Command::new(&self.executable)
            .args(Self::launch_args(proxy, profile_dir.path(), url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProxyError::Browser(format!("failed to start {:?}: {}", self.executable, e))
            })?;

        tracing::info!("Opened login window for {}", url);

        let (close_tx, close_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch(child, close_rx, events));

        Ok(BrowserWindow {
            close_tx: Some(close_tx),
            watcher: Some(watcher),
            _profile_dir: profile_dir,
        })
    }
}

/// Waits for the browser to exit or for a close request.
async fn watch(
    mut child: Child,
    close_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<TrafficEvent>,
) {
    tokio::select! {
        status = child.wait() => {
            tracing::debug!("Login window exited: {:?}", status);
            let _ = events.send(TrafficEvent::WindowClosed).await;
        }
        _ = close_rx => {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to close login window: {}", e);
            }
        }
    }
}

/// A running login window.
///
/// Dropping it kills the browser and removes its profile directory.
#[derive(Debug)]
pub struct BrowserWindow {
    close_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
    _profile_dir: TempDir,
}

#[async_trait]
impl LoginWindow for BrowserWindow {
    async fn close(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
    }
}
