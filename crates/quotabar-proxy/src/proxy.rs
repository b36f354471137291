//! Loopback MITM proxy for one login window.

use std::net::SocketAddr;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use quotabar_core::capture::{CaptureProfile, TrafficEvent};

use crate::ca::CaManager;
use crate::error::{ProxyError, Result};
use crate::handler::CaptureHandler;

/// Suggested capacity of the event channel between proxy and session.
pub const EVENT_BUFFER: usize = 256;

/// Proxy that reports a login window's traffic to a capture session.
#[derive(Debug, Clone)]
pub struct CaptureProxy {
    ca_manager: CaManager,
    addr: SocketAddr,
}

impl CaptureProxy {
    /// Creates a proxy on a free loopback port using the default CA directory.
    pub fn new() -> Result<Self> {
        Ok(Self::with_ca_manager(CaManager::with_default_dir()?))
    }

    /// Creates a proxy with a specific CA manager.
    pub fn with_ca_manager(ca_manager: CaManager) -> Self {
        Self {
            ca_manager,
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    /// Sets the listen address. Port 0 picks a free port at start.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Returns the configured address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Starts the proxy in the background, reporting traffic for `profile`
    /// to `events`.
    pub fn start(
        self,
        profile: CaptureProfile,
        events: mpsc::Sender<TrafficEvent>,
    ) -> Result<ProxyHandle> {
        let authority = self.ca_manager.ensure_ca()?;
        let listener = bind(self.addr)?;
        let addr = listener.local_addr()?;

        let provider = profile.provider;
        let handler = CaptureHandler::new(profile, events);

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        tracing::info!("Capture proxy for {} listening on {}", provider, addr);

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Capture proxy on {} shutting down", addr);
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

/// Binds the listener the proxy serves on. Port 0 picks a free port, which
/// stays held from here on.
fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

/// Handle for controlling a running proxy.
#[derive(Debug)]
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// The address the proxy listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the proxy to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}
