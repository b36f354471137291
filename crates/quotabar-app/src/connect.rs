//! Interactive capture of usage endpoints.
//!
//! Each provider gets its own proxy, browser window and session. Sessions
//! share nothing but the database they finally write to.

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

use quotabar_core::{run_capture, CaptureOutcome, CaptureProfile, CaptureSession, Provider};
use quotabar_proxy::{BrowserLauncher, CaManager, CaptureProxy, EVENT_BUFFER};
use quotabar_storage::Database;

/// Everything a capture needs besides the provider.
#[derive(Debug, Clone)]
pub struct Connector {
    db: Database,
    browser: BrowserLauncher,
    ca: CaManager,
}

impl Connector {
    /// Creates a connector.
    pub fn new(db: Database, browser: BrowserLauncher, ca: CaManager) -> Self {
        Self { db, browser, ca }
    }

    /// Captures every provider concurrently.
    pub async fn connect_all(&self, providers: &[Provider]) -> Vec<(Provider, CaptureOutcome)> {
        // Generate the CA once up front so concurrent proxies load the same pair.
        if providers.iter().filter(|p| p.uses_capture()).count() > 1 {
            if let Err(e) = self.ca.ensure_ca() {
                warn!("Could not prepare capture CA: {}", e);
            }
        }

        join_all(providers.iter().map(|provider| async move {
            (*provider, self.connect(*provider).await)
        }))
        .await
    }

    /// Opens a login window for `provider` and waits until its usage
    /// endpoint is captured or the window is closed.
    pub async fn connect(&self, provider: Provider) -> CaptureOutcome {
        let Some(profile) = CaptureProfile::for_provider(provider) else {
            return CaptureOutcome::Failed(format!(
                "{} is read from the running desktop app and needs no login",
                provider.display_name()
            ));
        };

        let mut session = CaptureSession::new(profile.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let proxy = match CaptureProxy::with_ca_manager(self.ca.clone())
            .start(profile.clone(), events_tx.clone())
        {
            Ok(proxy) => proxy,
            Err(e) => {
                let reason = e.to_string();
                session.attach_failed(&reason);
                return CaptureOutcome::Failed(reason);
            }
        };

        let mut window = match self
            .browser
            .open(&profile.login_url, proxy.addr(), events_tx)
        {
            Ok(window) => window,
            Err(e) => {
                let reason = e.to_string();
                session.attach_failed(&reason);
                proxy.stop().await;
                return CaptureOutcome::Failed(reason);
            }
        };

        let outcome = run_capture(session, events_rx, &mut window, &self.db).await;
        proxy.stop().await;

        match &outcome {
            CaptureOutcome::Connected(credential) => {
                info!("{} connected via {}", provider, credential.url)
            }
            CaptureOutcome::Aborted => info!("{} login window closed before capture", provider),
            CaptureOutcome::Failed(reason) => warn!("{} capture failed: {}", provider, reason),
        }
        outcome
    }
}
