//! Async driver that feeds a [`CaptureSession`] from a traffic channel.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use super::session::{CaptureSession, CaptureState, CaptureStep, TrafficEvent};
use crate::credential::{CredentialStore, EndpointCredential};

/// The login window a capture is observing.
#[async_trait]
pub trait LoginWindow: Send {
    /// Closes the window. Called once after a credential is stored.
    async fn close(&mut self);
}

/// How a capture ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A credential was captured and stored.
    Connected(EndpointCredential),
    /// The user closed the window first.
    Aborted,
    /// Observation never attached, or the credential could not be stored.
    Failed(String),
}

impl CaptureOutcome {
    /// Returns true if a credential was stored.
    pub fn is_connected(&self) -> bool {
        matches!(self, CaptureOutcome::Connected(_))
    }
}

/// Runs a capture session to completion.
///
/// Events are applied in arrival order. Events already queued are drained
/// before the fallback timer is considered, and a closed channel counts as
/// the window closing.
pub async fn run_capture<W>(
    mut session: CaptureSession,
    mut events: mpsc::Receiver<TrafficEvent>,
    window: &mut W,
    store: &dyn CredentialStore,
) -> CaptureOutcome
where
    W: LoginWindow + ?Sized,
{
    if session.state() == CaptureState::Failed {
        return CaptureOutcome::Failed("traffic observation did not attach".to_string());
    }
    session.observe();

    let provider = session.provider();
    info!("Capturing {} usage endpoint", provider);

    loop {
        let deadline = session.pending_deadline();

        let step = tokio::select! {
            biased;

            event = events.recv() => {
                let event = event.unwrap_or(TrafficEvent::WindowClosed);
                session.handle(event, Instant::now())
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                session.fire_fallback(Instant::now())
            }
        };

        match step {
            CaptureStep::Completed(credential) => {
                if let Err(e) = store.set(provider, &credential) {
                    error!("Failed to store {} credential: {}", provider, e);
                    window.close().await;
                    return CaptureOutcome::Failed(e.to_string());
                }
                window.close().await;
                info!("{} connected via {}", provider, credential.url);
                return CaptureOutcome::Connected(credential);
            }
            CaptureStep::Aborted => {
                warn!("{} capture aborted", provider);
                return CaptureOutcome::Aborted;
            }
            CaptureStep::FallbackArmed { .. } | CaptureStep::Scored { .. } | CaptureStep::Ignored => {}
        }
    }
}
