//! Endpoint capture.
//!
//! A login window is opened with its traffic routed through an observation
//! facility. Each observed exchange is turned into a [`TrafficEvent`] and
//! fed to a [`CaptureSession`], which scores candidate responses against the
//! provider's [`CaptureProfile`] and eventually yields the
//! [`EndpointCredential`](crate::credential::EndpointCredential) used for
//! background polling.

mod driver;
mod profile;
mod session;

pub use driver::{run_capture, CaptureOutcome, LoginWindow};
pub use profile::{
    CaptureProfile, ScoreRule, Signal, DEFAULT_ACCEPT_THRESHOLD, DEFAULT_FALLBACK_DELAY,
};
pub use session::{
    CaptureCandidate, CaptureSession, CaptureState, CaptureStep, RequestId, TrafficEvent,
};
