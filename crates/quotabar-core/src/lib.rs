//! Quotabar Core - usage extraction, endpoint capture, and local discovery.
//!
//! This crate holds the provider-independent logic of Quotabar:
//!
//! - [`extractor`]: turns an undocumented usage response into normalized
//!   [`UsageMetric`]s.
//! - [`capture`]: decides which response observed in a login window is the
//!   usage endpoint and yields an [`EndpointCredential`].
//! - [`discovery`]: finds the private local API of a sibling desktop
//!   process and reads quota from it.

pub mod capture;
pub mod credential;
pub mod discovery;
pub mod error;
pub mod extractor;
pub mod metric;
pub mod notifications;
pub mod provider;

pub use capture::{
    run_capture, CaptureOutcome, CaptureProfile, CaptureSession, CaptureState, CaptureStep,
    LoginWindow, TrafficEvent,
};
pub use credential::{CredentialStore, EndpointCredential, COOKIE_HEADER};
pub use discovery::{
    DiscoveredEndpoint, Discovery, EndpointDiscovery, LocalStatusClient, LocalUsage, Scheme,
};
pub use error::{CoreError, Result};
pub use extractor::{extract, extract_at};
pub use metric::{format_reset, labels, ExtractionResult, UsageLevel, UsageMetric};
pub use notifications::{AlertSettings, HighUsageAlerts, NotificationResult};
pub use provider::Provider;
