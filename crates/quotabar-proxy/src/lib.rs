//! Quotabar Proxy - traffic observation for login windows.
//!
//! A capture runs a loopback MITM proxy and a browser window routed through
//! it. Every exchange the browser makes becomes a
//! [`TrafficEvent`](quotabar_core::TrafficEvent) for the provider's
//! [`CaptureSession`](quotabar_core::CaptureSession).
//!
//! ## Features
//!
//! - Generates a root CA on first run and signs per-host certificates on the fly
//! - Numbers each intercepted request and pairs it with its response
//! - Removes `accept-encoding` so candidate bodies arrive as plain text
//! - Reads bodies only for candidate URLs
//! - Reports the browser exiting as the window closing
//!
//! ## Architecture
//!
//! ```text
//! Browser ──► CaptureProxy ──► provider
//!    │             │
//!    │ exit        │ request / response / body
//!    ▼             ▼
//!      mpsc::Sender<TrafficEvent> ──► run_capture
//! ```

mod browser;
mod ca;
mod error;
mod handler;
mod proxy;

pub use browser::{BrowserLauncher, BrowserWindow};
pub use ca::CaManager;
pub use error::{CaManagerError, ProxyError, Result};
pub use handler::CaptureHandler;
pub use proxy::{CaptureProxy, ProxyHandle, EVENT_BUFFER};
