//! # slotsync-notifier
//!
//! Renders [`CycleSummary`](slotsync_core::CycleSummary) values with Tera
//! and delivers them through the [`Notifier`] boundary: a JSON webhook when
//! one is configured, the log otherwise.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use slotsync_core::Config;
//! use slotsync_notifier::notifier_from_config;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn report(config: &Config, summary: &slotsync_core::CycleSummary) {
//!     if let Ok(notifier) = notifier_from_config(config) {
//!         if let Err(err) = notifier.send(summary, &CancellationToken::new()).await {
//!             tracing::warn!(error = %err, "summary notification failed");
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod notifier;

pub use context::SummaryContext;
pub use engine::{RenderedSummary, SummaryRenderer};
pub use error::RenderError;
pub use notifier::{notifier_from_config, LogNotifier, Notifier, WebhookNotifier, WebhookPayload};
