//! Deduplicated, rate-limited alert delivery for indexing deployments.
//!
//! The engine keeps no database. Every cycle it re-reads the Discord channel it
//! posts to, parses its own earlier alerts back into an [`AlertIndex`], and only
//! announces findings that are not already there.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use deployment_alerts::{AlertEngine, DiscordClient, EngineConfig, TokioDelay};
//!
//! # async fn run(findings: Vec<deployment_alerts::DeploymentFindings>) -> anyhow::Result<()> {
//! let config = EngineConfig::default();
//! let token = config.discord_token.clone().unwrap_or_default();
//! let client = DiscordClient::new(&token, &config.api_base)?;
//!
//! let mut engine = AlertEngine::new(Arc::new(client), Arc::new(TokioDelay), &config)?;
//! let report = engine.run_cycle(&findings, chrono::Utc::now()).await;
//! println!("delivered {} alerts", report.delivered);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`HistoryPaginator`] walks channel history newest first
//! - [`reconstruct`] parses earlier alerts into per-channel state
//! - [`compose`] diffs fresh findings against that state
//! - [`Dispatcher`] sends in paced batches and resends throttled messages
//! - [`ThreadManager`] keeps one thread per protocol and prunes old alerts
//! - [`AggregateReconciler`] mirrors production failures into a summary channel

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod aggregate;
pub mod compose;
pub mod config;
pub mod delay;
pub mod discord;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod findings;
pub mod format;
pub mod history;
pub mod issues;
pub mod reconstruct;
pub mod threads;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use aggregate::{AggregateBuffer, AggregateReconciler, FlushReport};
pub use compose::{compose, ComposeOptions, ComposedAlerts};
pub use config::EngineConfig;
pub use delay::{Delay, NoDelay, TokioDelay};
pub use discord::{ChannelMessage, ChatApi, DiscordClient, Embed, EmbedField, MessagePayload};
pub use dispatch::{DispatchConfig, Dispatcher, OutboundMessage, RetryUnit};
pub use engine::{AlertEngine, CycleReport};
pub use error::ChatError;
pub use findings::{DeploymentFindings, Finding, IssueLevel};
pub use history::{HistoryPaginator, PaginationConfig};
pub use issues::{GitHubIssueTracker, IssueTracker};
pub use reconstruct::{reconstruct, AlertIndex, ChannelAlertState, SuppressionMode};
pub use threads::{PruneReport, ThreadManager};
pub use webhook::{AlertSink, WebhookForwarder};
