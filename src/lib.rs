#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! rptmond library — exposes core modules for use by the `rptmond` binary.
//!
//! This library re-exports the key building blocks:
//! - `ami` — AMI connector, wire-protocol parsers, text-node ID registry
//! - `keying` — per-local-node jitter-compensated keying tracker
//! - `state` — authoritative NodeState/LinksDetailed manager
//! - `poller` — periodic XStat/SawStat collection
//! - `ws` — WebSocket subscriber hub
//! - `collaborators` — narrow traits for the out-of-scope external systems
//! - `config` — configuration loading
//! - `auth` — subscriber token validation helpers

pub mod ami;
pub mod auth;
pub mod collaborators;
pub mod config;
pub mod keying;
pub mod poller;
pub mod state;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use ami::connector::AmiConnector;
pub use collaborators::{LinkStatsStore, NodeDirectory, SubscriberValidator};
pub use config::Config;
pub use keying::KeyingTracker;
pub use state::StateManager;
pub use ws::WebSocketHub;
