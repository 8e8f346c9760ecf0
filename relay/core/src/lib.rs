//! Relay Core - Remote Processor Message Relay
//!
//! Bridges a message channel to a remote processor (an rpmsg endpoint) and a
//! local datagram channel addressed by process identity, so that user-space
//! processes can exchange messages with firmware on the remote core.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────┐                    ┌──────────────────────────┐
//! │  Local clients (pid N)  │                    │     Remote processor     │
//! └────────────┬────────────┘                    └─────────────┬────────────┘
//!              │ datagrams                                     │ messages (≤ MTU)
//! ┌────────────▼────────────┐                    ┌─────────────▼────────────┐
//! │      LocalChannel       │                    │      RemoteChannel       │
//! └────────────┬────────────┘                    └─────────────┬────────────┘
//!              │ notify_local                    notify_remote │
//!              └──────────────►  RelayHandle  ◄────────────────┘
//!                                     │
//!                             ┌───────▼────────┐
//!                             │   RelayState   │──► LastMessageBuffer
//!                             │ (client bound) │        │
//!                             └────────────────┘        ▼
//!                                                  PassiveReader
//! ```
//!
//! # Key Types
//!
//! - [`RelayHandle`]: entry point into an established pairing
//! - [`RelayState`]: binding and forwarding policy, owned by the relay task
//! - [`RelayRegistry`]: pairings keyed by remote endpoint name
//! - [`LastMessageBuffer`] / [`PassiveReader`]: the last remote message,
//!   readable by any process
//! - [`RemoteChannel`] / [`LocalChannel`]: transport capabilities
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{RelayConfig, RelayRegistry, channel::{MemoryLocalProvider, MemoryRemoteChannel}};
//!
//! let config = RelayConfig::default();
//! let registry = RelayRegistry::from_config(&config);
//! let provider = MemoryLocalProvider::new();
//!
//! let handle = registry
//!     .establish(&config, Arc::new(MemoryRemoteChannel::new(512)), &provider)
//!     .await?;
//!
//! // ... traffic flows ...
//!
//! registry.teardown(&config.endpoint_name).await;
//! ```
//!
//! # Module Overview
//!
//! - [`buffer`]: last-message buffer
//! - [`channel`]: channel traits, wire framing and implementations
//! - [`config`]: configuration loading (TOML, environment, overrides)
//! - [`error`]: error types
//! - [`reader`]: passive read surface with per-opener cursors
//! - [`registry`]: endpoint registry
//! - [`relay`]: relay state machine and task

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod reader;
pub mod registry;
pub mod relay;

// Re-exports for convenience
pub use buffer::{LastMessageBuffer, ReadChunk, DEFAULT_BUFFER_CAPACITY};
pub use channel::{LocalChannel, LocalChannelProvider, ProcessId, RemoteChannel};
pub use error::{ChannelError, RelayError};
pub use reader::{PassiveReader, ReadCursor};
pub use registry::RelayRegistry;
pub use relay::{establish, ClientBinding, RelayHandle, RelayOutcome, RelayState, RelayStats};

// Config exports
pub use config::{
    default_config_path, default_runtime_dir, load_config, load_config_from_path,
    load_config_with_overrides, ConfigError, ConfigOverrides, ConfigSource, RelayConfig,
};
