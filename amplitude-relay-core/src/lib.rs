//! # amplitude-relay-core
//!
//! Core library for amplitude-relay - forwards application analytics events
//! to Amplitude.
//!
//! This library provides:
//! - The [`EventRelay`], which owns the live sink and forwards events to it
//! - Secure storage for the single Amplitude API key
//! - An Amplitude HTTP sink plus a recording sink for tests
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use amplitude_relay_core::credentials::FileCredentialStore;
//! use amplitude_relay_core::sink::AmplitudeSinkFactory;
//! use amplitude_relay_core::{AnalyticsEvent, Config, EventRelay};
//!
//! let config = Config::load().expect("failed to load config");
//! let store = FileCredentialStore::new(config.credentials.store_path());
//! let factory = AmplitudeSinkFactory::new(config.amplitude.clone()).expect("invalid config");
//!
//! let relay = EventRelay::with_service(Arc::new(store), Arc::new(factory), config.credentials.service);
//! relay.configure(Some("ABC123"));
//! relay.record_event(&AnalyticsEvent::new("Loop success").unwrap().out_of_session(true));
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use relay::{EventRelay, LifecycleListener};
pub use types::*;

// Public modules
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod relay;
pub mod sink;
pub mod types;
