//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the Alipan SDK:
//! - Logging and tracing infrastructure
//! - Client configuration
//! - Event bus for auth and transfer notifications
//! - Serialized callback context for observers
//! - API URL resolution
//!
//! ## Overview
//!
//! Every other `core-*` crate depends on this one. It fixes the logging
//! conventions, the fail-fast configuration rules and the single thread on
//! which observer callbacks run.

pub mod api_url;
pub mod callback;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use api_url::ApiBase;
pub use callback::CallbackContext;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use events::{AuthEvent, CoreEvent, EventBus, TransferEvent, TransferKind};
