//! # Authentication Module
//!
//! Credential and token lifecycle for the Alipan open platform.
//!
//! ## Overview
//!
//! A client picks one credential strategy at construction:
//!
//! - **PKCE**: self-contained, per-instance verifier, no refresh
//! - **Shared secret**: refresh via the stored refresh token
//! - **Delegated**: a host [`TokenServer`] builds or performs the exchange
//!
//! The [`AuthManager`] drives the browser and QR-code authorization flows and
//! emits auth events. Every API request goes through an
//! [`AuthorizedHttpClient`], whose [`TokenAuthenticator`] turns a 401 into at
//! most one shared refresh no matter how many requests failed at once.
//!
//! ## Features
//!
//! - Token persistence per strategy namespace and user identifier
//! - Single-flight refresh with a bounded retry budget
//! - QR-code authorization with change-only status notifications
//! - Tokens, codes and secrets are never logged

pub mod authenticator;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod oauth;
pub mod qrcode;
pub mod token_store;
pub mod types;

pub use authenticator::{AuthorizedHttpClient, TokenAuthenticator, MAX_AUTH_RETRIES};
pub use credentials::{CredentialStrategy, Credentials, TokenServer};
pub use error::{AuthError, Result};
pub use manager::AuthManager;
pub use oauth::{OAuthEndpoint, PkceVerifier};
pub use qrcode::{QrCodeAuthTask, QrCodeSession, QrCodeStatus, QrObserverId};
pub use token_store::TokenStore;
pub use types::{AuthModel, AuthorizeOutcome, TokenRequest, TokenResponse};
