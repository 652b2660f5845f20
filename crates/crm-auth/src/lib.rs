//! CRM credential and installation library
//!
//! Verifies inbound signed assertions, exchanges and refreshes OAuth tokens,
//! and keeps the per-company Installation records on disk. This crate has no
//! dependency on the gateway binary and no notion of request routing.
//!
//! Installation flow:
//! 1. Admin opens `token::TokenClient::authorization_url()`
//! 2. Provider redirects back with a code
//! 3. `handshake::complete_installation()` exchanges the code, looks up the
//!    company behind the token and stores it via `InstallationStore::put()`
//! 4. Inbound requests carry a signed assertion checked by
//!    `assertion::AssertionVerifier`
//! 5. Expired access tokens are renewed with `token::TokenClient::refresh_token()`

pub mod assertion;
pub mod constants;
pub mod error;
pub mod handshake;
pub mod identifiers;
pub mod installations;
pub mod token;

#[cfg(test)]
mod test_support;

pub use assertion::{
    AssertionTransport, AssertionVerifier, Claims, InboundRequest, extract_assertion,
};
pub use constants::*;
pub use error::{Error, Result};
pub use handshake::{Identity, complete_installation, fetch_identity};
pub use installations::{CompareAndSwapOutcome, Installation, InstallationStore, now_millis};
pub use token::{OAuthClientConfig, TokenClient, TokenResponse};
