//! Credential resolution for outbound CRM calls
//!
//! Sits between inbound requests and the downstream CRM API. Callers hand an
//! `InboundRequest` to `AuthResolver::resolve()`, get back an `AuthContext`,
//! and turn it into a ready request with `build_request()`. Nothing outside
//! this crate reads Installation records on the request path.
//!
//! Resolution order:
//! 1. Signed assertion → company Installation (delegated mode)
//! 2. Expired Installation → single-flight refresh via `TokenRefresher`
//! 3. Configured shared API token (shared mode)
//! 4. `Error::Unauthenticated`

pub mod error;
pub mod refresher;
pub mod request;
pub mod resolver;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use refresher::TokenRefresher;
pub use request::{PreparedRequest, build_request};
pub use resolver::{AuthContext, AuthMode, AuthResolver, SharedCredential};
