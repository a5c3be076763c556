//! Signed-in session and authenticated requests for the warehouse dashboard
//!
//! `AuthSession` owns the credential lifecycle: restore on start, OAuth
//! sign-in, proactive and on-demand refresh, logout. `AuthenticatedClient`
//! sends backend requests with the current credential and recovers from
//! 401s through the session.
//!
//! Recovery rules:
//! 1. Any number of concurrent 401s trigger exactly one refresh
//! 2. Requests waiting on that refresh replay in the order they failed
//! 3. A failed refresh rejects every waiter with the same error, then ends
//!    the session

pub mod client;
pub mod refresh;
pub mod request;
pub mod session;

#[cfg(test)]
mod testing;

pub use client::AuthenticatedClient;
pub use refresh::{RefreshTrigger, refresh_delay};
pub use request::{ApiRequest, ApiResponse, REQUEST_ID_HEADER};
pub use session::{AuthSession, AuthState, CallbackParams, Notifier};
