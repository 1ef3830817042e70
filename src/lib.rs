//! Caching, rate-limiting reverse proxy in front of a third-party XML API.
//!
//! Many small client applications on one host point at this proxy instead of
//! the upstream. The proxy collapses duplicate traffic through a shared
//! response cache, obeys the upstream's embedded cache directives, throttles
//! request and error rates, repairs a couple of known upstream bugs, and
//! honors upstream temp-bans by serving synthetic responses.

pub mod apicache;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod ratelimit;
pub mod shared;

pub use shared::error::{AppError, AppResult};
