//! HTTP middleware stack.
//!
//! - [`trace`]: per-request span carrying an `x-trace-id`.
//! - [`cors`]: CORS layer built from `PARLEY_CORS_ORIGINS`.

pub mod cors;
pub mod trace;
