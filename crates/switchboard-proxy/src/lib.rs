//! The HTTP adapter: translates `axum` requests/responses to and from
//! `switchboard_runtime::ProxyManager`'s framework-agnostic types. Owns
//! nothing about process lifecycle or scheduling — every decision about
//! what to start, stop or swap lives in `switchboard-runtime`.

#![deny(unsafe_code)]

pub mod models;
pub mod server;

pub use server::serve;
