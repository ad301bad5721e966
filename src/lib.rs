#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(test, deny(warnings))]

//! # janus
//!
//! janus is a fast TCP/HTTP reverse proxy and load balancer core written
//! in and for Rust.
//!
//! ## Overview
//!
//! Clients connect to a configured *frontend*; every accepted connection
//! becomes a [`Stream`](stream::Stream) whose two endpoints are *stream
//! interfaces*. Between them, two directional channels (request and
//! response) shepherd bytes through an ordered chain of *analysers* until
//! both directions are closed, then the transaction is accounted and
//! logged.
//!
//! ## "Low-level"
//!
//! janus is a proxy *core*, meant to be a building block for a complete
//! proxy daemon. The configuration root is built programmatically by the
//! embedding application; TLS termination, the HTTP wire muxes, health
//! checking and the configuration file grammar all live outside this
//! crate and are addressed at their interfaces only.
//!
//! The major subsystems are:
//!
//! - [`stream`]: the per-connection processing engine.
//! - [`proto`]: the HTTP/2 to HTTP/1 message transformer.
//! - [`sample`]: the typed sample-fetch and converter expression engine.
//! - [`peers`]: the stick-table replication protocol.
//! - [`cli`]: the management socket command interpreter.
//! - [`log`]: the access-log format compiler and syslog emitters.

#[doc(no_inline)]
pub use http::{HeaderMap, Method, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};

mod common;
mod error;

pub mod buffer;
pub mod channel;
pub mod cli;
pub mod config;
pub mod log;
pub mod peers;
pub mod proto;
pub mod sample;
pub mod stream;
