//! Pieces pertaining to HTTP message transformation.
//!
//! The proxy speaks HTTP/1 internally; HTTP/2 header blocks coming out of
//! the (out-of-scope) H2 mux are turned into HTTP/1.1 messages or into
//! structured [`htx`] containers by the [`h2`] transformer.

pub mod h2;
pub mod htx;
