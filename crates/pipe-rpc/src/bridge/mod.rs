//! Wire layer shared by the registry and its workers.
//!
//! # Architecture
//!
//! - **protocol**: the envelope, its identifiers and the control payloads
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: name-addressed local channels (abstract sockets, named pipes)

pub mod codec;
pub mod protocol;
pub mod transport;
