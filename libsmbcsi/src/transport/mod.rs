//! QUIC transport layer for CSI messages.
//!
//! [`CsiServer`] accepts [`CsiMessage`](crate::CsiMessage) requests over QUIC
//! bi-directional streams using `quinn` and answers them through
//! [`CsiServices`].

pub mod server;

pub use server::{CsiServer, CsiServices, MAX_MESSAGE_BYTES};
