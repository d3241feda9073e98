//! # libsmbcsi: SMB/CIFS volumes for RK8s over QUIC
//!
//! `libsmbcsi` implements a [Container Storage Interface][csi] plugin whose
//! volumes are directories inside SMB/CIFS network shares.  It speaks the
//! same lightweight CSI-over-QUIC protocol as the rest of RK8s (via
//! [`quinn`]) and follows the RK8s architecture conventions (Tokio async
//! runtime, `tracing` for observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Data model: `Volume`, `Snapshot`, share sources, requests. |
//! | [`error`] | [`CsiError`] and its status [`Code`](error::Code)s. |
//! | [`config`] | [`DriverConfig`](config::DriverConfig) and the state-dir layout. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: volume and snapshot lifecycle. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`registry`] | Durable volume / snapshot records. |
//! | [`mounter`] | Share and bind mounts (real and fake). |
//! | [`archiver`] | tar.gz snapshot archives. |
//! | [`health`] | Volume condition probe. |
//! | [`transport`] | QUIC server built on `quinn`. |
//! | [`backend`] | The SMB implementation of the three services. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod archiver;
pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod identity;
pub mod message;
pub mod mounter;
pub mod node;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use config::{DriverConfig, Mode};
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
