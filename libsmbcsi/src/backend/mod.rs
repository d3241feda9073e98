//! Storage backend implementations.
//!
//! Each backend module provides concrete types that implement
//! [`CsiIdentity`](crate::CsiIdentity), [`CsiController`](crate::CsiController)
//! and [`CsiNode`](crate::CsiNode).

pub mod smb;
