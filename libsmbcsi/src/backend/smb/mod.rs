//! SMB/CIFS backend.
//!
//! Volumes are directories inside an SMB share (or a local export).  The
//! controller provisions, clones and snapshots those directories through its
//! own temporary mounts of the share; each node mounts the share once at a
//! staging path and bind-mounts it into every workload that uses the volume.

mod controller;
mod identity;
mod inflight;
mod node;
mod pagination;
mod share;

pub use controller::SmbController;
pub use identity::SmbIdentity;
pub use inflight::{OperationGuard, OperationLocks};
pub use node::SmbNode;
pub use pagination::paginate;
pub use share::{ShareLease, ShareTable};
