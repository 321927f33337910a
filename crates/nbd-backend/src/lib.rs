//! The back-end handler contract every pluggable NBD back end satisfies,
//! plus the registry that maps a handshake's back-end name to a factory.

mod descriptor;
mod handler;
mod registry;

pub use descriptor::{DescriptorError, ExportDescriptor, MAX_HANDSHAKE_BYTES};
pub use handler::{completion_channel, Completion, CompletionSink, Handler, Outcome, EINVAL, EIO, EPERM};
pub use registry::{BackendFactory, Registry, RegistryEntry};
