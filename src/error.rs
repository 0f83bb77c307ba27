//! Client-facing error kinds.
//!
//! Construction-time failures surface as `Err(QueueError)` from [`crate::AqlQueue::create`].
//! Runtime faults (scratch exhaustion promoted to an error, hardware exceptions) surface
//! through the errors callback registered at construction; the queue is suspended before
//! the callback fires.

use thiserror::Error;

/// Error kinds reported by the queue engine, either as `Result` errors from the
/// construction/tuning surface or as the first argument of the errors callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Queue creation parameters were rejected (e.g. non-power-of-two packet capacity).
    #[error("invalid queue creation parameters")]
    InvalidQueueCreation,
    /// The kernel driver or an allocator refused a resource request.
    #[error("out of resources")]
    OutOfResources,
    /// The operation is not valid in the queue's current state (e.g. priority change
    /// while suspended).
    #[error("invalid queue state")]
    InvalidQueue,
    /// Dispatch dimensions are malformed.
    #[error("incompatible dispatch arguments")]
    IncompatibleArguments,
    /// Group segment allocation is invalid for the dispatch.
    #[error("invalid group memory allocation")]
    InvalidAllocation,
    /// The dispatched code object is invalid or null.
    #[error("invalid code object")]
    InvalidCodeObject,
    /// The packet at the read index is malformed (generic or vendor-specific).
    #[error("invalid packet format")]
    InvalidPacketFormat,
    /// Workgroup exceeds hardware limits.
    #[error("invalid dispatch argument")]
    InvalidArgument,
    /// The kernel requests more registers than the ISA provides.
    #[error("register demand exceeds ISA limits")]
    InvalidIsa,
    /// Memory access outside the 48-bit aperture.
    #[error("memory aperture violation")]
    MemoryApertureViolation,
    /// A wave executed an illegal instruction.
    #[error("illegal instruction")]
    IllegalInstruction,
    /// A wave faulted on a memory access.
    #[error("memory fault")]
    MemoryFault,
    /// Wave abort, trap, or math error.
    #[error("hardware exception")]
    Exception,
    /// Unclassified queue error.
    #[error("queue error")]
    Error,
}

/// Outcome of [`crate::AqlQueue::set_cu_masking`].
///
/// `Reduced` is a warning, not an error: the mask has been applied, but bits the caller
/// requested were removed by the process-global mask or the physical CU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuMaskStatus {
    Applied,
    Reduced,
}
