//! User-mode AQL compute queue engine.
//!
//! This crate manages a single hardware command queue consumed by a GPU compute agent:
//!
//! - allocates the packet ring in a layout compatible with hardware addressing quirks,
//!   including the virtually-doubled ring required on GFX7/8 ([`ring`]);
//! - attaches and detaches the queue to the kernel-mode driver ([`kmd`]);
//! - exposes a lock-free packet submission surface with correct write-index and
//!   doorbell ordering across three doorbell generations ([`doorbell`]);
//! - services the asynchronous fault channels the device raises into the queue's
//!   inactive signal, most importantly dynamic scratch reallocation on insufficient
//!   private-memory faults ([`queue`], [`scratch`]);
//! - applies per-queue compute-unit masks and priority changes.
//!
//! The device-specific and kernel-specific surfaces are traits ([`agent::ComputeAgent`],
//! [`kmd::KernelDriver`]); the test suite drives the engine against mock
//! implementations, including a mock GPU consumer thread.

pub mod agent;
pub mod doorbell;
pub mod error;
pub mod event;
pub mod kmd;
pub mod packet;
pub mod pm4;
pub mod queue;
pub mod record;
pub mod regs;
pub mod ring;
pub mod scratch;
pub mod signal;

pub use agent::{AgentProperties, AllocFlags, ComputeAgent, Profile, ScratchInfo};
pub use doorbell::DoorbellKind;
pub use error::{CuMaskStatus, QueueError};
pub use kmd::{CreateQueueArgs, CreatedQueue, DoorbellMmio, KernelDriver, QueuePriority};
pub use queue::{AqlQueue, QueueConfig, QueueErrorCallback};
pub use record::{QueueProperties, QueueRecord};
pub use signal::{AsyncSignalDispatcher, HandlerDisposition, Signal, SignalCondition, WaitState};
