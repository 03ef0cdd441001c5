//! Cooperative cross-thread stack sampling for managed runtimes which cannot
//! be unwound from an asynchronous interruption context.
//!
//! Some runtimes do not provide a stack walker that is safe to call while
//! another thread is stopped at an arbitrary instruction. On those runtimes,
//! sampling has to be cooperative: when a thread is interrupted (for example
//! by a timer signal), it does not walk its own stack. Instead it posts a
//! small request and resumes, and a dedicated collector thread later asks the
//! runtime to walk the stack at a point where the runtime considers that safe.
//!
//! The pieces fit together like this:
//!
//!  - [`CheckpointHandle::request_capture`] is the producer side. It is
//!    callable from an asynchronous interruption of the calling thread: it
//!    performs one atomic test-and-set on the target thread's control word
//!    (deduplicating concurrent requests for the same thread), arms the
//!    runtime's overflow mark so the thread halts itself at its next internal
//!    check, and posts a fixed-size request record with a single non-blocking
//!    pipe write. It never allocates or locks.
//!  - The collector thread, owned by [`CooperativeSampler`], blocks on the
//!    pipe, matches each batch of requests against the runtime's live
//!    threads, captures native frames where configured, runs the runtime's
//!    extended stack query, and hands the merged native + managed stack to a
//!    [`SampleSink`].
//!  - The runtime, the native unwinder and the sink are reached through the
//!    [`RuntimeAccess`], [`NativeStackSource`] and [`SampleSink`] traits, so
//!    the coordinator itself stays free of any particular VM binding.
//!
//! Sampling is best-effort by design: a full pipe or a failed stack query
//! drops that one sample and rolls the thread's flags back. It never blocks
//! a producer and never leaves a thread with a stale halt request.

mod collector;
mod error;
mod frames;
mod request;
mod runtime;
mod sampler;
mod vm_thread;

pub use crate::error::{RuntimeError, SetupError};
pub use crate::frames::{
    CallFrame, FrameBuffer, FrameKind, MethodId, VmFrame, MAX_NATIVE_FRAMES, RESERVED_FRAMES,
};
pub use crate::runtime::{
    NativeStackMode, NativeStackSource, RuntimeAccess, RuntimeThread, SampleSink, SamplerConfig,
    StackWalkFlavor,
};
pub use crate::sampler::{CheckpointHandle, CooperativeSampler};
pub use crate::vm_thread::{VmThreadControl, VmThreadFlags, VmThreadRef};
