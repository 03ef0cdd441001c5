//! Traits for the external collaborators the coordinator calls into, plus
//! the sampler's configuration.
//!
//! The coordinator never talks to a concrete VM. A runtime binding
//! implements [`RuntimeAccess`]; the native unwinding / symbolication side
//! implements [`NativeStackSource`]; whatever aggregates samples implements
//! [`SampleSink`].

use bitflags::bitflags;

use crate::error::RuntimeError;
use crate::frames::{CallFrame, FrameBuffer, MethodId, VmFrame};
use crate::vm_thread::VmThreadRef;

bitflags! {
    /// Frame-detail selection for the extended stack query.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StackWalkFlavor: u32 {
        /// Report frames of compiled methods individually.
        const COMPILED_FRAMES = 4;
        /// Report frames that were inlined into their caller.
        const INLINED_FRAMES = 8;
    }
}

/// Opaque handle to a live runtime thread, valid for the duration of one
/// enumeration round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RuntimeThread(pub usize);

/// Access to the managed runtime.
///
/// All methods are called from the collector thread only, with the collector
/// attached to the runtime, except where noted.
pub trait RuntimeAccess: Send + Sync {
    /// Registers the calling thread with the runtime as a hidden internal
    /// thread and returns its control-block reference.
    fn attach_thread(&self, name: &str) -> Result<VmThreadRef, RuntimeError>;

    /// Detaches the calling thread again. Last runtime call the collector
    /// makes.
    fn detach_thread(&self);

    /// Snapshot of all currently live runtime threads. Failure is fatal to
    /// the collector loop: without enumeration there is nothing to match
    /// requests against.
    fn live_threads(&self) -> Result<Vec<RuntimeThread>, RuntimeError>;

    /// The control-block view of a thread, or None if the thread has no
    /// backing VM thread (it may have exited since enumeration).
    fn vm_thread(&self, thread: RuntimeThread) -> Option<VmThreadRef>;

    /// The OS-level thread id backing a runtime thread.
    fn os_thread_id(&self, thread: RuntimeThread) -> i32;

    /// The runtime's extended stack walk: fills `out` with up to `max_depth`
    /// frames for `thread`, including the compiled / inlined detail selected
    /// by `flavor`.
    fn stack_trace_extended(
        &self,
        thread: RuntimeThread,
        flavor: StackWalkFlavor,
        max_depth: usize,
        out: &mut Vec<VmFrame>,
    ) -> Result<(), RuntimeError>;

    /// Opens a local-reference scope before an enumeration round. Runtimes
    /// without local-reference bookkeeping leave this as the default no-op.
    fn push_local_frame(&self, _capacity: usize) {}

    /// Closes the scope opened by [`push_local_frame`](Self::push_local_frame).
    fn pop_local_frame(&self) {}
}

/// The native (non-managed) side of a sample: symbol resolution, full
/// unwinds, and the per-thread bookkeeping of the event source that drives
/// sampling.
pub trait NativeStackSource: Send + Sync {
    /// Resolves a captured program counter to a synthetic native method, if
    /// the pc falls into a known native code range.
    fn resolve_native_method(&self, pc: usize) -> Option<MethodId>;

    /// Walks the native stack of the given OS thread, appending native
    /// frames to `frames`.
    fn native_trace(&self, tid: i32, frames: &mut FrameBuffer);

    /// Clears the event source's per-thread sampling bookkeeping for the OS
    /// thread whose sample is about to be recorded.
    fn reset_thread(&self, tid: i32);
}

/// Receives finished samples. Assumed non-blocking and infallible; whatever
/// aggregation or output happens behind it is not this crate's concern.
pub trait SampleSink: Send + Sync {
    /// One merged stack for the OS thread `tid`, with the sample weight the
    /// producer supplied at checkpoint time. Native frames, if any, come
    /// first.
    fn record_sample(&self, weight: u64, tid: i32, frames: &[CallFrame]);
}

/// How native frames are captured for a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NativeStackMode {
    /// Managed frames only.
    #[default]
    Disabled,
    /// Cheap: resolve the single program counter captured at interruption
    /// time. Falls back to a full unwind for requests without a pc.
    InstructionPointer,
    /// Walk the whole native stack of the sampled thread.
    FullUnwind,
}

#[derive(Clone, Copy, Debug)]
pub struct SamplerConfig {
    /// Maximum managed stack depth requested from the runtime.
    pub max_stack_depth: usize,
    pub native_stack: NativeStackMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            max_stack_depth: 2048,
            native_stack: NativeStackMode::Disabled,
        }
    }
}
