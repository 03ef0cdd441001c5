//! Atomic view onto the runtime's private per-thread control structure.
//!
//! The runtime does not export this layout; it is derived from the target
//! VM's internal headers and validated empirically per runtime version. Only
//! two words matter to us: the overflow-mark word and the flags word. All
//! other leading fields are opaque padding. If a future runtime build moves
//! either word, only the constants in this module need to change - the
//! checkpoint protocol in `sampler` is layout-agnostic.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

/// Words before the overflow mark in the thread control structure.
const WORDS_BEFORE_OVERFLOW_MARK: usize = 10;
/// Words between the overflow mark and the flags word.
const WORDS_BEFORE_FLAGS: usize = 8;

bitflags! {
    /// The two publicly meaningful bits of the runtime's thread flags word.
    ///
    /// The word carries many more runtime-internal bits; we preserve them by
    /// only ever touching it with fetch-or / fetch-and.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmThreadFlags: usize {
        /// The runtime has already parked this thread for inspection.
        const STOPPED = 0x40;
        /// Someone asked this thread to halt at its next internal check so
        /// its stack can be walked.
        const HALT_FOR_INSPECTION = 0x8000;
    }
}

/// Overlay matching the leading fields of the runtime's per-thread control
/// structure.
///
/// Instances are normally owned by the runtime and only ever viewed through
/// [`VmThreadRef`]; the constructors exist so that runtime bindings and tests
/// can fabricate control blocks.
#[repr(C)]
pub struct VmThreadControl {
    _leading: [usize; WORDS_BEFORE_OVERFLOW_MARK],
    overflow_mark: AtomicUsize,
    _middle: [usize; WORDS_BEFORE_FLAGS],
    flags: AtomicUsize,
}

impl VmThreadControl {
    pub const fn new() -> Self {
        Self::with_flags(VmThreadFlags::empty())
    }

    pub const fn with_flags(flags: VmThreadFlags) -> Self {
        VmThreadControl {
            _leading: [0; WORDS_BEFORE_OVERFLOW_MARK],
            overflow_mark: AtomicUsize::new(0),
            _middle: [0; WORDS_BEFORE_FLAGS],
            flags: AtomicUsize::new(flags.bits()),
        }
    }

    pub fn flags(&self) -> VmThreadFlags {
        VmThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn overflow_mark(&self) -> usize {
        self.overflow_mark.load(Ordering::Acquire)
    }
}

impl Default for VmThreadControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-null reference to a runtime thread's control block.
///
/// This is the "thread identity" that flows through the whole coordinator:
/// producers pass their own, the collector publishes its own, and the raw
/// address doubles as the match key on the request pipe.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct VmThreadRef(NonNull<VmThreadControl>);

// The pointee is runtime-owned shared memory which we only access atomically.
unsafe impl Send for VmThreadRef {}
unsafe impl Sync for VmThreadRef {}

impl VmThreadRef {
    /// Wraps the raw control-block pointer the runtime hands out.
    ///
    /// # Safety
    ///
    /// `ptr` must either be null or point to a live thread control structure
    /// with the layout of [`VmThreadControl`], and stay valid for as long as
    /// the returned reference is used.
    pub unsafe fn from_raw(ptr: *mut VmThreadControl) -> Option<VmThreadRef> {
        NonNull::new(ptr).map(VmThreadRef)
    }

    /// The control-block address, used as wire identity and for the
    /// collector's self-recognition.
    pub fn raw_id(&self) -> usize {
        self.0.as_ptr() as usize
    }

    fn control(&self) -> &VmThreadControl {
        unsafe { self.0.as_ref() }
    }

    /// Atomically sets the halt-for-inspection bit and returns the flags as
    /// they were before. A prior value with the bit already set means
    /// another request is in flight for this thread.
    pub fn test_and_set_halt(&self) -> VmThreadFlags {
        let prior = self
            .control()
            .flags
            .fetch_or(VmThreadFlags::HALT_FOR_INSPECTION.bits(), Ordering::AcqRel);
        VmThreadFlags::from_bits_truncate(prior)
    }

    /// Rolls the halt-for-inspection bit back, leaving all other bits alone.
    pub fn clear_halt(&self) {
        self.control()
            .flags
            .fetch_and(!VmThreadFlags::HALT_FOR_INSPECTION.bits(), Ordering::AcqRel);
    }

    /// Forces the thread's overflow mark to the sentinel value, so the
    /// runtime notices an overflow condition at the thread's next internal
    /// check and halts it for inspection.
    pub fn arm_overflow_mark(&self) {
        self.control()
            .overflow_mark
            .store(usize::MAX, Ordering::Release);
    }

    pub fn flags(&self) -> VmThreadFlags {
        self.control().flags()
    }
}
