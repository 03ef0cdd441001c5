//! Frame model and the native/managed frame merger.

/// Upper bound on native frames contributed to one merged stack.
pub const MAX_NATIVE_FRAMES: usize = 128;
/// Extra slots kept free for bookkeeping frames added by downstream
/// consumers, so a maximally deep stack still fits.
pub const RESERVED_FRAMES: usize = 4;

const KIND_SHIFT: i32 = 24;
const LOCATION_MASK: i32 = 0x00ff_ffff;

/// Opaque method identity: the runtime's method id for managed frames, or a
/// synthetic id minted by the native symbol resolver for native frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MethodId(pub usize);

/// What kind of code a frame belongs to. Encoded into the top byte of a
/// [`CallFrame`]'s tagged location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum FrameKind {
    Interpreted = 0,
    Compiled = 1,
    Inlined = 2,
    Native = 3,
}

/// One frame of a merged call stack: a method identity plus the frame kind
/// and bytecode location packed into a single tagged word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallFrame {
    method: MethodId,
    tagged_location: i32,
}

impl CallFrame {
    pub fn managed(method: MethodId, kind: FrameKind, location: i32) -> CallFrame {
        CallFrame {
            method,
            tagged_location: ((kind as i32) << KIND_SHIFT) | (location & LOCATION_MASK),
        }
    }

    pub fn native(method: MethodId) -> CallFrame {
        CallFrame {
            method,
            tagged_location: (FrameKind::Native as i32) << KIND_SHIFT,
        }
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn kind(&self) -> FrameKind {
        match self.tagged_location >> KIND_SHIFT {
            1 => FrameKind::Compiled,
            2 => FrameKind::Inlined,
            3 => FrameKind::Native,
            _ => FrameKind::Interpreted,
        }
    }

    /// Bytecode index for managed frames; 0 for native frames.
    pub fn location(&self) -> i32 {
        self.tagged_location & LOCATION_MASK
    }

    pub fn is_native(&self) -> bool {
        self.kind() == FrameKind::Native
    }
}

/// One frame as the runtime's extended stack query reports it.
///
/// Only `method`, `location` and `kind` feed the merge; the compiled-code
/// location and native frame address are carried because that is the shape
/// of the runtime's record, and bindings may want them.
#[derive(Clone, Copy, Debug)]
pub struct VmFrame {
    pub method: MethodId,
    /// Bytecode index of the frame's current location.
    pub location: i32,
    /// Location within the compiled code, where applicable.
    pub machine_pc: i64,
    pub kind: FrameKind,
    /// Address of the native stack frame backing this managed frame, if the
    /// runtime reports one.
    pub native_frame_address: usize,
}

impl VmFrame {
    /// Convenience for bindings that only have the three merged fields.
    pub fn new(method: MethodId, kind: FrameKind, location: i32) -> VmFrame {
        VmFrame {
            method,
            location,
            machine_pc: 0,
            kind,
            native_frame_address: 0,
        }
    }
}

/// Collector-local scratch buffer holding one merged stack at a time.
///
/// Capacity is fixed at construction; each source's contribution is bounded
/// before it is appended, so the buffer never reallocates and never
/// truncates after the fact. Native frames always precede managed frames.
pub struct FrameBuffer {
    frames: Vec<CallFrame>,
    max_managed: usize,
    max_native: usize,
    native_len: usize,
    managed_len: usize,
}

impl FrameBuffer {
    pub fn with_limits(max_managed: usize, max_native: usize) -> FrameBuffer {
        FrameBuffer {
            frames: Vec::with_capacity(max_managed + max_native + RESERVED_FRAMES),
            max_managed,
            max_native,
            native_len: 0,
            managed_len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.native_len = 0;
        self.managed_len = 0;
    }

    /// Appends one native frame. Returns false once the native share of the
    /// buffer is used up.
    pub fn push_native(&mut self, method: MethodId) -> bool {
        debug_assert_eq!(self.managed_len, 0, "native frames precede managed frames");
        if self.native_len == self.max_native {
            return false;
        }
        self.frames.push(CallFrame::native(method));
        self.native_len += 1;
        true
    }

    /// Appends managed frames in the order the runtime returned them,
    /// bounded to the managed share of the buffer.
    pub fn extend_managed<'a>(&mut self, frames: impl IntoIterator<Item = &'a VmFrame>) {
        let room = self.max_managed - self.managed_len;
        for frame in frames.into_iter().take(room) {
            self.frames
                .push(CallFrame::managed(frame.method, frame.kind, frame.location));
            self.managed_len += 1;
        }
    }

    pub fn as_slice(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
