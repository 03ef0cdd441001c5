//! End-to-end tests of the sampling coordinator against a mock runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use stackrelay::{
    CallFrame, CooperativeSampler, FrameBuffer, FrameKind, MethodId, NativeStackMode,
    NativeStackSource, RuntimeAccess, RuntimeError, RuntimeThread, SampleSink, SamplerConfig,
    SetupError, StackWalkFlavor, VmFrame, VmThreadControl, VmThreadFlags, VmThreadRef,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Long enough for the collector to have acted if it was going to.
const SILENCE_TIMEOUT: Duration = Duration::from_millis(300);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn control_ref(control: &VmThreadControl) -> VmThreadRef {
    let ptr = control as *const VmThreadControl as *mut VmThreadControl;
    unsafe { VmThreadRef::from_raw(ptr) }.unwrap()
}

struct MockThread {
    control: Box<VmThreadControl>,
    tid: i32,
    frames: Vec<VmFrame>,
    fail_stack_query: bool,
}

/// A fake managed runtime with a fixed set of threads and canned stacks.
///
/// Control blocks are boxed so their addresses stay stable; the runtime
/// never clears the halt bit itself (honoring the halt is the real VM's
/// job), which keeps the dedup behavior deterministic in tests.
struct MockRuntime {
    threads: Mutex<Vec<MockThread>>,
    collector_control: Box<VmThreadControl>,
    fail_enumeration: AtomicBool,
}

impl MockRuntime {
    fn new() -> MockRuntime {
        MockRuntime {
            threads: Mutex::new(Vec::new()),
            collector_control: Box::new(VmThreadControl::new()),
            fail_enumeration: AtomicBool::new(false),
        }
    }

    fn add_thread(&self, tid: i32, frames: Vec<VmFrame>) -> VmThreadRef {
        self.add_thread_with(tid, frames, false)
    }

    fn add_thread_with(&self, tid: i32, frames: Vec<VmFrame>, fail_stack_query: bool) -> VmThreadRef {
        let thread = MockThread {
            control: Box::new(VmThreadControl::new()),
            tid,
            frames,
            fail_stack_query,
        };
        let vm_thread = control_ref(&thread.control);
        self.threads.lock().unwrap().push(thread);
        vm_thread
    }
}

impl RuntimeAccess for MockRuntime {
    fn attach_thread(&self, _name: &str) -> Result<VmThreadRef, RuntimeError> {
        Ok(control_ref(&self.collector_control))
    }

    fn detach_thread(&self) {}

    fn live_threads(&self) -> Result<Vec<RuntimeThread>, RuntimeError> {
        if self.fail_enumeration.load(Ordering::Acquire) {
            return Err(RuntimeError::new(112));
        }
        let count = self.threads.lock().unwrap().len();
        Ok((0..count).map(RuntimeThread).collect())
    }

    fn vm_thread(&self, thread: RuntimeThread) -> Option<VmThreadRef> {
        let threads = self.threads.lock().unwrap();
        threads.get(thread.0).map(|t| control_ref(&t.control))
    }

    fn os_thread_id(&self, thread: RuntimeThread) -> i32 {
        let threads = self.threads.lock().unwrap();
        threads.get(thread.0).map(|t| t.tid).unwrap_or(0)
    }

    fn stack_trace_extended(
        &self,
        thread: RuntimeThread,
        _flavor: StackWalkFlavor,
        max_depth: usize,
        out: &mut Vec<VmFrame>,
    ) -> Result<(), RuntimeError> {
        let threads = self.threads.lock().unwrap();
        let Some(t) = threads.get(thread.0) else {
            return Err(RuntimeError::new(15));
        };
        if t.fail_stack_query {
            return Err(RuntimeError::new(23));
        }
        out.extend(t.frames.iter().take(max_depth).copied());
        Ok(())
    }
}

struct MockNative {
    resolutions: HashMap<usize, MethodId>,
    unwind: Vec<MethodId>,
    resets: Mutex<Vec<i32>>,
}

impl MockNative {
    fn new() -> MockNative {
        MockNative {
            resolutions: HashMap::new(),
            unwind: Vec::new(),
            resets: Mutex::new(Vec::new()),
        }
    }
}

impl NativeStackSource for MockNative {
    fn resolve_native_method(&self, pc: usize) -> Option<MethodId> {
        self.resolutions.get(&pc).copied()
    }

    fn native_trace(&self, _tid: i32, frames: &mut FrameBuffer) {
        for &method in &self.unwind {
            frames.push_native(method);
        }
    }

    fn reset_thread(&self, tid: i32) {
        self.resets.lock().unwrap().push(tid);
    }
}

#[derive(Debug)]
struct RecordedSample {
    weight: u64,
    tid: i32,
    frames: Vec<CallFrame>,
}

struct ChannelSink {
    sender: Sender<RecordedSample>,
}

impl SampleSink for ChannelSink {
    fn record_sample(&self, weight: u64, tid: i32, frames: &[CallFrame]) {
        let _ = self.sender.send(RecordedSample {
            weight,
            tid,
            frames: frames.to_vec(),
        });
    }
}

struct TestSetup {
    runtime: Arc<MockRuntime>,
    native: Arc<MockNative>,
    samples: Receiver<RecordedSample>,
    sampler: CooperativeSampler,
}

fn setup_with(runtime: MockRuntime, native: MockNative, config: SamplerConfig) -> TestSetup {
    init_logging();
    let runtime = Arc::new(runtime);
    let native = Arc::new(native);
    let (sender, samples) = unbounded();
    let sampler = CooperativeSampler::new(
        Arc::clone(&runtime) as Arc<dyn RuntimeAccess>,
        Arc::clone(&native) as Arc<dyn NativeStackSource>,
        Arc::new(ChannelSink { sender }),
        config,
    );
    TestSetup {
        runtime,
        native,
        samples,
        sampler,
    }
}

fn managed_frames() -> Vec<VmFrame> {
    vec![
        VmFrame::new(MethodId(0xa1), FrameKind::Interpreted, 1),
        VmFrame::new(MethodId(0xa2), FrameKind::Compiled, 2),
        VmFrame::new(MethodId(0xa3), FrameKind::Inlined, 3),
    ]
}

#[test]
fn test_pc_resolution_merges_one_native_frame_before_managed() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(301, managed_frames());

    let mut native = MockNative::new();
    native.resolutions.insert(0x1000, MethodId(0x99));

    let config = SamplerConfig {
        max_stack_depth: 64,
        native_stack: NativeStackMode::InstructionPointer,
    };
    let mut setup = setup_with(runtime, native, config);
    setup.sampler.start().unwrap();

    setup
        .sampler
        .handle()
        .request_capture(thread, Some(0x1000), 5);

    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.weight, 5);
    assert_eq!(sample.tid, 301);
    assert_eq!(sample.frames.len(), 4);
    assert!(sample.frames[0].is_native());
    assert_eq!(sample.frames[0].method(), MethodId(0x99));
    assert_eq!(sample.frames[1].method(), MethodId(0xa1));
    assert_eq!(sample.frames[2].kind(), FrameKind::Compiled);
    assert_eq!(sample.frames[3].method(), MethodId(0xa3));

    assert_eq!(*setup.native.resets.lock().unwrap(), vec![301]);

    setup.sampler.stop();
}

#[test]
fn test_full_unwind_when_request_has_no_pc() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(302, managed_frames());

    let mut native = MockNative::new();
    native.unwind = vec![MethodId(0x51), MethodId(0x52)];

    let config = SamplerConfig {
        max_stack_depth: 64,
        native_stack: NativeStackMode::FullUnwind,
    };
    let mut setup = setup_with(runtime, native, config);
    setup.sampler.start().unwrap();

    setup.sampler.handle().request_capture(thread, None, 1);

    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.frames.len(), 5);
    assert!(sample.frames[0].is_native());
    assert!(sample.frames[1].is_native());
    assert_eq!(sample.frames[1].method(), MethodId(0x52));
    assert!(!sample.frames[2].is_native());

    setup.sampler.stop();
}

#[test]
fn test_native_capture_disabled_yields_managed_frames_only() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(303, managed_frames());

    let mut native = MockNative::new();
    native.resolutions.insert(0x1000, MethodId(0x99));

    let mut setup = setup_with(runtime, native, SamplerConfig::default());
    setup.sampler.start().unwrap();

    setup
        .sampler
        .handle()
        .request_capture(thread, Some(0x1000), 1);

    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.frames.len(), 3);
    assert!(sample.frames.iter().all(|frame| !frame.is_native()));

    setup.sampler.stop();
}

#[test]
fn test_rapid_requests_produce_a_single_sample() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(304, managed_frames());

    let mut setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.start().unwrap();
    let handle = setup.sampler.handle();

    // The mock runtime never honors the halt, so the bit stays set and the
    // second request backs off no matter how the threads interleave.
    handle.request_capture(thread, None, 1);
    handle.request_capture(thread, None, 2);

    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.weight, 1);
    assert!(matches!(
        setup.samples.recv_timeout(SILENCE_TIMEOUT),
        Err(RecvTimeoutError::Timeout)
    ));

    setup.sampler.stop();
}

#[test]
fn test_request_for_exited_thread_is_ignored() {
    let runtime = MockRuntime::new();
    let live = runtime.add_thread(305, managed_frames());

    let mut setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.start().unwrap();
    let handle = setup.sampler.handle();

    // A thread the runtime does not report as live: its request must be
    // dropped silently, and the live thread without a request stays silent
    // as well.
    let stale_control = Box::new(VmThreadControl::new());
    handle.request_capture(control_ref(&stale_control), None, 9);

    assert!(matches!(
        setup.samples.recv_timeout(SILENCE_TIMEOUT),
        Err(RecvTimeoutError::Timeout)
    ));

    // The coordinator still works afterwards.
    handle.request_capture(live, None, 3);
    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.weight, 3);

    setup.sampler.stop();
}

#[test]
fn test_failed_stack_query_drops_only_that_sample() {
    let runtime = MockRuntime::new();
    let broken = runtime.add_thread_with(306, Vec::new(), true);
    let healthy = runtime.add_thread(307, managed_frames());

    let mut setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.start().unwrap();
    let handle = setup.sampler.handle();

    handle.request_capture(broken, None, 1);
    handle.request_capture(healthy, None, 2);

    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.tid, 307);
    assert!(matches!(
        setup.samples.recv_timeout(SILENCE_TIMEOUT),
        Err(RecvTimeoutError::Timeout)
    ));

    setup.sampler.stop();
}

#[test]
fn test_enumeration_failure_ends_the_session() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(308, managed_frames());
    runtime.fail_enumeration.store(true, Ordering::Release);

    let mut setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.start().unwrap();
    let handle = setup.sampler.handle();

    handle.request_capture(thread, None, 1);
    assert!(matches!(
        setup.samples.recv_timeout(SILENCE_TIMEOUT),
        Err(RecvTimeoutError::Timeout)
    ));

    // The collector has exited; stop still joins cleanly, and afterwards
    // checkpoints are no-ops again.
    setup.sampler.stop();
    let late = setup.runtime.add_thread(309, managed_frames());
    handle.request_capture(late, None, 1);
    assert_eq!(late.flags(), VmThreadFlags::empty());
}

#[test]
fn test_stop_with_pending_requests_does_not_hang() {
    let runtime = MockRuntime::new();
    let threads: Vec<VmThreadRef> = (0..10)
        .map(|i| runtime.add_thread(400 + i, managed_frames()))
        .collect();

    let mut setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.start().unwrap();
    let handle = setup.sampler.handle();

    for &thread in &threads {
        handle.request_capture(thread, None, 1);
    }
    setup.sampler.stop();
}

#[test]
fn test_start_twice_is_rejected() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(310, managed_frames());

    let mut setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.start().unwrap();
    assert!(matches!(
        setup.sampler.start(),
        Err(SetupError::AlreadyStarted)
    ));

    // The first session is unaffected.
    setup.sampler.handle().request_capture(thread, None, 4);
    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.weight, 4);

    setup.sampler.stop();
}

#[test]
fn test_checkpoint_before_start_touches_nothing() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(311, managed_frames());

    let setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.handle().request_capture(thread, Some(0x40), 1);

    assert_eq!(thread.flags(), VmThreadFlags::empty());
    assert!(matches!(
        setup.samples.recv_timeout(SILENCE_TIMEOUT),
        Err(RecvTimeoutError::Timeout)
    ));
}

#[test]
fn test_restart_after_stop() {
    let runtime = MockRuntime::new();
    let first = runtime.add_thread(312, managed_frames());

    let mut setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    setup.sampler.start().unwrap();
    setup.sampler.handle().request_capture(first, None, 1);
    setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    setup.sampler.stop();

    setup.sampler.start().unwrap();
    let second = setup.runtime.add_thread(313, managed_frames());
    setup.sampler.handle().request_capture(second, None, 2);
    let sample = setup.samples.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(sample.weight, 2);
    assert_eq!(sample.tid, 313);

    setup.sampler.stop();
}

#[test]
fn test_drop_shuts_the_collector_down() {
    let runtime = MockRuntime::new();
    let thread = runtime.add_thread(314, managed_frames());

    let setup = setup_with(runtime, MockNative::new(), SamplerConfig::default());
    let samples = setup.samples.clone();
    let mut sampler = setup.sampler;
    sampler.start().unwrap();
    sampler.handle().request_capture(thread, None, 1);
    samples.recv_timeout(RECV_TIMEOUT).unwrap();

    drop(sampler);
    drop(setup.samples);

    // Every sender lives in the sampler or the collector thread; the
    // channel disconnecting proves the collector is gone.
    assert!(matches!(
        samples.recv_timeout(RECV_TIMEOUT),
        Err(RecvTimeoutError::Disconnected)
    ));
}
