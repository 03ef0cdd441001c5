//! The collector thread: matches pending requests to live threads, walks
//! their stacks through the runtime, and emits merged samples.

use std::sync::Arc;

use crate::frames::{FrameBuffer, VmFrame, MAX_NATIVE_FRAMES};
use crate::request::{CaptureRequest, ReadOutcome, RequestReader, READ_BATCH};
use crate::runtime::{
    NativeStackMode, NativeStackSource, RuntimeAccess, RuntimeThread, SampleSink, SamplerConfig,
    StackWalkFlavor,
};
use crate::sampler::SamplerShared;

pub(crate) const COLLECTOR_THREAD_NAME: &str = "stackrelay collector";

/// Local-reference scope capacity per enumeration round.
const LOCAL_FRAME_CAPACITY: usize = 64;

pub(crate) struct Collector {
    reader: RequestReader,
    shared: Arc<SamplerShared>,
    runtime: Arc<dyn RuntimeAccess>,
    native: Arc<dyn NativeStackSource>,
    sink: Arc<dyn SampleSink>,
    config: SamplerConfig,
}

impl Collector {
    pub fn new(
        reader: RequestReader,
        shared: Arc<SamplerShared>,
        runtime: Arc<dyn RuntimeAccess>,
        native: Arc<dyn NativeStackSource>,
        sink: Arc<dyn SampleSink>,
        config: SamplerConfig,
    ) -> Collector {
        Collector {
            reader,
            shared,
            runtime,
            native,
            sink,
            config,
        }
    }

    /// Body of the collector thread.
    ///
    /// Attaches to the runtime and publishes its identity, which is what
    /// makes `request_capture` live; runs until the channel reports
    /// end-of-stream or thread enumeration fails; then unpublishes and
    /// detaches, so producers go back to treating the collector as not
    /// ready.
    pub fn run(self) {
        let identity = match self.runtime.attach_thread(COLLECTOR_THREAD_NAME) {
            Ok(identity) => identity,
            Err(err) => {
                log::warn!("could not attach the collector to the runtime: {err}");
                return;
            }
        };
        self.shared.identity.publish(identity);
        log::debug!("collector attached, sampling is live");

        let mut requests = [CaptureRequest::default(); READ_BATCH];
        let mut frames = FrameBuffer::with_limits(self.config.max_stack_depth, MAX_NATIVE_FRAMES);
        let mut vm_frames: Vec<VmFrame> = Vec::with_capacity(self.config.max_stack_depth);

        loop {
            let pending = match self.reader.read_batch(&mut requests) {
                ReadOutcome::Batch(count) => &requests[..count],
                ReadOutcome::Retry => continue,
                ReadOutcome::Closed => break,
            };

            self.runtime.push_local_frame(LOCAL_FRAME_CAPACITY);
            let threads = match self.runtime.live_threads() {
                Ok(threads) => threads,
                Err(err) => {
                    // Without enumeration there is nothing to match requests
                    // against; give up on this sampling session.
                    log::warn!("live-thread enumeration failed, collector exiting: {err}");
                    self.runtime.pop_local_frame();
                    break;
                }
            };

            for &thread in &threads {
                let Some(vm_thread) = self.runtime.vm_thread(thread) else {
                    continue;
                };
                let Some(request) = pending
                    .iter()
                    .find(|request| request.thread == vm_thread.raw_id())
                else {
                    // Live thread nobody asked about, or it raced past its
                    // request; either way not ours to sample this round.
                    continue;
                };
                self.sample_thread(thread, request, &mut frames, &mut vm_frames);
            }
            self.runtime.pop_local_frame();
        }

        self.shared.identity.unpublish();
        self.runtime.detach_thread();
        log::debug!("collector detached");
    }

    fn sample_thread(
        &self,
        thread: RuntimeThread,
        request: &CaptureRequest,
        frames: &mut FrameBuffer,
        vm_frames: &mut Vec<VmFrame>,
    ) {
        let tid = self.runtime.os_thread_id(thread);

        frames.clear();
        if self.config.native_stack != NativeStackMode::Disabled {
            if request.pc != 0 {
                if let Some(method) = self.native.resolve_native_method(request.pc) {
                    frames.push_native(method);
                }
            } else {
                self.native.native_trace(tid, frames);
            }
        }
        self.native.reset_thread(tid);

        vm_frames.clear();
        let flavor = StackWalkFlavor::COMPILED_FRAMES | StackWalkFlavor::INLINED_FRAMES;
        match self.runtime.stack_trace_extended(
            thread,
            flavor,
            self.config.max_stack_depth,
            vm_frames,
        ) {
            Ok(()) => {
                frames.extend_managed(vm_frames.iter());
                self.sink.record_sample(request.weight, tid, frames.as_slice());
            }
            Err(err) => {
                log::debug!("stack query failed for tid {tid}, dropping the sample: {err}");
            }
        }
    }
}
