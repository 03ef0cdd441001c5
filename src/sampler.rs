//! Sampler lifecycle and the producer-side checkpoint protocol.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::collector::{Collector, COLLECTOR_THREAD_NAME};
use crate::error::SetupError;
use crate::request::{CaptureRequest, RequestPipe, RequestReader, RequestWriter};
use crate::runtime::{NativeStackSource, RuntimeAccess, SampleSink, SamplerConfig};
use crate::vm_thread::{VmThreadFlags, VmThreadRef};

/// The collector thread's published identity.
///
/// Written once when the collector has attached to the runtime and once when
/// it detaches; read by every producer on every checkpoint. The zero state
/// means "collector not ready", which makes the checkpoint a cheap no-op
/// before startup and after shutdown.
pub(crate) struct CollectorIdentity(AtomicUsize);

impl CollectorIdentity {
    const NOT_READY: usize = 0;

    pub fn new() -> CollectorIdentity {
        CollectorIdentity(AtomicUsize::new(Self::NOT_READY))
    }

    pub fn publish(&self, collector: VmThreadRef) {
        self.0.store(collector.raw_id(), Ordering::Release);
    }

    pub fn unpublish(&self) {
        self.0.store(Self::NOT_READY, Ordering::Release);
    }

    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            Self::NOT_READY => None,
            id => Some(id),
        }
    }
}

/// State shared between producers and the sampler lifecycle.
pub(crate) struct SamplerShared {
    pub identity: CollectorIdentity,
    pub writer: RequestWriter,
}

/// Owns the collector thread and the request channel.
///
/// `start` / `stop` bracket one sampling session; the same instance can be
/// started again after a stop. Producers post requests through clones of
/// [`CheckpointHandle`], which stay valid (as no-ops) across sessions.
pub struct CooperativeSampler {
    runtime: Arc<dyn RuntimeAccess>,
    native: Arc<dyn NativeStackSource>,
    sink: Arc<dyn SampleSink>,
    config: SamplerConfig,
    shared: Arc<SamplerShared>,
    read_fd: RawFd,
    collector: Option<JoinHandle<()>>,
}

impl CooperativeSampler {
    pub fn new(
        runtime: Arc<dyn RuntimeAccess>,
        native: Arc<dyn NativeStackSource>,
        sink: Arc<dyn SampleSink>,
        config: SamplerConfig,
    ) -> CooperativeSampler {
        CooperativeSampler {
            runtime,
            native,
            sink,
            config,
            shared: Arc::new(SamplerShared {
                identity: CollectorIdentity::new(),
                writer: RequestWriter::new(),
            }),
            read_fd: -1,
            collector: None,
        }
    }

    /// Creates the request pipe and spawns the collector thread.
    ///
    /// On failure nothing is left behind: both pipe ends are closed and no
    /// thread is running.
    pub fn start(&mut self) -> Result<(), SetupError> {
        if self.collector.is_some() {
            return Err(SetupError::AlreadyStarted);
        }

        let pipe = RequestPipe::new().map_err(SetupError::Pipe)?;
        self.shared.writer.open(pipe.write_fd());

        let collector = Collector::new(
            RequestReader::new(pipe.read_fd()),
            Arc::clone(&self.shared),
            Arc::clone(&self.runtime),
            Arc::clone(&self.native),
            Arc::clone(&self.sink),
            self.config,
        );
        let spawned = thread::Builder::new()
            .name(COLLECTOR_THREAD_NAME.into())
            .spawn(move || collector.run());
        match spawned {
            Ok(handle) => {
                self.read_fd = pipe.read_fd();
                self.collector = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.writer.close();
                unsafe { libc::close(pipe.read_fd()) };
                Err(SetupError::Spawn(err))
            }
        }
    }

    /// Shuts the sampling session down: closes the write end of the pipe
    /// (which the blocking reader observes as end-of-stream), joins the
    /// collector thread, then closes the read end. No-op if not started.
    pub fn stop(&mut self) {
        let Some(handle) = self.collector.take() else {
            return;
        };
        self.shared.writer.close();
        if handle.join().is_err() {
            log::warn!("the collector thread panicked");
        }
        unsafe { libc::close(self.read_fd) };
        self.read_fd = -1;
    }

    /// A cheap clonable handle for producers.
    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for CooperativeSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Producer-side entry point to the checkpoint protocol.
#[derive(Clone)]
pub struct CheckpointHandle {
    shared: Arc<SamplerShared>,
}

impl CheckpointHandle {
    /// Requests a stack capture of `thread`, typically the caller's own.
    ///
    /// Callable from arbitrary context, including an asynchronous
    /// interruption of the calling thread: no allocation, no locks, one
    /// atomic read-modify-write plus at most one non-blocking pipe write.
    ///
    /// At most one request per thread is outstanding at a time; a second
    /// call while the halt bit is still set returns immediately. If the
    /// request cannot be posted, the halt bit is rolled back and the sample
    /// is dropped.
    pub fn request_capture(&self, thread: VmThreadRef, pc: Option<usize>, weight: u64) {
        let Some(collector) = self.shared.identity.get() else {
            // Collector thread is not ready.
            return;
        };
        if thread.raw_id() == collector {
            // Never sample the sampler.
            return;
        }

        let prior = thread.test_and_set_halt();
        if prior.contains(VmThreadFlags::HALT_FOR_INSPECTION) {
            // Thread is already scheduled for inspection.
            return;
        }
        if !prior.contains(VmThreadFlags::STOPPED) {
            thread.arm_overflow_mark();
            let request = CaptureRequest {
                thread: thread.raw_id(),
                pc: pc.unwrap_or(0),
                weight,
            };
            if self.shared.writer.try_send(&request) {
                return;
            }
        }
        // Already parked by the runtime, or the pipe is full - roll back so
        // the thread is not left with a stale halt request.
        thread.clear_halt();
    }
}
