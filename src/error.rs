use std::io;

use thiserror::Error;

/// Errors that can occur while bringing the sampler up.
///
/// After any of these, no collector thread is running and both pipe ends
/// have been closed again.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create the request pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("unable to spawn the collector thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("the collector thread is already running")]
    AlreadyStarted,
}

/// A failed call into the runtime, carrying the runtime's own error code.
///
/// The coordinator does not interpret the code beyond "this call failed";
/// it only decides whether the failure kills the whole collector loop
/// (thread enumeration) or just drops one thread's sample (stack query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("runtime call failed with error code {code}")]
pub struct RuntimeError {
    pub code: i32,
}

impl RuntimeError {
    pub fn new(code: i32) -> Self {
        RuntimeError { code }
    }
}
