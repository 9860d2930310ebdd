//! Stack sampling seam.

use vigil_common::{StackFrame, ThreadState};

use super::shadow_stack::ThreadRef;
use crate::domain::SampleError;

/// Call stack and state of one thread at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSnapshot {
    pub thread_name: String,
    pub state: ThreadState,
    /// Outermost frame first.
    pub frames: Vec<StackFrame>,
}

/// Captures the stack of a thread other than the caller.
///
/// Implemented by [`ShadowStackSampler`] in production; tests inject
/// samplers that fail or return canned stacks.
pub trait StackSampler: Send + Sync {
    /// Sample `thread`.
    ///
    /// # Errors
    ///
    /// Returns [`SampleError`] if the thread has exited or its stack cannot
    /// be read.
    fn sample(&self, thread: &ThreadRef) -> Result<ThreadSnapshot, SampleError>;
}

/// Reads the shadow stack each instrumented thread publishes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShadowStackSampler;

impl StackSampler for ShadowStackSampler {
    fn sample(&self, thread: &ThreadRef) -> Result<ThreadSnapshot, SampleError> {
        let stack = thread.stack().ok_or_else(|| SampleError::ThreadGone(thread.name().to_string()))?;
        let (frames, state) = stack.capture();
        if frames.is_empty() {
            return Err(SampleError::StackUnavailable(
                thread.name().to_string(),
                "no frames published".to_string(),
            ));
        }
        Ok(ThreadSnapshot { thread_name: thread.name().to_string(), state, frames })
    }
}
