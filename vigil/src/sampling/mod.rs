//! Stack sampling
//!
//! This module handles:
//! - Publishing each instrumented thread's frames and state (shadow stacks)
//! - Reading them from another thread through the [`StackSampler`] seam
//! - The background scheduler that samples and detects stuck operations

pub mod sampler;
pub mod scheduler;
pub mod shadow_stack;

pub use sampler::{ShadowStackSampler, StackSampler, ThreadSnapshot};
pub use scheduler::{Scheduler, SchedulerHandle, TickSummary};
pub use shadow_stack::{
    enter, enter_frame, enter_state, FrameGuard, ShadowStack, ThreadRef, ThreadStateGuard,
};
