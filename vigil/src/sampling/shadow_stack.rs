//! Per-thread shadow stacks.
//!
//! Safe Rust cannot walk another thread's native stack, so every
//! instrumented thread publishes the frames it is executing in a shadow
//! stack that the scheduler reads. Frames come from two places:
//!
//! - every trace event pushed through the [`Monitor`](crate::monitor::Monitor)
//! - explicit [`enter`] / [`enter_frame`] guards for finer detail
//!
//! The thread also publishes its [`ThreadState`] through [`enter_state`], so
//! a sample taken while it waits on a lock reads `BLOCKED`.
//!
//! A thread's shadow stack is dropped when the thread exits; samplers hold
//! only a [`Weak`] reference and report the thread as gone.

use std::marker::PhantomData;
use std::panic::Location;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use vigil_common::{StackFrame, ThreadState, MAX_STACK_DEPTH};

thread_local! {
    static SHADOW_STACK: Arc<ShadowStack> = Arc::new(ShadowStack::for_current_thread());
}

/// Frames and execution state published by one thread.
#[derive(Debug)]
pub struct ShadowStack {
    thread_name: String,
    frames: Mutex<Vec<StackFrame>>,
    /// Frames pushed past `MAX_STACK_DEPTH` and not recorded.
    overflow: AtomicUsize,
    state: AtomicU8,
}

impl ShadowStack {
    fn for_current_thread() -> Self {
        let thread = std::thread::current();
        let thread_name = thread.name().map_or_else(|| format!("{:?}", thread.id()), str::to_string);
        Self::named(thread_name)
    }

    /// Detached stack, for tests and custom samplers.
    #[must_use]
    pub fn named(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
            frames: Mutex::new(Vec::new()),
            overflow: AtomicUsize::new(0),
            state: AtomicU8::new(ThreadState::Runnable.as_u8()),
        }
    }

    /// The calling thread's shadow stack.
    #[must_use]
    pub fn current() -> Arc<ShadowStack> {
        SHADOW_STACK.with(Arc::clone)
    }

    #[must_use]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn push(&self, frame: StackFrame) {
        let mut frames = self.frames.lock();
        if frames.len() < MAX_STACK_DEPTH {
            frames.push(frame);
        } else {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) {
        let mut frames = self.frames.lock();
        let overflow = self.overflow.load(Ordering::Relaxed);
        if overflow > 0 {
            self.overflow.store(overflow - 1, Ordering::Relaxed);
        } else {
            frames.pop();
        }
    }

    /// Frames pushed and not popped, including those past the depth cap.
    #[must_use]
    pub fn total_depth(&self) -> usize {
        let frames = self.frames.lock();
        frames.len() + self.overflow.load(Ordering::Relaxed)
    }

    /// Pop until `total_depth() == depth`, discarding frames whose guards
    /// were never released.
    pub fn unwind_to(&self, depth: usize) {
        let mut frames = self.frames.lock();
        let overflow = self.overflow.load(Ordering::Relaxed);
        let excess = (frames.len() + overflow).saturating_sub(depth);
        let from_overflow = excess.min(overflow);
        self.overflow.store(overflow - from_overflow, Ordering::Relaxed);
        let keep = frames.len().saturating_sub(excess - from_overflow);
        frames.truncate(keep);
    }

    /// Copy of the recorded frames, outermost first.
    #[must_use]
    pub fn frames(&self) -> Vec<StackFrame> {
        self.frames.lock().clone()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    /// Publish a new state, returning the previous one.
    pub fn set_state(&self, state: ThreadState) -> ThreadState {
        ThreadState::from_u8(self.state.swap(state.as_u8(), Ordering::Relaxed))
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Frames and state read together under the frame lock.
    #[must_use]
    pub fn capture(&self) -> (Vec<StackFrame>, ThreadState) {
        let frames = self.frames.lock();
        (frames.clone(), self.state())
    }
}

/// Weak handle to a thread an operation runs on.
#[derive(Debug, Clone)]
pub struct ThreadRef {
    name: String,
    stack: Weak<ShadowStack>,
}

impl ThreadRef {
    /// Handle to the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self::from_stack(&ShadowStack::current())
    }

    #[must_use]
    pub fn from_stack(stack: &Arc<ShadowStack>) -> Self {
        Self { name: stack.thread_name().to_string(), stack: Arc::downgrade(stack) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shadow stack, if the thread is still alive.
    #[must_use]
    pub fn stack(&self) -> Option<Arc<ShadowStack>> {
        self.stack.upgrade()
    }

    #[must_use]
    pub fn is_same_thread(&self, other: &ThreadRef) -> bool {
        Weak::ptr_eq(&self.stack, &other.stack)
    }
}

/// Pops its frame from the calling thread's shadow stack when dropped.
#[must_use = "the frame is popped as soon as the guard is dropped"]
pub struct FrameGuard {
    stack: Arc<ShadowStack>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

/// Push `frame` onto the calling thread's shadow stack.
pub fn enter_frame(frame: StackFrame) -> FrameGuard {
    let stack = ShadowStack::current();
    stack.push(frame);
    FrameGuard { stack, _not_send: PhantomData }
}

/// Push a frame for `function`, located at the caller.
#[track_caller]
pub fn enter(function: impl Into<String>) -> FrameGuard {
    let location = Location::caller();
    enter_frame(StackFrame::with_location(function, location.file(), location.line()))
}

/// Restores the previous thread state when dropped.
#[must_use = "the previous state is restored as soon as the guard is dropped"]
pub struct ThreadStateGuard {
    stack: Arc<ShadowStack>,
    previous: ThreadState,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ThreadStateGuard {
    fn drop(&mut self) {
        self.stack.set_state(self.previous);
    }
}

/// Mark the calling thread as being in `state` until the guard drops.
///
/// ```ignore
/// let _blocked = vigil::sampling::enter_state(ThreadState::Blocked);
/// let guard = shared.lock();
/// ```
pub fn enter_state(state: ThreadState) -> ThreadStateGuard {
    let stack = ShadowStack::current();
    let previous = stack.set_state(state);
    ThreadStateGuard { stack, previous, _not_send: PhantomData }
}
