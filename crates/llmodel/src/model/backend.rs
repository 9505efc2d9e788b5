//! Implements the [`Backend`] and [`RawModel`] traits, which abstract over the native runtime,
//! and [`ModelSlot`], which keeps a runtime to a single live model.

use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

pub use llmodel_sys::llmodel_prompt_context as RawPromptContext;

use crate::{LoadError, ModelKind, PromptCallbacks};

/// A model instance on the other side of the runtime boundary.
///
/// Dropping the value destroys the native instance.
pub trait RawModel: Send {
    /// Loads the weights at `path`, returning `false` if the runtime reports a failure.
    fn load(&mut self, path: &CStr) -> bool;

    /// Returns `true` once weights have been loaded successfully.
    fn is_loaded(&self) -> bool {
        true
    }

    /// Sets the number of threads used for inference.
    fn set_thread_count(&mut self, _threads: u32) {}

    /// Returns the number of threads used for inference, if the runtime reports it.
    fn thread_count(&self) -> Option<u32> {
        None
    }

    /// Processes `prompt` and generates a response, blocking the calling thread until
    /// generation completes or a callback answers `false`.
    ///
    /// Every callback must be invoked synchronously on the calling thread. The runtime reads the
    /// settings in `ctx` and writes its running state back into it.
    fn prompt(
        &mut self,
        prompt: &CStr,
        ctx: &mut RawPromptContext,
        callbacks: &mut dyn PromptCallbacks,
    );
}

/// A runtime able to create models.
pub trait Backend: Send + Sync {
    /// Creates an empty model instance of the given architecture.
    ///
    /// Fails with [`LoadError::UnknownArchitecture`] if this runtime cannot host `kind`.
    fn create(&self, kind: ModelKind) -> Result<Box<dyn RawModel>, LoadError>;

    /// The slot tracking the live model of this runtime.
    fn slot(&self) -> &ModelSlot;
}

/// Tracks whether a runtime currently hosts a model.
///
/// At most one [`crate::LlModel`] per slot may exist at any time.
#[derive(Debug, Default)]
pub struct ModelSlot {
    occupied: AtomicBool,
}

impl ModelSlot {
    /// Creates an empty slot.
    pub const fn new() -> Self {
        Self {
            occupied: AtomicBool::new(false),
        }
    }

    /// Returns `true` while a model holds this slot.
    pub fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::SeqCst)
    }

    fn claim(&self) -> bool {
        self.occupied
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        if !self.occupied.swap(false, Ordering::SeqCst) {
            error!("Model slot was already free, this should never happen");
        }
    }
}

/// Holds the [`ModelSlot`] of a runtime, releasing it when dropped.
pub(crate) struct SlotClaim {
    backend: Arc<dyn Backend>,
}

impl SlotClaim {
    /// Claims the slot of `backend`, or returns `None` if a model already holds it.
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Option<Self> {
        backend.slot().claim().then_some(Self { backend })
    }
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        debug!("Releasing model slot");
        self.backend.slot().release();
    }
}
