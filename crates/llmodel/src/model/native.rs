//! Implements [`NativeBackend`], which runs models through the `llmodel` library.

use std::ffi::CStr;

use derive_more::Deref;
use tracing::debug;

use llmodel_sys::{
    llmodel_gptj_create, llmodel_gptj_destroy, llmodel_isModelLoaded, llmodel_llama_create,
    llmodel_llama_destroy, llmodel_loadModel, llmodel_model, llmodel_mpt_create,
    llmodel_mpt_destroy, llmodel_prompt, llmodel_setThreadCount, llmodel_threadCount,
};

use super::backend::{Backend, ModelSlot, RawModel, RawPromptContext};
use crate::{detail, LoadError, ModelKind, PromptCallbacks};

/// The `llmodel` callbacks have no user data, so the library can only ever serve one model per
/// process.
static NATIVE_SLOT: ModelSlot = ModelSlot::new();

/// The `llmodel` library, as linked by `llmodel_sys`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeBackend;

impl Backend for NativeBackend {
    fn create(&self, kind: ModelKind) -> Result<Box<dyn RawModel>, LoadError> {
        let ptr = unsafe {
            // SAFETY: plain constructors, the returned instance is owned by `NativeModel`.
            match kind {
                ModelKind::GptJ => llmodel_gptj_create(),
                ModelKind::Llama => llmodel_llama_create(),
                ModelKind::Mpt => llmodel_mpt_create(),
            }
        };

        if ptr.is_null() {
            Err(LoadError::CreateFailed(kind))
        } else {
            debug!("Created {kind} model instance");
            Ok(Box::new(NativeModel { ptr, kind }))
        }
    }

    fn slot(&self) -> &ModelSlot {
        &NATIVE_SLOT
    }
}

/// A model instance owned by the `llmodel` library.
#[derive(Deref)]
struct NativeModel {
    #[deref]
    ptr: llmodel_model,
    kind: ModelKind,
}

// SAFETY: the instance is only ever touched through `&mut self`, which `LlModel` hands out
// under its lock.
unsafe impl Send for NativeModel {}

impl Drop for NativeModel {
    fn drop(&mut self) {
        unsafe {
            // SAFETY: `drop`ping more than once is unsound [1], so `self.ptr` cannot have been
            // destroyed yet.
            //
            // [1]: See https://github.com/rust-lang/rust/issues/60977
            match self.kind {
                ModelKind::GptJ => llmodel_gptj_destroy(**self),
                ModelKind::Llama => llmodel_llama_destroy(**self),
                ModelKind::Mpt => llmodel_mpt_destroy(**self),
            }
        }
    }
}

impl RawModel for NativeModel {
    fn load(&mut self, path: &CStr) -> bool {
        unsafe {
            // SAFETY: `path` is a valid C string for the duration of the call.
            llmodel_loadModel(**self, path.as_ptr())
        }
    }

    fn is_loaded(&self) -> bool {
        unsafe { llmodel_isModelLoaded(**self) }
    }

    fn set_thread_count(&mut self, threads: u32) {
        unsafe { llmodel_setThreadCount(**self, i32::try_from(threads).unwrap_or(i32::MAX)) }
    }

    fn thread_count(&self) -> Option<u32> {
        u32::try_from(unsafe { llmodel_threadCount(**self) }).ok()
    }

    fn prompt(
        &mut self,
        prompt: &CStr,
        ctx: &mut RawPromptContext,
        callbacks: &mut dyn PromptCallbacks,
    ) {
        let model = **self;

        detail::with_callbacks(callbacks, || unsafe {
            // SAFETY: `prompt` and `ctx` outlive the call. The buffers in `ctx` were either
            // produced by this same instance on a previous call or are null, and the callbacks
            // only run on this thread while `with_callbacks` has them published.
            llmodel_prompt(
                model,
                prompt.as_ptr(),
                Some(detail::prompt_callback),
                Some(detail::response_callback),
                Some(detail::recalculate_callback),
                ctx,
            )
        })
    }
}
