//! Implements the [`LlModel`] struct

use std::ffi::CString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::{CallbackBridge, ModelEvent, PromptContext, StopSwitch};
use backend::SlotClaim;
pub use backend::{Backend, ModelSlot, RawModel, RawPromptContext};
#[cfg(feature = "native")]
pub use native::NativeBackend;
pub(crate) use params::default_threads;
pub use params::*;

mod backend;
#[cfg(feature = "native")]
mod native;
mod params;

/// An error raised while loading a model.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The path was empty, or cannot be passed to the runtime.
    #[error("Invalid model path: {0:?}")]
    InvalidPath(PathBuf),

    /// The path does not lead to a readable file.
    #[error("Model file not found: {0}")]
    FileNotFound(PathBuf),

    /// The requested architecture is unknown, or unsupported by the runtime.
    #[error("Unknown model architecture: {0}")]
    UnknownArchitecture(String),

    /// The runtime failed to create a model instance.
    #[error("llmodel couldn't create a {0} model")]
    CreateFailed(ModelKind),

    /// The runtime failed to load the weights; check `tracing` output.
    #[error("llmodel couldn't load the provided model: {0}")]
    LoadFailure(PathBuf),

    /// The runtime already hosts a model.
    #[error("a model is already loaded")]
    AlreadyLoaded,
}

/// An error raised while preparing a prompt for the runtime.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PromptError {
    /// Prompts are passed as C strings, so they cannot contain NUL bytes.
    #[error("prompt contains a NUL byte at position {0}")]
    ContainsNul(usize),
}

/// A loaded model.
///
/// Only one model may be live per [`Backend`]; loading a second one fails with
/// [`LoadError::AlreadyLoaded`] until the first is unloaded. The native instance is destroyed
/// exactly once, when the model is unloaded or dropped.
///
/// Generation is blocking and serialized: concurrent [`LlModel::generate`] calls wait for each
/// other, so share the model behind an [`Arc`] and call it from worker threads.
pub struct LlModel {
    // Declared first so the native instance is destroyed before the slot is released.
    raw: Mutex<Box<dyn RawModel>>,
    kind: ModelKind,
    path: PathBuf,
    _claim: SlotClaim,
}

impl LlModel {
    /// Creates a model instance on `backend` and loads the weights described by `params`.
    ///
    /// If the model fails to load on the other side of the runtime boundary, the runtime is
    /// expected to have logged the reason; consider setting up [`tracing`][tracing] to get the
    /// whole story.
    ///
    /// [tracing]: https://docs.rs/tracing/latest/tracing/
    pub fn load(backend: Arc<dyn Backend>, params: LoadParams) -> Result<Self, LoadError> {
        let LoadParams {
            kind,
            path,
            threads,
        } = params;

        check_model_path(&path)?;

        let c_path = path_to_c(&path)?;

        let claim = SlotClaim::new(backend.clone()).ok_or(LoadError::AlreadyLoaded)?;

        info!("Creating {kind} model");
        let mut raw = backend.create(kind)?;

        info!("Loading model \"{}\"", path.display());
        let started = Instant::now();

        if !raw.load(&c_path) || !raw.is_loaded() {
            error!("Failed to load model \"{}\"", path.display());
            return Err(LoadError::LoadFailure(path));
        }

        if let Some(threads) = threads {
            raw.set_thread_count(threads.max(1));
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            threads = raw.thread_count(),
            "Model loaded"
        );

        Ok(Self {
            raw: Mutex::new(raw),
            kind,
            path,
            _claim: claim,
        })
    }

    /// Loads a model on a blocking thread.
    ///
    /// This is a thin `tokio::spawn_blocking` wrapper around [`LlModel::load`].
    pub async fn load_async(
        backend: Arc<dyn Backend>,
        params: LoadParams,
    ) -> Result<Self, LoadError> {
        let path = params.path.clone();

        tokio::task::spawn_blocking(move || Self::load(backend, params))
            .await
            .unwrap_or_else(|_| {
                error!("Model loading panicked");
                Err(LoadError::LoadFailure(path))
            })
    }

    /// Runs `prompt` through the model, blocking until the response is complete, and returns
    /// the full response.
    ///
    /// Every callback of the runtime is reported to `on_event` as it happens, on the calling
    /// thread. `ctx` supplies the sampling settings, and carries the conversation on: only its
    /// conversation state is updated by the call.
    pub fn generate<F>(
        &self,
        prompt: &str,
        ctx: &mut PromptContext,
        on_event: F,
    ) -> Result<String, PromptError>
    where
        F: FnMut(ModelEvent),
    {
        self.run(prompt, ctx, CallbackBridge::new(on_event))
    }

    /// Like [`LlModel::generate`], but stops generating once `stop` is flipped.
    pub fn generate_with_stop<F>(
        &self,
        prompt: &str,
        ctx: &mut PromptContext,
        stop: StopSwitch,
        on_event: F,
    ) -> Result<String, PromptError>
    where
        F: FnMut(ModelEvent),
    {
        self.run(prompt, ctx, CallbackBridge::new(on_event).with_stop(stop))
    }

    fn run<F>(
        &self,
        prompt: &str,
        ctx: &mut PromptContext,
        mut bridge: CallbackBridge<F>,
    ) -> Result<String, PromptError>
    where
        F: FnMut(ModelEvent),
    {
        let prompt =
            CString::new(prompt).map_err(|err| PromptError::ContainsNul(err.nul_position()))?;
        let mut raw_ctx = ctx.to_raw();

        {
            let mut raw = self.lock();

            info!(
                prompt_bytes = prompt.as_bytes().len(),
                past_tokens = raw_ctx.n_past,
                "Running inference"
            );
            let started = Instant::now();

            raw.prompt(&prompt, &mut raw_ctx, &mut bridge);

            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                response_tokens = bridge.response_tokens(),
                context_tokens = raw_ctx.tokens_size,
                "Inference finished"
            );
        }

        ctx.absorb(&raw_ctx);
        Ok(bridge.finish())
    }

    /// Sets the number of threads used for inference, waiting for any generation in progress.
    pub fn set_thread_count(&self, threads: u32) {
        self.lock().set_thread_count(threads.max(1));
    }

    /// Returns the number of threads used for inference, if the runtime reports it.
    pub fn thread_count(&self) -> Option<u32> {
        self.lock().thread_count()
    }

    /// Returns the architecture of this model.
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Returns the path the weights were loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Destroys the native model instance and frees its slot.
    pub fn unload(self) {
        info!("Unloading {} model \"{}\"", self.kind, self.path.display());
        drop(self);
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn RawModel>> {
        self.raw.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LlModel {
    fn drop(&mut self) {
        debug!("Destroying {} model", self.kind);
    }
}

fn check_model_path(path: &Path) -> Result<(), LoadError> {
    if path.as_os_str().is_empty() {
        error!("Model path is empty");
        return Err(LoadError::InvalidPath(path.into()));
    }

    let readable = path.is_file() && File::open(path).is_ok();
    if !readable {
        error!("Model path \"{}\" doesn't exist", path.display());
        return Err(LoadError::FileNotFound(path.into()));
    }

    Ok(())
}

/// Hands the runtime the path's exact bytes; a path that cannot be expressed as a C string is
/// refused rather than altered.
fn path_to_c(path: &Path) -> Result<CString, LoadError> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };

    #[cfg(not(unix))]
    let bytes = match path.to_str() {
        Some(path) => path.as_bytes().to_vec(),
        None => {
            error!("Model path \"{}\" is not valid Unicode", path.display());
            return Err(LoadError::InvalidPath(path.into()));
        }
    };

    CString::new(bytes).map_err(|_| {
        error!("Model path \"{}\" contains a NUL byte", path.display());
        LoadError::InvalidPath(path.into())
    })
}
