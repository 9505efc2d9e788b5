//! Implements [`SessionManager`], the async front of a single model.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::model::default_threads;
use crate::{
    Backend, DispatchHandle, LlModel, LoadError, LoadParams, ModelKind, PromptContext,
    PromptError, SamplingParams, StopSwitch,
};

mod events;
mod template;

use events::Subscribers;
pub use events::{EventStream, Subscription};
pub use template::*;

/// Where the default model lives, relative to [`SessionConfig::asset_root`].
pub const DEFAULT_MODEL_PATH: &str = "Gpt4All/ggml-gpt4all-j-v1.3-groovy.bin";

/// The lifecycle state of a [`SessionManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No model is loaded.
    Unloaded,

    /// A model is being loaded.
    Loading,

    /// A model is loaded and accepts prompts.
    Ready,
}

/// An error returned by a [`SessionManager`].
#[derive(Error, Debug)]
pub enum SessionError {
    /// The model failed to load.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// [`SessionManager::init`] was called while a model is loaded.
    #[error("a model is already loaded")]
    AlreadyLoaded,

    /// [`SessionManager::init`] was called while a model is loading.
    #[error("a model is already loading")]
    AlreadyLoading,

    /// A prompt was sent while no model is loaded, or the load it waited for failed.
    #[error("no model is loaded")]
    NotLoaded,

    /// The prompt could not be built.
    #[error(transparent)]
    InvalidPrompt(#[from] InvalidPrompt),

    /// The blocking worker running the model panicked.
    #[error("the model worker panicked")]
    WorkerPanicked,
}

/// Settings of a [`SessionManager`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// The architecture of the model file.
    pub kind: ModelKind,

    /// Directory the application ships its assets in.
    pub asset_root: PathBuf,

    /// Path to the model weights, relative to `asset_root`.
    pub model_path: PathBuf,

    /// Template the user's prompts are formatted with.
    pub template: PromptTemplate,

    /// Sampling settings applied to every prompt.
    pub params: SamplingParams,

    /// Number of inference threads; `None` leaves the runtime's default alone.
    pub threads: Option<u32>,
}

impl SessionConfig {
    /// The full path of the model weights.
    pub fn model_file(&self) -> PathBuf {
        self.asset_root.join(&self.model_path)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::GptJ,
            asset_root: PathBuf::from("."),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            template: PromptTemplate::default(),
            params: SamplingParams::default(),
            threads: Some(default_threads()),
        }
    }
}

/// The conversation carried from one prompt to the next.
struct Conversation {
    ctx: PromptContext,

    /// The model `ctx` was last used with.
    model: Weak<LlModel>,

    /// The [`ConversationMark::epoch`] `ctx` belongs to.
    epoch: u64,
}

/// The progress of the current conversation as seen outside the worker.
#[derive(Default)]
struct ConversationMark {
    /// Bumped by every reset. A prompt only records its progress if no reset happened while it
    /// ran.
    epoch: u64,
    past_tokens: u32,
}

struct SessionInner {
    backend: Arc<dyn Backend>,
    load_params: LoadParams,
    template: Mutex<PromptTemplate>,
    params: Mutex<SamplingParams>,
    state: watch::Sender<SessionState>,
    model: Mutex<Option<Arc<LlModel>>>,

    /// Held by the worker for a whole generation, which serializes prompts.
    conversation: Mutex<Conversation>,
    mark: Mutex<ConversationMark>,

    stop: StopSwitch,
    dispatcher: DispatchHandle,
    subscribers: Subscribers,
}

/// Owns the lifecycle of one model and runs prompts against it off the async runtime.
///
/// Prompts are served one at a time, in the order the worker threads pick them up; a prompt
/// sent while the model is loading waits for the load to finish. Every [`crate::ModelEvent`]
/// is republished through the [`crate::Dispatcher`] the session was created with, so
/// subscribers only ever run on that dispatcher's consumer.
///
/// This is cheap to clone; clones share the same model.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Creates an unloaded session hosting its model on `backend`, publishing events through
    /// `dispatcher`.
    pub fn new(backend: Arc<dyn Backend>, config: SessionConfig, dispatcher: DispatchHandle) -> Self {
        let load_params = LoadParams {
            kind: config.kind,
            path: config.model_file(),
            threads: config.threads,
        };
        let (state, _) = watch::channel(SessionState::Unloaded);

        Self {
            inner: Arc::new(SessionInner {
                backend,
                load_params,
                template: Mutex::new(config.template),
                params: Mutex::new(config.params.clone()),
                state,
                model: Mutex::new(None),
                conversation: Mutex::new(Conversation {
                    ctx: PromptContext::new(&config.params),
                    model: Weak::new(),
                    epoch: 0,
                }),
                mark: Mutex::new(ConversationMark::default()),
                stop: StopSwitch::new(),
                dispatcher,
                subscribers: Subscribers::default(),
            }),
        }
    }

    /// Loads the configured model.
    ///
    /// Only one load ever runs at a time: calling this while a model is loading or loaded logs
    /// a warning and fails with [`SessionError::AlreadyLoading`] or
    /// [`SessionError::AlreadyLoaded`] without side effects. A failed load leaves the session
    /// [`SessionState::Unloaded`], so it can be retried.
    pub async fn init(&self) -> Result<(), SessionError> {
        let mut refused = None;
        self.inner.state.send_if_modified(|state| match state {
            SessionState::Unloaded => {
                *state = SessionState::Loading;
                true
            }
            SessionState::Loading => {
                refused = Some(SessionError::AlreadyLoading);
                false
            }
            SessionState::Ready => {
                refused = Some(SessionError::AlreadyLoaded);
                false
            }
        });

        if let Some(err) = refused {
            warn!("Ignoring init: {err}");
            return Err(err);
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.load())
            .await
            .unwrap_or(Err(SessionError::WorkerPanicked))
    }

    /// Formats `prompt` with the current template and runs it, returning the full response.
    ///
    /// Fails with [`SessionError::NotLoaded`] if no model is loaded or loading, and with
    /// [`SessionError::InvalidPrompt`] if the prompt cannot be built; neither reaches the model.
    pub async fn generate(&self, prompt: &str) -> Result<String, SessionError> {
        if self.state() == SessionState::Unloaded {
            warn!("Prompt sent with no model loaded");
            return Err(SessionError::NotLoaded);
        }

        let prompt = self.template().format(prompt)?;
        let model = self.ready_model().await?;
        let params = self.params();

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.run(&model, &prompt, &params))
            .await
            .unwrap_or(Err(SessionError::WorkerPanicked))
    }

    /// Releases the model and forgets the conversation. Waits for a load in progress to settle
    /// first.
    ///
    /// Generations already running keep the model alive until they finish; the native
    /// instance is destroyed when the last of them returns.
    pub async fn unload(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state != SessionState::Loading).await;

        let model = self.inner.lock_model().take();
        let Some(model) = model else {
            debug!("Unload requested with no model loaded");
            return;
        };

        self.inner.state.send_replace(SessionState::Unloaded);
        self.reset_context();
        info!("Unloading {} model", model.kind());

        let _ = tokio::task::spawn_blocking(move || drop(model)).await;
    }

    /// Asks the generation in progress, if any, to stop at its next token.
    pub fn stop(&self) {
        debug!("Stop requested");
        self.inner.stop.stop();
    }

    /// Starts a new conversation with the next prompt.
    ///
    /// A prompt running when this is called finishes in the old conversation, and its progress
    /// is discarded.
    pub fn reset_context(&self) {
        let mut mark = lock(&self.inner.mark);
        mark.epoch += 1;
        mark.past_tokens = 0;
    }

    /// Calls `handler` on the dispatcher's consumer for every event of every prompt, until it
    /// is passed to [`SessionManager::unsubscribe`].
    ///
    /// `handler` must not subscribe or unsubscribe handlers itself.
    pub fn subscribe(
        &self,
        handler: impl FnMut(&crate::ModelEvent) + Send + 'static,
    ) -> Subscription {
        self.inner.subscribers.add(handler)
    }

    /// Removes a handler added with [`SessionManager::subscribe`]. Events already queued on the
    /// dispatcher are not delivered to it.
    ///
    /// Returns `false` if the handler was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.subscribers.remove(subscription)
    }

    /// Returns a stream of every event published from now on.
    pub fn events(&self) -> EventStream {
        self.inner.subscribers.stream()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Returns `true` once a model is loaded.
    pub fn is_loaded(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Returns `true` while a model is loading.
    pub fn is_loading(&self) -> bool {
        self.state() == SessionState::Loading
    }

    /// Resolves to the state once it changes from `from`, or immediately if it already has.
    pub async fn wait_for_change(&self, from: SessionState) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| *state != from).await;
        self.state()
    }

    /// Returns the sampling settings applied to the next prompt.
    pub fn params(&self) -> SamplingParams {
        lock(&self.inner.params).clone()
    }

    /// Replaces the sampling settings applied to the next prompt.
    pub fn set_params(&self, params: SamplingParams) {
        *lock(&self.inner.params) = params;
    }

    /// Edits the sampling settings applied to the next prompt in place.
    pub fn update_params(&self, f: impl FnOnce(&mut SamplingParams)) {
        f(&mut lock(&self.inner.params));
    }

    /// Returns the prompt template.
    pub fn template(&self) -> PromptTemplate {
        lock(&self.inner.template).clone()
    }

    /// Replaces the prompt template, returning an error and keeping the previous one if
    /// `template` is invalid.
    pub fn set_template(&self, template: impl Into<PromptTemplate>) -> Result<(), InvalidPrompt> {
        let template = template.into();
        template.validate()?;
        *lock(&self.inner.template) = template;
        Ok(())
    }

    /// Returns the number of tokens processed in the current conversation, as of the last
    /// finished prompt.
    pub fn past_tokens(&self) -> u32 {
        lock(&self.inner.mark).past_tokens
    }

    /// Waits out a load in progress and returns the loaded model.
    async fn ready_model(&self) -> Result<Arc<LlModel>, SessionError> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|state| *state != SessionState::Loading)
            .await
            .map_err(|_| SessionError::NotLoaded)?;

        if state != SessionState::Ready {
            warn!("Model failed to load before the prompt could run");
            return Err(SessionError::NotLoaded);
        }

        self.inner
            .lock_model()
            .clone()
            .ok_or(SessionError::NotLoaded)
    }
}

impl SessionInner {
    /// Runs on a blocking worker with the state already claimed as `Loading`.
    fn load(&self) -> Result<(), SessionError> {
        let started = Instant::now();
        let params = self.load_params.clone();
        let backend = self.backend.clone();

        let result = panic::catch_unwind(AssertUnwindSafe(|| LlModel::load(backend, params)))
            .unwrap_or_else(|_| {
                error!("Model loading panicked");
                Err(LoadError::LoadFailure(self.load_params.path.clone()))
            });

        match result {
            Ok(model) => {
                *self.lock_model() = Some(Arc::new(model));
                self.state.send_replace(SessionState::Ready);
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Session ready"
                );
                Ok(())
            }
            Err(LoadError::AlreadyLoaded) => {
                self.state.send_replace(SessionState::Unloaded);
                warn!("The runtime already hosts a model");
                Err(SessionError::AlreadyLoaded)
            }
            Err(err) => {
                self.state.send_replace(SessionState::Unloaded);
                error!("Failed to load model: {err}");
                Err(err.into())
            }
        }
    }

    /// Runs one prompt on a blocking worker, forwarding its events to the dispatcher.
    fn run(
        &self,
        model: &Arc<LlModel>,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<String, SessionError> {
        let mut conversation = lock(&self.conversation);
        let Conversation {
            ctx,
            model: last,
            epoch: ctx_epoch,
        } = &mut *conversation;

        let epoch = lock(&self.mark).epoch;
        if *ctx_epoch != epoch || !last.ptr_eq(&Arc::downgrade(model)) {
            debug!("Starting a new conversation");
            ctx.reset();
            *last = Arc::downgrade(model);
            *ctx_epoch = epoch;
        }
        ctx.apply(params);
        self.stop.reset();

        let subscribers = self.subscribers.clone();
        let dispatcher = self.dispatcher.clone();
        let result = model.generate_with_stop(prompt, ctx, self.stop.clone(), move |event| {
            let subscribers = subscribers.clone();
            if !dispatcher.execute(move || subscribers.publish(event)) {
                debug!("Dispatcher is gone, dropping event");
            }
        });

        let mut mark = lock(&self.mark);
        if mark.epoch == epoch {
            mark.past_tokens = ctx.past_tokens();
        } else {
            debug!("Conversation was reset while the prompt ran");
        }
        drop(mark);

        result.map_err(|PromptError::ContainsNul(pos)| InvalidPrompt::ContainsNul(pos).into())
    }

    fn lock_model(&self) -> MutexGuard<'_, Option<Arc<LlModel>>> {
        lock(&self.model)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
