//! Implements [`PromptContext`], which configures and tracks a conversation, and
//! [`SamplingParams`], the user-facing subset of it.

use std::ptr;

use llmodel_sys::llmodel_prompt_context;

/// The sampling settings of a conversation, as an application would expose them to its users.
///
/// These are plain values; they are normalized when applied to a [`PromptContext`].
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    /// Number of tokens possible in the context window (`n_ctx`).
    pub context_window: u32,

    /// Max number of tokens to predict for the next prompt (`n_predict`).
    pub max_tokens_predict: u32,

    /// Top k logits to sample from.
    pub top_k: u32,

    /// Nucleus sampling probability threshold, in `[0, 1]`.
    pub top_p: f32,

    /// Temperature to adjust the model's output distribution, in `[0, 1]`. Bigger values give
    /// more random results.
    pub temperature: f32,

    /// Number of predictions to generate in parallel (`n_batch`).
    pub batch_size: u32,

    /// Penalty factor for repeated tokens.
    pub repeat_penalty: f32,

    /// Last n tokens to penalize.
    pub repeat_last_n: u32,

    /// Fraction of the context to erase when the context window is exceeded, in `[0, 1]`.
    pub context_erase: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            context_window: 4096,
            max_tokens_predict: 256,
            top_k: 40,
            top_p: 0.95,
            temperature: 0.27,
            batch_size: 1,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            context_erase: 0.5,
        }
    }
}

/// The part of a [`PromptContext`] owned by the engine.
///
/// `logits` and `tokens` point into buffers owned by the model instance that produced them;
/// they are never dereferenced on this side and only ever handed back to that same instance.
#[derive(Clone, Copy, Debug)]
struct ConversationState {
    past_tokens: i32,
    logits: *mut f32,
    logits_size: usize,
    tokens: *mut i32,
    tokens_size: usize,
}

// SAFETY: the pointers are opaque on this side; the only code reading them is the native model
// that owns them, which is called under that model's lock.
unsafe impl Send for ConversationState {}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            past_tokens: 0,
            logits: ptr::null_mut(),
            logits_size: 0,
            tokens: ptr::null_mut(),
            tokens_size: 0,
        }
    }
}

/// The inference settings and running state of a single conversation.
///
/// Passing the same context to consecutive [`crate::LlModel::generate`] calls continues the
/// conversation; call [`PromptContext::reset`] (or create a new context) to start over.
/// Replacing the settings between calls does not touch the conversation state.
///
/// A context is bound to the model it was last used with. After that model is unloaded, the
/// context must be reset before it is used again.
#[derive(Clone, Debug)]
pub struct PromptContext {
    context_window: u32,
    max_tokens_predict: u32,
    top_k: u32,
    top_p: f32,
    temperature: f32,
    batch_size: u32,
    repeat_penalty: f32,
    repeat_last_n: u32,
    context_erase: f32,
    state: ConversationState,
}

/// Clamps `value` into `[0, 1]`, mapping NaN to `0`.
fn unit_interval(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn to_c_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl Default for PromptContext {
    fn default() -> Self {
        Self {
            context_window: 4096,
            max_tokens_predict: 64,
            top_k: 40,
            top_p: 0.95,
            temperature: 0.28,
            batch_size: 1,
            repeat_penalty: 1.1,
            repeat_last_n: 10,
            context_erase: 0.5,
            state: ConversationState::default(),
        }
    }
}

impl PromptContext {
    /// Creates a fresh context with its settings taken from `params`.
    pub fn new(params: &SamplingParams) -> Self {
        let mut ctx = Self::default();
        ctx.apply(params);
        ctx
    }

    /// Number of tokens possible in the context window.
    pub fn context_window(&self) -> u32 {
        self.context_window
    }

    /// Sets the context window size. Values below 1 are raised to 1.
    pub fn set_context_window(&mut self, value: u32) {
        self.context_window = value.max(1);
    }

    /// Max number of tokens to predict per call.
    pub fn max_tokens_predict(&self) -> u32 {
        self.max_tokens_predict
    }

    /// Sets the max number of tokens to predict. Values below 1 are raised to 1.
    pub fn set_max_tokens_predict(&mut self, value: u32) {
        self.max_tokens_predict = value.max(1);
    }

    /// Top k logits to sample from.
    pub fn top_k(&self) -> u32 {
        self.top_k
    }

    /// Sets the top k logits to sample from.
    pub fn set_top_k(&mut self, value: u32) {
        self.top_k = value;
    }

    /// Nucleus sampling probability threshold.
    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    /// Sets the nucleus sampling threshold, clamped into `[0, 1]`.
    pub fn set_top_p(&mut self, value: f32) {
        self.top_p = unit_interval(value);
    }

    /// Sampling temperature.
    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Sets the sampling temperature, clamped into `[0, 1]`.
    pub fn set_temperature(&mut self, value: f32) {
        self.temperature = unit_interval(value);
    }

    /// Number of predictions to generate in parallel.
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Sets the batch size. Values below 1 are raised to 1.
    pub fn set_batch_size(&mut self, value: u32) {
        self.batch_size = value.max(1);
    }

    /// Penalty factor for repeated tokens.
    pub fn repeat_penalty(&self) -> f32 {
        self.repeat_penalty
    }

    /// Sets the repeat penalty. Negative values and NaN become `0`.
    pub fn set_repeat_penalty(&mut self, value: f32) {
        self.repeat_penalty = if value.is_nan() { 0.0 } else { value.max(0.0) };
    }

    /// Last n tokens to penalize.
    pub fn repeat_last_n(&self) -> u32 {
        self.repeat_last_n
    }

    /// Sets how many of the last tokens are penalized.
    pub fn set_repeat_last_n(&mut self, value: u32) {
        self.repeat_last_n = value;
    }

    /// Fraction of the context erased when the window overflows.
    pub fn context_erase(&self) -> f32 {
        self.context_erase
    }

    /// Sets the context erase fraction, clamped into `[0, 1]`.
    pub fn set_context_erase(&mut self, value: f32) {
        self.context_erase = unit_interval(value);
    }

    /// Copies every setting from `params` into this context, leaving the conversation state
    /// untouched.
    pub fn apply(&mut self, params: &SamplingParams) {
        self.set_context_window(params.context_window);
        self.set_max_tokens_predict(params.max_tokens_predict);
        self.set_top_k(params.top_k);
        self.set_top_p(params.top_p);
        self.set_temperature(params.temperature);
        self.set_batch_size(params.batch_size);
        self.set_repeat_penalty(params.repeat_penalty);
        self.set_repeat_last_n(params.repeat_last_n);
        self.set_context_erase(params.context_erase);
    }

    /// Returns the current settings of this context.
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            context_window: self.context_window,
            max_tokens_predict: self.max_tokens_predict,
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            batch_size: self.batch_size,
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: self.repeat_last_n,
            context_erase: self.context_erase,
        }
    }

    /// Returns the number of tokens the engine has processed in this conversation.
    pub fn past_tokens(&self) -> u32 {
        self.state.past_tokens.max(0) as u32
    }

    /// Returns the number of tokens currently held in the engine's context window.
    pub fn context_tokens(&self) -> usize {
        self.state.tokens_size
    }

    /// Forgets the conversation, so the next call starts from an empty context.
    pub fn reset(&mut self) {
        self.state = ConversationState::default();
    }

    /// Builds the native record for a prompt call.
    pub(crate) fn to_raw(&self) -> llmodel_prompt_context {
        llmodel_prompt_context {
            logits: self.state.logits,
            logits_size: self.state.logits_size,
            tokens: self.state.tokens,
            tokens_size: self.state.tokens_size,
            n_past: self.state.past_tokens,
            n_ctx: to_c_int(self.context_window),
            n_predict: to_c_int(self.max_tokens_predict),
            top_k: to_c_int(self.top_k),
            top_p: self.top_p,
            temp: self.temperature,
            n_batch: to_c_int(self.batch_size),
            repeat_penalty: self.repeat_penalty,
            repeat_last_n: to_c_int(self.repeat_last_n),
            context_erase: self.context_erase,
        }
    }

    /// Takes over the engine-owned fields of `raw` after a prompt call. Settings are not read
    /// back.
    pub(crate) fn absorb(&mut self, raw: &llmodel_prompt_context) {
        self.state = ConversationState {
            past_tokens: raw.n_past,
            logits: raw.logits,
            logits_size: raw.logits_size,
            tokens: raw.tokens,
            tokens_size: raw.tokens_size,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_normalize_their_inputs() {
        let mut ctx = PromptContext::default();

        ctx.set_top_p(1.5);
        ctx.set_temperature(-0.2);
        ctx.set_context_erase(f32::NAN);
        ctx.set_repeat_penalty(-3.0);
        ctx.set_context_window(0);
        ctx.set_max_tokens_predict(0);
        ctx.set_batch_size(0);

        assert_eq!(ctx.top_p(), 1.0);
        assert_eq!(ctx.temperature(), 0.0);
        assert_eq!(ctx.context_erase(), 0.0);
        assert_eq!(ctx.repeat_penalty(), 0.0);
        assert_eq!(ctx.context_window(), 1);
        assert_eq!(ctx.max_tokens_predict(), 1);
        assert_eq!(ctx.batch_size(), 1);
    }

    #[test]
    fn apply_keeps_conversation_state() {
        let mut ctx = PromptContext::default();
        let mut raw = ctx.to_raw();
        raw.n_past = 17;
        raw.tokens_size = 17;
        ctx.absorb(&raw);

        let params = SamplingParams {
            top_k: 5,
            temperature: 0.9,
            ..SamplingParams::default()
        };
        ctx.apply(&params);

        assert_eq!(ctx.past_tokens(), 17);
        assert_eq!(ctx.context_tokens(), 17);
        assert_eq!(ctx.sampling_params(), params);
    }

    #[test]
    fn absorb_ignores_settings_written_by_the_engine() {
        let mut ctx = PromptContext::new(&SamplingParams::default());
        let before = ctx.sampling_params();

        let mut raw = ctx.to_raw();
        raw.n_past = 12;
        raw.top_k = 1;
        raw.temp = 0.0;
        raw.n_predict = 3;
        ctx.absorb(&raw);

        assert_eq!(ctx.sampling_params(), before);
        assert_eq!(ctx.past_tokens(), 12);
    }

    #[test]
    fn raw_record_carries_settings_and_state() {
        let mut ctx = PromptContext::default();
        ctx.set_context_window(u32::MAX);

        let raw = ctx.to_raw();
        assert_eq!(raw.n_ctx, i32::MAX);
        assert_eq!(raw.n_predict, 64);
        assert_eq!(raw.top_k, 40);
        assert_eq!(raw.repeat_last_n, 10);
        assert_eq!(raw.n_past, 0);
        assert!(raw.tokens.is_null());
        assert!(raw.logits.is_null());
    }

    #[test]
    fn reset_clears_state() {
        let mut ctx = PromptContext::default();
        let mut raw = ctx.to_raw();
        raw.n_past = 40;
        ctx.absorb(&raw);

        ctx.reset();
        assert_eq!(ctx.past_tokens(), 0);
        assert_eq!(ctx.context_tokens(), 0);
    }
}
