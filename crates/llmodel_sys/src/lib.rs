//! System-level, **highly** `unsafe` bindings to the
//! [gpt4all](https://github.com/nomic-ai/gpt4all) `llmodel` C API.
//!
//! There's a **lot** of nuance here; for a safe alternative, see `llmodel`.
//!
//! The declarations mirror `llmodel_c.h` by hand. The API surface is small (per-architecture
//! create/destroy, a path-based load, thread control and a single `prompt` entry point), and
//! [`llmodel_prompt_context`] is a wire contract with the native library: its field order and
//! sizes must never change independently of the C header.
//!
//! Linking is configured by `build.rs`:
//!
//! * `LLMODEL_LIB_DIR` points at a directory holding a prebuilt `llmodel` library.
//! * `LLMODEL_SOURCE_DIR` points at a `gpt4all-backend` checkout, which is then built with
//!   [the `cmake` crate](https://docs.rs/cmake/).
//! * `LLMODEL_STATIC` links the library statically instead of dynamically.
//!
//! With neither directory set nothing is linked, and only the type definitions are usable.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::ffi::{c_char, c_void};

extern crate link_cplusplus;

/// An opaque pointer to a model instance on the native side.
pub type llmodel_model = *mut c_void;

/// The parameters and running state of a prompt.
///
/// The native side reads the sampling fields, and overwrites `logits`, `tokens`, their sizes
/// and `n_past` at the end of every call. The two buffers point into memory owned by the model
/// instance and stay valid until the next call on that instance, or until it is destroyed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct llmodel_prompt_context {
    /// logits of current context
    pub logits: *mut f32,
    /// the size of the raw logits vector
    pub logits_size: usize,
    /// current tokens in the context window
    pub tokens: *mut i32,
    /// the size of the raw tokens vector
    pub tokens_size: usize,
    /// number of tokens in past conversation
    pub n_past: i32,
    /// number of tokens possible in context window
    pub n_ctx: i32,
    /// number of tokens to predict
    pub n_predict: i32,
    /// top k logits to sample from
    pub top_k: i32,
    /// nucleus sampling probability threshold
    pub top_p: f32,
    /// temperature to adjust model's output distribution
    pub temp: f32,
    /// number of predictions to generate in parallel
    pub n_batch: i32,
    /// penalty factor for repeated tokens
    pub repeat_penalty: f32,
    /// last n tokens to penalize
    pub repeat_last_n: i32,
    /// percent of context to erase if we exceed the context window
    pub context_erase: f32,
}

/// Called once per token of the input prompt. Return `false` to stop processing.
pub type llmodel_prompt_callback = Option<unsafe extern "C" fn(token_id: i32) -> bool>;

/// Called once per generated token with a NUL-terminated piece that is only valid for the
/// duration of the call. Return `false` to stop generating.
pub type llmodel_response_callback =
    Option<unsafe extern "C" fn(token_id: i32, response: *const c_char) -> bool>;

/// Called when the model starts or stops recalculating its context.
pub type llmodel_recalculate_callback =
    Option<unsafe extern "C" fn(is_recalculating: bool) -> bool>;

extern "C" {
    pub fn llmodel_gptj_create() -> llmodel_model;
    pub fn llmodel_gptj_destroy(gptj: llmodel_model);

    pub fn llmodel_mpt_create() -> llmodel_model;
    pub fn llmodel_mpt_destroy(mpt: llmodel_model);

    pub fn llmodel_llama_create() -> llmodel_model;
    pub fn llmodel_llama_destroy(llama: llmodel_model);

    pub fn llmodel_loadModel(model: llmodel_model, model_path: *const c_char) -> bool;
    pub fn llmodel_isModelLoaded(model: llmodel_model) -> bool;

    pub fn llmodel_prompt(
        model: llmodel_model,
        prompt: *const c_char,
        prompt_callback: llmodel_prompt_callback,
        response_callback: llmodel_response_callback,
        recalculate_callback: llmodel_recalculate_callback,
        ctx: *mut llmodel_prompt_context,
    );

    pub fn llmodel_setThreadCount(model: llmodel_model, n_threads: i32);
    pub fn llmodel_threadCount(model: llmodel_model) -> i32;
}
