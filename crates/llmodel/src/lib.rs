//! High-level bindings to the `llmodel` C API, for running GPT-J, LLaMA and MPT models locally
//! and streaming their responses token by token into an application's event loop.
//!
//! **This crate is still in an early state, and breaking changes may occur between versions.**
//!
//! There are two layers. [`LlModel`] owns one loaded model and runs blocking prompts against
//! it. [`SessionManager`] wraps that in an async lifecycle, formats prompts through a
//! [`PromptTemplate`], and republishes every [`ModelEvent`] on a [`Dispatcher`] so that your UI
//! thread sees them in order:
//!
//! ```no_run
//! # #[cfg(feature = "native")]
//! # async fn demo() -> Result<(), llmodel::SessionError> {
//! use std::sync::Arc;
//!
//! use llmodel::{Dispatcher, ModelEvent, NativeBackend, SessionConfig, SessionManager};
//!
//! let mut dispatcher = Dispatcher::new();
//! let session = SessionManager::new(
//!     Arc::new(NativeBackend),
//!     SessionConfig::default(),
//!     dispatcher.handle(),
//! );
//!
//! session.subscribe(|event| {
//!     if let ModelEvent::ResponseUpdated { text, .. } = event {
//!         println!("{text}");
//!     }
//! });
//!
//! session.init().await?;
//! let answer = tokio::spawn({
//!     let session = session.clone();
//!     async move { session.generate("Why is the sky blue?").await }
//! });
//!
//! // Somewhere in your frame loop:
//! while !answer.is_finished() {
//!     dispatcher.update();
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Dependencies
//!
//! This crate depends on (and builds atop) [`llmodel_sys`]. The real runtime is only bound with
//! the `native` feature; see [`llmodel_sys`] for how the library is located.
//!
//! Load and inference timings are reported through [`tracing`][tracing]. If you're getting stuck,
//! setting up [`tracing`][tracing] for more debug information should be at the top of your
//! troubleshooting list!
//!
//! ## Panic Safety
//!
//! Panics raised by event handlers never unwind into the native runtime; they are caught, logged
//! and turned into a request to stop generating.
//!
//! [tracing]: https://docs.rs/tracing/latest/tracing/

#![warn(missing_docs)]

pub use bridge::*;
pub use context::*;
pub use dispatcher::*;
pub use model::*;
pub use pending::PendingResponse;
pub use session::*;

mod bridge;
mod context;
mod detail;
mod dispatcher;
mod model;
mod pending;
mod session;

/// A single token produced or consumed by a model.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Token(pub i32);
