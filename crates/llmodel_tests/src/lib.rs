//! Test harness for [`llmodel`][llmodel] against the real runtime.
//!
//! These tests only run with the `native` feature, and expect one or more gpt4all `.bin` models
//! to be made available in a directory specified in the `LLMODEL_TEST_MODELS` environment
//! variable. The architecture of each model is guessed from its file name.
//!
//! [llmodel]: https://docs.rs/llmodel
