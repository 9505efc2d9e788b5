//! Implements [`ModelKind`] and [`LoadParams`]

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::LoadError;

/// The architecture of a model file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ModelKind {
    /// GPT-J
    GptJ,

    /// LLaMA
    Llama,

    /// MPT
    Mpt,
}

impl ModelKind {
    /// Every architecture the native runtime knows how to create.
    pub const ALL: [ModelKind; 3] = [ModelKind::GptJ, ModelKind::Llama, ModelKind::Mpt];

    /// The lowercase name of this architecture.
    pub fn name(self) -> &'static str {
        match self {
            ModelKind::GptJ => "gptj",
            ModelKind::Llama => "llama",
            ModelKind::Mpt => "mpt",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "gptj" => Ok(ModelKind::GptJ),
            "llama" => Ok(ModelKind::Llama),
            "mpt" => Ok(ModelKind::Mpt),
            _ => Err(LoadError::UnknownArchitecture(s.to_owned())),
        }
    }
}

/// Parameters for loading a model.
#[derive(Clone, Debug)]
pub struct LoadParams {
    /// The architecture of the model file.
    pub kind: ModelKind,

    /// Path to the model weights.
    pub path: PathBuf,

    /// Number of threads to run inference with; `None` leaves the runtime's default alone.
    pub threads: Option<u32>,
}

impl LoadParams {
    /// Parameters for loading the `kind` model at `path` with the default thread count.
    pub fn new(kind: ModelKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            threads: Some(default_threads()),
        }
    }
}

/// One thread per physical core, leaving one for the rest of the application.
pub(crate) fn default_threads() -> u32 {
    (num_cpus::get_physical() as u32).saturating_sub(1).max(1)
}
