//! A scripted stand-in for the native runtime.

#![allow(dead_code)]

use std::ffi::CStr;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use llmodel::{
    Backend, LoadError, ModelKind, ModelSlot, PromptCallbacks, RawModel, RawPromptContext, Token,
};

/// What the stub runtime does when asked to load or prompt.
#[derive(Clone, Debug, Default)]
pub struct Script {
    /// How long loading blocks.
    pub load_delay: Duration,

    /// Whether loading reports a failure.
    pub fail_load: bool,

    /// Architectures the runtime refuses to create; empty accepts all of them.
    pub supported: Vec<ModelKind>,

    /// The pieces generated for every prompt, in order.
    pub response: Vec<Vec<u8>>,

    /// How long each generated piece takes.
    pub token_delay: Duration,

    /// Whether to report a context recalculation before generating.
    pub recalculate: bool,
}

impl Script {
    pub fn answering(pieces: &[&str]) -> Self {
        Self {
            response: pieces.iter().map(|piece| piece.as_bytes().to_vec()).collect(),
            ..Self::default()
        }
    }
}

/// A prompt the stub runtime served.
#[derive(Clone, Debug)]
pub struct PromptRecord {
    pub prompt: String,
    pub past_tokens: i32,
    pub top_k: i32,
    pub entered: Instant,
    pub exited: Instant,
}

/// Everything the stub runtime observed.
#[derive(Debug, Default)]
pub struct Calls {
    pub creates: AtomicUsize,
    pub loads: AtomicUsize,
    pub prompts: AtomicUsize,
    pub destroys: AtomicUsize,
    pub threads: AtomicUsize,
    pub records: Mutex<Vec<PromptRecord>>,

    /// The raw bytes of every path handed to `load`.
    pub paths: Mutex<Vec<Vec<u8>>>,
}

impl Calls {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<PromptRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<Vec<u8>> {
        self.paths.lock().unwrap().clone()
    }
}

pub struct StubBackend {
    slot: ModelSlot,
    script: Script,
    pub calls: Arc<Calls>,
}

impl StubBackend {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            slot: ModelSlot::new(),
            script,
            calls: Arc::new(Calls::default()),
        })
    }
}

impl Backend for StubBackend {
    fn create(&self, kind: ModelKind) -> Result<Box<dyn RawModel>, LoadError> {
        if !self.script.supported.is_empty() && !self.script.supported.contains(&kind) {
            return Err(LoadError::UnknownArchitecture(kind.to_string()));
        }

        self.calls.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubModel {
            script: self.script.clone(),
            calls: self.calls.clone(),
            loaded: false,
        }))
    }

    fn slot(&self) -> &ModelSlot {
        &self.slot
    }
}

struct StubModel {
    script: Script,
    calls: Arc<Calls>,
    loaded: bool,
}

impl Drop for StubModel {
    fn drop(&mut self) {
        self.calls.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

impl RawModel for StubModel {
    fn load(&mut self, path: &CStr) -> bool {
        self.calls.loads.fetch_add(1, Ordering::SeqCst);
        self.calls.paths.lock().unwrap().push(path.to_bytes().to_vec());
        thread::sleep(self.script.load_delay);
        self.loaded = !self.script.fail_load;
        self.loaded
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn set_thread_count(&mut self, threads: u32) {
        self.calls.threads.store(threads as usize, Ordering::SeqCst);
    }

    fn thread_count(&self) -> Option<u32> {
        Some(self.calls.threads.load(Ordering::SeqCst) as u32)
    }

    fn prompt(
        &mut self,
        prompt: &CStr,
        ctx: &mut RawPromptContext,
        callbacks: &mut dyn PromptCallbacks,
    ) {
        self.calls.prompts.fetch_add(1, Ordering::SeqCst);
        let entered = Instant::now();
        let past_tokens = ctx.n_past;
        let top_k = ctx.top_k;

        let prompt = prompt.to_string_lossy().into_owned();
        let words = prompt.split_whitespace().count() as i32;
        for i in 0..words {
            callbacks.prompt_token(Token(i));
        }
        ctx.n_past += words;

        if self.script.recalculate {
            callbacks.recalculate(true);
            callbacks.recalculate(false);
        }

        for (i, piece) in self.script.response.iter().enumerate() {
            thread::sleep(self.script.token_delay);
            ctx.n_past += 1;
            if !callbacks.response_token(Token(1000 + i as i32), piece) {
                break;
            }
        }

        ctx.tokens_size = ctx.n_past as usize;
        // The runtime is free to scribble over the settings.
        ctx.top_k = 1;
        ctx.temp = 0.0;

        self.calls.records.lock().unwrap().push(PromptRecord {
            prompt,
            past_tokens,
            top_k,
            entered,
            exited: Instant::now(),
        });
    }
}

/// A readable file standing in for model weights.
pub fn model_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"ggml").unwrap();
    file
}
