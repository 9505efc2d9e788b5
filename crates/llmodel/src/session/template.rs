//! Implements [`PromptTemplate`]

use std::fmt;

use derive_more::Deref;
use thiserror::Error;

/// The placeholder replaced by the user's prompt.
const PLACEHOLDER: &str = "{0}";

/// The instruction template gpt4all-j was tuned on.
pub const DEFAULT_TEMPLATE: &str = "### Instruction:\n\
    The prompt below is a question to answer, a task to complete, or a conversation to respond \
    to; decide which and write an appropriate response.\n\
    ### Prompt:\n\
    {0}\n\
    ### Response:\n";

/// A prompt could not be built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidPrompt {
    /// The template has no `{0}` placeholder.
    #[error("prompt template has no {{0}} placeholder")]
    MissingPlaceholder,

    /// The template has a `{` or `}` that is neither escaped nor part of `{0}`.
    #[error("prompt template has a stray brace at byte {0}")]
    StrayBrace(usize),

    /// The user prompt was empty.
    #[error("prompt is empty")]
    EmptyPrompt,

    /// The formatted prompt cannot be passed to the runtime.
    #[error("prompt contains a NUL byte at position {0}")]
    ContainsNul(usize),
}

/// A piece of a parsed template.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Part {
    Literal(String),
    Prompt,
}

/// A prompt template, such as `"Q: {0}\nA: "`.
///
/// Every `{0}` is replaced with the user's prompt; `{{` and `}}` stand for literal braces. Any
/// other brace makes the template invalid.
#[derive(Clone, Deref, PartialEq, Eq)]
pub struct PromptTemplate {
    #[deref]
    source: String,
    parts: Result<Vec<Part>, InvalidPrompt>,
}

impl PromptTemplate {
    /// Parses `source`. Invalid templates are accepted here and rejected by
    /// [`PromptTemplate::format`], so a bad template never fails configuration.
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let parts = parse(&source);
        Self { source, parts }
    }

    /// Returns `Ok` if prompts can be formatted with this template.
    pub fn validate(&self) -> Result<(), InvalidPrompt> {
        self.parts.as_ref().map(|_| ()).map_err(Clone::clone)
    }

    /// Substitutes `prompt` into this template.
    pub fn format(&self, prompt: &str) -> Result<String, InvalidPrompt> {
        if prompt.is_empty() {
            return Err(InvalidPrompt::EmptyPrompt);
        }

        let parts = self.parts.as_ref().map_err(Clone::clone)?;
        let mut out = String::with_capacity(self.source.len() + prompt.len());

        for part in parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Prompt => out.push_str(prompt),
            }
        }

        if let Some(pos) = out.find('\0') {
            return Err(InvalidPrompt::ContainsNul(pos));
        }

        Ok(out)
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE)
    }
}

impl From<&str> for PromptTemplate {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for PromptTemplate {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

impl fmt::Debug for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PromptTemplate").field(&self.source).finish()
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse(source: &str) -> Result<Vec<Part>, InvalidPrompt> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut has_placeholder = false;
    let mut chars = source.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' if source[pos..].starts_with(PLACEHOLDER) => {
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                parts.push(Part::Prompt);
                has_placeholder = true;
                chars.nth(PLACEHOLDER.len() - 2);
            }
            '{' | '}' => {
                if chars.next_if(|&(_, next)| next == c).is_none() {
                    return Err(InvalidPrompt::StrayBrace(pos));
                }
                literal.push(c);
            }
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        parts.push(Part::Literal(literal));
    }

    if has_placeholder {
        Ok(parts)
    } else {
        Err(InvalidPrompt::MissingPlaceholder)
    }
}
