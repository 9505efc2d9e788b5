//! Turns the native prompt callbacks into [`ModelEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::pending::PendingResponse;
use crate::Token;

/// Receives the callbacks a native prompt call drives, in the order the engine fires them.
///
/// Every method returns whether the engine should keep going; `false` asks it to stop as soon
/// as it can.
pub trait PromptCallbacks {
    /// A token of the input prompt was ingested.
    fn prompt_token(&mut self, token: Token) -> bool;

    /// A token was generated. `piece` only lives for the duration of the call.
    fn response_token(&mut self, token: Token, piece: &[u8]) -> bool;

    /// The engine started (`true`) or finished (`false`) recalculating its context.
    fn recalculate(&mut self, is_recalculating: bool) -> bool;
}

/// A notification produced while a prompt is being processed.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelEvent {
    /// A token of the input prompt was accepted.
    PromptToken(Token),

    /// A token was generated, with its raw bytes.
    ResponseToken {
        /// The generated token.
        token: Token,

        /// The bytes of the token, which may end in the middle of a character.
        bytes: Vec<u8>,
    },

    /// New text became decodable.
    ResponseUpdated {
        /// The text added since the previous update.
        delta: String,

        /// All text generated so far.
        text: String,
    },

    /// Generation finished, carrying the full response.
    ResponseComplete(String),

    /// The engine started or finished recalculating its context.
    Recalculating(bool),
}

/// A shared flag asking an in-flight generation to stop at the next callback.
#[derive(Clone, Debug, Default)]
pub struct StopSwitch(Arc<AtomicBool>);

impl StopSwitch {
    /// Creates a switch in the "keep going" position.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if a stop was requested and not yet reset.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Puts the switch back in the "keep going" position.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Implements [`PromptCallbacks`] for a single generation, accumulating the response and
/// reporting every callback to `on_event`.
pub struct CallbackBridge<F> {
    pending: PendingResponse,
    on_event: F,
    stop: Option<StopSwitch>,
    prompt_tokens: usize,
    response_tokens: usize,
}

impl<F> CallbackBridge<F>
where
    F: FnMut(ModelEvent),
{
    /// Creates a bridge reporting to `on_event`.
    pub fn new(on_event: F) -> Self {
        Self {
            pending: PendingResponse::new(),
            on_event,
            stop: None,
            prompt_tokens: 0,
            response_tokens: 0,
        }
    }

    /// Makes every callback answer "stop" once `stop` is flipped.
    pub fn with_stop(mut self, stop: StopSwitch) -> Self {
        self.stop = Some(stop);
        self
    }

    /// The text decoded so far.
    pub fn text(&self) -> &str {
        self.pending.text()
    }

    /// Number of prompt tokens reported so far.
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Number of response tokens reported so far.
    pub fn response_tokens(&self) -> usize {
        self.response_tokens
    }

    /// Flushes held-back bytes, reports [`ModelEvent::ResponseComplete`] and returns the full
    /// response.
    pub fn finish(mut self) -> String {
        let delta = self.pending.finish().to_owned();
        if !delta.is_empty() {
            let text = self.pending.text().to_owned();
            (self.on_event)(ModelEvent::ResponseUpdated { delta, text });
        }

        let text = self.pending.into_string();
        debug!(
            prompt_tokens = self.prompt_tokens,
            response_tokens = self.response_tokens,
            "Response complete"
        );
        (self.on_event)(ModelEvent::ResponseComplete(text.clone()));

        text
    }

    fn keep_going(&self) -> bool {
        !self.stop.as_ref().is_some_and(StopSwitch::is_stopped)
    }
}

impl<F> PromptCallbacks for CallbackBridge<F>
where
    F: FnMut(ModelEvent),
{
    fn prompt_token(&mut self, token: Token) -> bool {
        self.prompt_tokens += 1;
        (self.on_event)(ModelEvent::PromptToken(token));
        self.keep_going()
    }

    fn response_token(&mut self, token: Token, piece: &[u8]) -> bool {
        self.response_tokens += 1;
        trace!(token = token.0, len = piece.len(), "Response token");

        let bytes = piece.to_vec();
        let delta = self.pending.push(&bytes).to_owned();
        (self.on_event)(ModelEvent::ResponseToken { token, bytes });

        if !delta.is_empty() {
            let text = self.pending.text().to_owned();
            (self.on_event)(ModelEvent::ResponseUpdated { delta, text });
        }

        self.keep_going()
    }

    fn recalculate(&mut self, is_recalculating: bool) -> bool {
        debug!(is_recalculating, "Context recalculation");
        (self.on_event)(ModelEvent::Recalculating(is_recalculating));
        self.keep_going()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_full_text_after_each_token() {
        let mut events = Vec::new();
        let mut bridge = CallbackBridge::new(|event| events.push(event));

        assert!(bridge.prompt_token(Token(7)));
        assert!(bridge.response_token(Token(1), b"4"));
        assert!(bridge.response_token(Token(2), b"\n"));
        assert_eq!(bridge.finish(), "4\n");

        let updates: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ModelEvent::ResponseUpdated { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(updates, ["4", "4\n"]);
        assert_eq!(events.first(), Some(&ModelEvent::PromptToken(Token(7))));
        assert_eq!(
            events.last(),
            Some(&ModelEvent::ResponseComplete("4\n".to_owned()))
        );
    }

    #[test]
    fn split_characters_never_reach_updates() {
        let bytes = "añ🦙".as_bytes();
        let mut events = Vec::new();
        let mut bridge = CallbackBridge::new(|event| events.push(event));

        for (i, byte) in bytes.iter().enumerate() {
            bridge.response_token(Token(i as i32), std::slice::from_ref(byte));
        }
        assert_eq!(bridge.finish(), "añ🦙");

        let mut raw = 0;
        for event in &events {
            match event {
                ModelEvent::ResponseToken { bytes, .. } => raw += bytes.len(),
                ModelEvent::ResponseUpdated { delta, text } => {
                    assert!(!delta.is_empty());
                    assert!(!text.contains(char::REPLACEMENT_CHARACTER));
                    assert!("añ🦙".starts_with(text.as_str()));
                }
                _ => {}
            }
        }
        assert_eq!(raw, bytes.len());
    }

    #[test]
    fn finish_reports_flushed_bytes() {
        let mut events = Vec::new();
        let mut bridge = CallbackBridge::new(|event| events.push(event));

        bridge.response_token(Token(0), &"é".as_bytes()[..1]);
        assert_eq!(bridge.finish(), "\u{FFFD}");
        assert_eq!(
            events[1],
            ModelEvent::ResponseUpdated {
                delta: "\u{FFFD}".to_owned(),
                text: "\u{FFFD}".to_owned(),
            }
        );
    }

    #[test]
    fn recalculation_is_forwarded() {
        let mut events = Vec::new();
        let mut bridge = CallbackBridge::new(|event| events.push(event));

        assert!(bridge.recalculate(true));
        assert!(bridge.recalculate(false));
        drop(bridge);

        assert_eq!(
            events,
            [ModelEvent::Recalculating(true), ModelEvent::Recalculating(false)]
        );
    }

    #[test]
    fn stop_switch_turns_callbacks_off() {
        let stop = StopSwitch::new();
        let mut bridge = CallbackBridge::new(|_| {}).with_stop(stop.clone());

        assert!(bridge.response_token(Token(0), b"a"));
        stop.stop();
        assert!(!bridge.response_token(Token(1), b"b"));
        assert!(!bridge.prompt_token(Token(2)));
        assert!(!bridge.recalculate(true));

        stop.reset();
        assert!(bridge.response_token(Token(3), b"c"));
        assert_eq!(bridge.text(), "abc");
        assert_eq!(bridge.response_tokens(), 3);
    }
}
