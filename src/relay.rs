//! Stream Relay: sanitizes raw model output before it reaches the UI.
//!
//! Two things must never reach the UI verbatim: partial/complete inline
//! tool-call JSON (some dialects and smaller local models emit tool calls as
//! JSON embedded in plain content rather than structured deltas) and the
//! model's private reasoning channel, where the provider exposes one. Both
//! are replaced with a short placeholder status; everything else passes
//! through untouched.

/// A sanitized unit of relay output.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Plain text, safe to append to the visible transcript.
    Text(String),
    /// A transient placeholder shown in place of suppressed content.
    Status(&'static str),
    /// A dynamic, one-off status line (e.g. rate-limit retry countdowns)
    /// that can't be expressed as a `&'static str`.
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RelayState {
    Plain,
    /// Inside a `{...}`/`[...]` span, at the given brace/bracket depth.
    InJson(u32),
    InReasoning,
}

const REASONING_START: &str = "<|reasoning|>";
const REASONING_END: &str = "<|/reasoning|>";

/// Longest suffix of `buf` that is also a prefix of `pattern` — used to hold
/// back characters that might be the start of a sentinel split across two
/// stream chunks, without delaying everything that obviously isn't.
fn partial_suffix_match_len(buf: &str, pattern: &str) -> usize {
    let max_len = buf.len().min(pattern.len().saturating_sub(1));
    for len in (1..=max_len).rev() {
        if buf.ends_with(&pattern[..len]) {
            return len;
        }
    }
    0
}

/// Stateful per-turn relay. Feed it streaming text deltas; it emits
/// [`RelayEvent`]s sanitized of inline tool-call JSON and reasoning-channel
/// content.
#[derive(Debug, Default)]
pub struct StreamRelay {
    state: StateWithBuffers,
}

#[derive(Debug, Default)]
struct StateWithBuffers {
    state: RelayStateHolder,
    plain_acc: String,
    reason_acc: String,
}

// `RelayState` has no sensible Default; wrap it so `StateWithBuffers` can derive one.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RelayStateHolder(RelayState);

impl Default for RelayStateHolder {
    fn default() -> Self {
        RelayStateHolder(RelayState::Plain)
    }
}

impl StreamRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one streaming delta, returning zero or more sanitized events.
    ///
    /// Contiguous plain-text runs are coalesced into a single [`RelayEvent::Text`]
    /// rather than emitted one character at a time.
    pub fn feed(&mut self, delta: &str) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        let mut ready = String::new();

        for ch in delta.chars() {
            match self.state.state.0 {
                RelayState::Plain => self.feed_plain(ch, &mut ready, &mut events),
                RelayState::InJson(depth) => self.feed_json(ch, depth),
                RelayState::InReasoning => self.feed_reasoning(ch),
            }
        }

        if !ready.is_empty() {
            events.push(RelayEvent::Text(ready));
        }

        events
    }

    fn feed_plain(&mut self, ch: char, ready: &mut String, events: &mut Vec<RelayEvent>) {
        if matches!(ch, '{' | '[') {
            ready.push_str(&self.state.plain_acc);
            self.state.plain_acc.clear();
            if !ready.is_empty() {
                events.push(RelayEvent::Text(std::mem::take(ready)));
            }
            self.state.state.0 = RelayState::InJson(1);
            events.push(RelayEvent::Status("Executing…"));
            return;
        }

        self.state.plain_acc.push(ch);

        if self.state.plain_acc.ends_with(REASONING_START) {
            let keep = self.state.plain_acc.len() - REASONING_START.len();
            ready.push_str(&self.state.plain_acc[..keep]);
            self.state.plain_acc.clear();
            if !ready.is_empty() {
                events.push(RelayEvent::Text(std::mem::take(ready)));
            }
            self.state.state.0 = RelayState::InReasoning;
            events.push(RelayEvent::Status("Thinking…"));
            return;
        }

        let hold = partial_suffix_match_len(&self.state.plain_acc, REASONING_START);
        let flush_to = self.state.plain_acc.len() - hold;
        if flush_to > 0 {
            let flushed: String = self.state.plain_acc.drain(..flush_to).collect();
            ready.push_str(&flushed);
        }
    }

    fn feed_json(&mut self, ch: char, depth: u32) {
        let new_depth = match ch {
            '{' | '[' => depth + 1,
            '}' | ']' => depth.saturating_sub(1),
            _ => depth,
        };

        self.state.state.0 = if new_depth == 0 { RelayState::Plain } else { RelayState::InJson(new_depth) };
    }

    fn feed_reasoning(&mut self, ch: char) {
        self.state.reason_acc.push(ch);
        if self.state.reason_acc.ends_with(REASONING_END) {
            self.state.reason_acc.clear();
            self.state.state.0 = RelayState::Plain;
        }
    }

    /// Flush any held-back plain text at end of stream (a partial sentinel
    /// match that never completed is ordinary text after all).
    pub fn finish(&mut self) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        if !self.state.plain_acc.is_empty() {
            events.push(RelayEvent::Text(std::mem::take(&mut self.state.plain_acc)));
        }
        events
    }
}
