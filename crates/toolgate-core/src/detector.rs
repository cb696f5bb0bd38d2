//! Streaming keyword detector.
//!
//! Watches the text a model is producing, chunk by chunk, and decides
//! whether the turn opens with a registered tool keyword. Until enough text
//! has arrived to rule every keyword in or out, chunks are withheld from
//! the user; once the turn is classified the detector locks and keeps
//! answering `AlreadyDelivered` until `reset()`.

use std::sync::Arc;

use serde_json::Value;

use crate::frame::{content_of, done_of, TurnStatus};
use crate::tools::{ToolRegistry, ToolVerdict};

/// Per-chunk decision, always paired with the chunk's [`TurnStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Still ambiguous; keep reading. Carries the text collected so far.
    NeedMoreData(String),
    /// No keyword opens this turn; release everything collected as prose.
    PassToUser(String),
    /// A keyword opens this turn and the turn is complete. `text` is the
    /// model's whole output for the turn, keyword included.
    Detected { keyword: String, text: String },
    /// A terminal verdict was already returned for this turn.
    AlreadyDelivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectState {
    Scanning,
    /// Index into the length-ascending keyword list.
    CommittedTool(usize),
    CommittedPassthrough,
    AlreadyDelivered,
}

pub struct ToolCallDetector {
    /// Sorted ascending by byte length; a shorter keyword that prefixes a
    /// longer one wins.
    keywords: Vec<String>,
    registry: Arc<ToolRegistry>,
    state: DetectState,
    collected: String,
}

impl ToolCallDetector {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let keywords = registry.keywords();
        Self {
            keywords,
            registry,
            state: DetectState::Scanning,
            collected: String::new(),
        }
    }

    /// Clears the accumulator and starts a fresh turn.
    pub fn reset(&mut self) {
        self.collected.clear();
        self.state = DetectState::Scanning;
    }

    /// Feeds one upstream frame through the state machine.
    pub fn update(&mut self, frame: &Value) -> (TurnStatus, Verdict) {
        let status = done_of(frame);
        if status == TurnStatus::CommunicationFailure {
            return (status, Verdict::AlreadyDelivered);
        }

        // Locked turns and an empty keyword set degenerate to pass-through.
        if matches!(
            self.state,
            DetectState::CommittedPassthrough | DetectState::AlreadyDelivered
        ) || self.keywords.is_empty()
        {
            return (status, Verdict::AlreadyDelivered);
        }

        self.collected.push_str(content_of(frame));

        if let DetectState::CommittedTool(index) = self.state {
            return self.committed_step(index, status);
        }
        self.scanning_step(status)
    }

    fn committed_step(&mut self, index: usize, status: TurnStatus) -> (TurnStatus, Verdict) {
        if status == TurnStatus::UpstreamSentAll {
            return (status, self.deliver(index));
        }
        // Turn still open. The model may have opened an ordinary reply with
        // the keyword; let the tool's own heuristic reclassify the partial
        // text. Handlers are pure, so asking repeatedly is fine.
        let keyword = &self.keywords[index];
        if let Some(ToolVerdict::WasUserReply(_)) =
            self.registry.classify(keyword, self.collected.clone())
        {
            self.state = DetectState::CommittedPassthrough;
            return (status, Verdict::PassToUser(std::mem::take(&mut self.collected)));
        }
        (status, Verdict::NeedMoreData(self.collected.clone()))
    }

    fn scanning_step(&mut self, status: TurnStatus) -> (TurnStatus, Verdict) {
        let collected_len = self.collected.len();

        for (index, keyword) in self.keywords.iter().enumerate() {
            if keyword.len() > collected_len {
                // Keywords are length-sorted: nothing further can fit yet.
                break;
            }
            if self.collected.starts_with(keyword.as_str()) {
                self.state = DetectState::CommittedTool(index);
                if status == TurnStatus::UpstreamSentAll {
                    return (status, self.deliver(index));
                }
                return (status, Verdict::NeedMoreData(self.collected.clone()));
            }
        }

        let longest = self.keywords.last().map(String::len).unwrap_or(0);
        if longest > collected_len {
            // Some longer keyword could still match once more text arrives.
            return (status, Verdict::NeedMoreData(self.collected.clone()));
        }

        // Even the longest keyword is ruled out.
        self.state = DetectState::CommittedPassthrough;
        (status, Verdict::PassToUser(std::mem::take(&mut self.collected)))
    }

    fn deliver(&mut self, index: usize) -> Verdict {
        let keyword = self.keywords[index].clone();
        self.state = DetectState::AlreadyDelivered;
        Verdict::Detected {
            keyword,
            text: std::mem::take(&mut self.collected),
        }
    }
}
