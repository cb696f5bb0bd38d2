//! Heartbeat frames that keep the downstream connection visibly alive while
//! the proxy is busy between upstream turns.

use serde_json::Value;

use crate::frame::assistant_frame;

/// Text of the first heartbeat of a turn.
const FIRST_PING_TEXT: &str = "Working.";
/// Text of every following heartbeat.
const PING_TEXT: &str = ".";
/// Closes a run of heartbeats. A lone "\n" gets filtered out by clients.
pub const TERMINATOR_TEXT: &str = ".\n\n";

struct TurnPings {
    model: String,
    pinged: bool,
}

/// Armed per upstream turn. Lives on the upstream-reader task only, so a
/// plain bool is enough as the first-ping latch.
#[derive(Default)]
pub struct Heartbeat {
    armed: Option<TurnPings>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms for a new turn; no heartbeat was produced yet.
    pub fn start(&mut self, model: &str) {
        self.armed = Some(TurnPings {
            model: model.to_string(),
            pinged: false,
        });
    }

    /// Yields the next heartbeat frame, `"Working."` first and `"."` from
    /// then on. `None` while disarmed.
    pub fn ping(&mut self) -> Option<Value> {
        let turn = self.armed.as_mut()?;
        let text = if turn.pinged { PING_TEXT } else { FIRST_PING_TEXT };
        turn.pinged = true;
        Some(assistant_frame(&turn.model, text))
    }

    /// Disarms. Yields one terminating frame iff any ping happened this
    /// turn.
    pub fn finish(&mut self) -> Option<Value> {
        let turn = self.armed.take()?;
        if turn.pinged {
            Some(assistant_frame(&turn.model, TERMINATOR_TEXT))
        } else {
            None
        }
    }
}
