//! Backend tools the model can invoke by opening its turn with a keyword.
//!
//! A `ToolRegistry` is built once at startup and shared read-only for the
//! process lifetime. Handlers must be pure with respect to proxy state and
//! idempotent: the detector may consult a handler repeatedly for growing
//! partial payloads while a turn is still open.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use tracing::error;

use crate::error::ProxyError;

/// Injected back to the model when it names a keyword the registry does not
/// know (possible under a race with reconfiguration).
pub const UNKNOWN_TOOL_REPLY: &str = "Backend failure. This request cannot be processed now.";

/// Replaces a tool result once the loop guard trips.
pub const LOOP_GUARD_REPLY: &str =
    "You request cannot produce more data than you already got. Stop repeating it.";

/// What a handler concluded about the text the model produced after its
/// keyword.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolVerdict {
    /// The model was talking to the user all along; forward the original
    /// text verbatim.
    WasUserReply(String),
    /// The tool ran; the payload goes back to the model as a new user turn.
    WasToolRequest(String),
    /// Could not tell for sure. Currently handled like `WasToolRequest`;
    /// kept separate so a future policy can diverge.
    MaybeUserReply(String),
}

pub type ToolHandler = Arc<dyn Fn(&str, String) -> ToolVerdict + Send + Sync>;

/// One backend capability: a keyword, the instruction text shown to the
/// model, and the handler that fulfils the request.
#[derive(Clone)]
pub struct ToolCommand {
    keyword: String,
    instruction: String,
    handler: ToolHandler,
}

impl ToolCommand {
    /// Keywords must be non-empty ASCII without whitespace.
    pub fn new(
        keyword: impl Into<String>,
        instruction: impl Into<String>,
        handler: ToolHandler,
    ) -> Result<Self, ProxyError> {
        let keyword = keyword.into();
        if keyword.is_empty() {
            return Err(ProxyError::Config("tool keyword is empty".to_string()));
        }
        if !keyword.is_ascii() || keyword.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(ProxyError::Config(format!(
                "tool keyword {:?} must be ASCII without whitespace",
                keyword
            )));
        }
        Ok(Self {
            keyword,
            instruction: instruction.into(),
            handler,
        })
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// Instruction text with every literal `${KEYWORD}` replaced by the
    /// actual keyword. Plain substring replace; an instruction legitimately
    /// containing that substring would be corrupted.
    pub fn instruction_text(&self) -> String {
        self.instruction.replace("${KEYWORD}", &self.keyword)
    }

    pub fn classify(&self, collected: String) -> ToolVerdict {
        (self.handler)(&self.keyword, collected)
    }
}

impl std::fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCommand")
            .field("keyword", &self.keyword)
            .finish()
    }
}

/// Keyword → command map. No two entries may share a keyword. A keyword
/// that is a strict prefix of another shadows the longer one during
/// detection (shortest wins); such sets are legal but the longer keyword
/// becomes unreachable.
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    commands: HashMap<String, ToolCommand>,
}

impl ToolRegistry {
    pub fn new(commands: impl IntoIterator<Item = ToolCommand>) -> Result<Self, ProxyError> {
        let mut map = HashMap::new();
        for command in commands {
            let keyword = command.keyword.clone();
            if map.insert(keyword.clone(), command).is_some() {
                return Err(ProxyError::Config(format!(
                    "duplicate tool keyword {:?}",
                    keyword
                )));
            }
        }
        Ok(Self { commands: map })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// The stock registry the reference binary ships with.
    pub fn builtin() -> Self {
        Self::new([date_time_now()]).expect("builtin commands are statically valid")
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn get(&self, keyword: &str) -> Option<&ToolCommand> {
        self.commands.get(keyword)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolCommand> {
        self.commands.values()
    }

    /// Keywords sorted ascending by byte length, the order the detector
    /// checks them in. The sort is stable so length ties keep a fixed order.
    pub fn keywords(&self) -> Vec<String> {
        let mut keywords: Vec<String> = self.commands.keys().cloned().collect();
        keywords.sort();
        keywords.sort_by_key(String::len);
        keywords
    }

    /// Runs the handler for `keyword` over `collected`. `None` when the
    /// keyword is not registered or the handler panicked; a panic never
    /// escapes into the calling task.
    pub fn classify(&self, keyword: &str, collected: String) -> Option<ToolVerdict> {
        let command = self.commands.get(keyword)?;
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            command.classify(collected)
        })) {
            Ok(verdict) => Some(verdict),
            Err(_) => {
                error!("handler for tool {keyword} panicked");
                None
            }
        }
    }
}

/// Builds the typical handler for keywords that take no argument text: the
/// turn must consist of exactly the keyword (modulo surrounding whitespace)
/// to count as an invocation, anything else reads as a reply to the user.
pub fn keyword_only<F>(compute: F) -> ToolHandler
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    Arc::new(move |keyword, collected| {
        if collected.trim() == keyword {
            ToolVerdict::WasToolRequest(compute(keyword))
        } else {
            ToolVerdict::WasUserReply(collected)
        }
    })
}

/// Gives the model access to the real current local date and time.
pub fn date_time_now() -> ToolCommand {
    ToolCommand::new(
        "AI_DATE_TIME_NOW",
        "You have access to real current local date and time value now. To check it respond \
         with single word ${KEYWORD}.\nYou will receive reply with current local system date \
         and time in ISO 8601 format including time zone offset (e.g., Monday \
         2025-04-25T16:10:00+03:00).\nTreat received value as fact, as current known date and \
         time.\nTranslate the fact to proper language user uses.",
        keyword_only(|_| Local::now().format("%A %Y-%m-%dT%H:%M:%S%:z").to_string()),
    )
    .expect("static keyword is valid")
}

/// Counts consecutive identical tool invocations so a model stuck asking
/// for the same thing can be cut off.
#[derive(Debug, Default)]
pub struct LoopDetector {
    last_keyword: String,
    count: usize,
}

impl LoopDetector {
    pub const MAX_REPEATS: usize = 3;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, keyword: &str) {
        if keyword == self.last_keyword {
            self.count += 1;
        } else {
            self.last_keyword = keyword.to_string();
            self.count = 1;
        }
    }

    pub fn reset(&mut self) {
        self.last_keyword.clear();
        self.count = 0;
    }

    pub fn is_looping(&self) -> bool {
        self.count >= Self::MAX_REPEATS
    }
}
