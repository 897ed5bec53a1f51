use serde::{Deserialize, Serialize};

use crate::{config::DEFAULT_INPUT_TOOLS, types::ToolCall};

/// Wh-words that, leading a reply, mark it as a question to the user. Auxiliaries
/// ("can", "will", "do") only count through a trailing `?`.
const INTERROGATIVES: &[&str] = &["what", "which", "who", "whom", "whose", "where", "when", "why", "how"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitingSource {
    /// The agent set the flag explicitly.
    Declared,
    /// An input-request tool was called.
    Tool,
    /// The reply text reads as a question.
    Content,
    /// No signal fired.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitingInput {
    pub awaiting: bool,
    pub source: AwaitingSource,
}

impl AwaitingInput {
    pub const NOT_AWAITING: Self = Self {
        awaiting: false,
        source: AwaitingSource::Default,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Declared,
    Tool,
    Content,
}

impl Signal {
    const ORDER: [Signal; 3] = [Signal::Declared, Signal::Tool, Signal::Content];

    fn source(self) -> AwaitingSource {
        match self {
            Self::Declared => AwaitingSource::Declared,
            Self::Tool => AwaitingSource::Tool,
            Self::Content => AwaitingSource::Content,
        }
    }
}

/// Decides whether the agent is waiting on the user after a turn.
#[derive(Debug, Clone)]
pub struct AwaitingDetector {
    input_tools: Vec<String>,
}

impl Default for AwaitingDetector {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_TOOLS.iter().map(|s| s.to_string()))
    }
}

impl AwaitingDetector {
    pub fn new(input_tools: impl IntoIterator<Item = String>) -> Self {
        Self {
            input_tools: input_tools.into_iter().collect(),
        }
    }

    /// First signal in `Declared, Tool, Content` order that decides wins.
    pub fn detect(&self, declared: Option<bool>, tool_calls: &[ToolCall], text: &str) -> AwaitingInput {
        Signal::ORDER
            .iter()
            .find_map(|&signal| {
                let decision = match signal {
                    Signal::Declared => declared,
                    Signal::Tool => self.requested_by_tool(tool_calls).then_some(true),
                    Signal::Content => reads_as_question(text).then_some(true),
                };
                decision.map(|awaiting| AwaitingInput {
                    awaiting,
                    source: signal.source(),
                })
            })
            .unwrap_or(AwaitingInput::NOT_AWAITING)
    }

    fn requested_by_tool(&self, tool_calls: &[ToolCall]) -> bool {
        tool_calls
            .iter()
            .any(|call| self.input_tools.iter().any(|tool| call.is_named(tool)))
    }
}

fn reads_as_question(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.ends_with('?') || trimmed.ends_with('？') {
        return true;
    }
    let Some(first) = trimmed.split_whitespace().next() else {
        return false;
    };
    let word = first
        .trim_end_matches(|c: char| matches!(c, ',' | ':' | ';'))
        .to_lowercase();
    // contractions ("what's", "how'd") carry no signal
    if word.contains(['\'', '\u{2019}']) {
        return false;
    }
    INTERROGATIVES.contains(&word.as_str())
}
