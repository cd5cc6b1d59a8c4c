//! Prompt Source
//!
//! The text a race is typed against. Sourcing (remote API, files, fixed lists)
//! lives behind [`PromptSource`]; the engine only needs a call that always
//! yields printable text.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// A quote to race on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Text to type.
    pub text: String,
    /// Attribution.
    pub author: String,
}

impl Prompt {
    /// Create a prompt.
    pub fn new(text: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            author: author.into(),
        }
    }

    /// Prompt used when no source can deliver one.
    pub fn fallback() -> Self {
        Self::new(LAST_RESORT.0, LAST_RESORT.1)
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    /// True when there is nothing to type.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Supplies prompts for new races. Must always succeed with non-empty text.
pub trait PromptSource: Send + Sync {
    /// Next prompt for a race about to start.
    fn next_prompt(&self) -> Prompt;
}

/// Used whenever a configured list is empty.
const LAST_RESORT: (&str, &str) = ("The quick brown fox jumps over the lazy dog.", "Typing Test");

const BUILTIN: &[(&str, &str)] = &[
    LAST_RESORT,
    ("To be or not to be, that is the question.", "William Shakespeare"),
    ("The only way to do great work is to love what you do.", "Steve Jobs"),
    ("In the middle of difficulty lies opportunity.", "Albert Einstein"),
    (
        "Success is not final, failure is not fatal: it is the courage to continue that counts.",
        "Winston Churchill",
    ),
];

/// Picks uniformly at random from a fixed list.
#[derive(Debug, Clone)]
pub struct StaticPrompts {
    prompts: Vec<Prompt>,
}

impl StaticPrompts {
    /// Build from a list; empty-text entries are dropped.
    pub fn new(prompts: Vec<Prompt>) -> Self {
        let prompts = prompts.into_iter().filter(|p| !p.is_empty()).collect();
        Self { prompts }
    }

    /// Number of usable prompts.
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    /// True when no usable prompt was configured.
    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

impl Default for StaticPrompts {
    fn default() -> Self {
        Self::new(
            BUILTIN
                .iter()
                .map(|(text, author)| Prompt::new(*text, *author))
                .collect(),
        )
    }
}

impl PromptSource for StaticPrompts {
    fn next_prompt(&self) -> Prompt {
        self.prompts
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(Prompt::fallback)
    }
}
