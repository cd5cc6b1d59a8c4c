//! Player Progress
//!
//! Live typing progress of a single racer and the stats derived from it.
//! All time-dependent operations take `now` explicitly so callers (and tests)
//! control the clock.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CHARS_PER_WORD;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Opaque player identifier assigned by the connecting layer.
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// One participant's typing progress.
///
/// Invariant: `correct_chars <= compared_chars <= min(len(typed), len(prompt))`.
#[derive(Clone, Debug)]
pub struct Player {
    /// Unique player ID
    pub id: PlayerId,
    /// Display name
    pub name: String,
    typed: String,
    cursor: usize,
    correct_chars: usize,
    compared_chars: usize,
    accuracy: f64,
    wpm: f64,
    finished: bool,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

impl Player {
    /// Create a fresh record with no progress.
    pub fn new(id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            typed: String::new(),
            cursor: 0,
            correct_chars: 0,
            compared_chars: 0,
            accuracy: 0.0,
            wpm: 0.0,
            finished: false,
            started_at: None,
            ended_at: None,
            last_update: None,
        }
    }

    /// Stamp the race start for this player.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.started_at = Some(now);
        self.recompute_wpm(now);
    }

    /// Replace the typed buffer and recompute accuracy and WPM.
    ///
    /// Input arriving after the player finished is ignored.
    pub fn apply_typed(&mut self, text: &str, prompt: &str, now: DateTime<Utc>) {
        if self.finished {
            return;
        }

        self.typed.clear();
        self.typed.push_str(text);
        self.cursor = self.typed.chars().count();
        self.last_update = Some(now);

        self.recompute_accuracy(prompt);
        self.recompute_wpm(now);
    }

    fn recompute_accuracy(&mut self, prompt: &str) {
        if prompt.is_empty() {
            self.correct_chars = 0;
            self.compared_chars = 0;
            self.accuracy = 0.0;
            return;
        }

        // Characters past the end of the prompt are never compared.
        let (compared, correct) = self
            .typed
            .chars()
            .zip(prompt.chars())
            .fold((0usize, 0usize), |(compared, correct), (typed, expected)| {
                (compared + 1, correct + usize::from(typed == expected))
            });

        self.compared_chars = compared;
        self.correct_chars = correct;
        self.accuracy = if compared > 0 {
            correct as f64 / compared as f64 * 100.0
        } else {
            0.0
        };
    }

    fn recompute_wpm(&mut self, now: DateTime<Utc>) {
        let Some(started_at) = self.started_at else {
            self.wpm = 0.0;
            return;
        };

        let until = if self.finished {
            self.ended_at.unwrap_or(now)
        } else {
            now
        };

        let minutes = (until - started_at).num_milliseconds() as f64 / 60_000.0;
        self.wpm = if minutes > 0.0 {
            self.correct_chars as f64 / CHARS_PER_WORD / minutes
        } else {
            0.0
        };
    }

    /// True once the typed text is at least as long as the prompt.
    pub fn is_complete(&self, prompt_len: usize) -> bool {
        self.cursor >= prompt_len
    }

    /// Mark the player finished and freeze the final WPM.
    ///
    /// Returns `false` (and changes nothing) if already finished.
    pub fn finish(&mut self, now: DateTime<Utc>) -> bool {
        if self.finished {
            return false;
        }

        self.finished = true;
        self.ended_at = Some(now);
        self.recompute_wpm(now);
        true
    }

    /// Progress through the prompt as a percentage (0-100).
    pub fn progress_percent(&self, prompt_len: usize) -> f64 {
        if prompt_len == 0 {
            return 0.0;
        }
        (self.cursor as f64 / prompt_len as f64 * 100.0).min(100.0)
    }

    /// Typed text so far.
    pub fn typed(&self) -> &str {
        &self.typed
    }

    /// Cursor position (length of typed text in characters).
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Characters matching the prompt at the same position.
    pub fn correct_chars(&self) -> usize {
        self.correct_chars
    }

    /// Characters compared against the prompt.
    pub fn compared_chars(&self) -> usize {
        self.compared_chars
    }

    /// Accuracy percentage (0-100).
    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    /// Words per minute.
    pub fn wpm(&self) -> f64 {
        self.wpm
    }

    /// Whether the player has completed the prompt.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// When the race started for this player.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the player finished.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// When progress was last applied.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Serializable view for renderers.
    pub fn snapshot(&self, prompt_len: usize) -> PlayerSnapshot {
        PlayerSnapshot {
            player_id: self.id.clone(),
            name: self.name.clone(),
            cursor: self.cursor,
            progress: self.progress_percent(prompt_len),
            wpm: self.wpm,
            accuracy: self.accuracy,
            finished: self.finished,
            ended_at: self.ended_at,
        }
    }
}

/// Player state as seen by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Player identifier.
    pub player_id: PlayerId,
    /// Display name.
    pub name: String,
    /// Characters typed.
    pub cursor: usize,
    /// Progress through the prompt (0-100).
    pub progress: f64,
    /// Words per minute.
    pub wpm: f64,
    /// Accuracy percentage.
    pub accuracy: f64,
    /// Has the player finished.
    pub finished: bool,
    /// Finish time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

// =============================================================================
// TESTS
// =============================================================================
