//! Solo Practice
//!
//! A single player typing one prompt against the clock, with no lobby,
//! countdown or opponents. The clock starts when the run is created and
//! stops on the keystroke that completes the prompt. A run can be
//! restarted with a new prompt any number of times.
//!
//! Runs are owned by the caller (one per connection), not by the
//! [`Manager`](crate::race::Manager) registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::race::player::{Player, PlayerId, PlayerSnapshot};
use crate::race::prompt::Prompt;
use crate::race::session::ProgressOutcome;

/// One solo run over a prompt.
#[derive(Debug, Clone)]
pub struct PracticeRun {
    prompt: Prompt,
    player: Player,
    round: u32,
}

impl PracticeRun {
    /// Start a run. The clock starts at `now`.
    pub fn new(
        player_id: PlayerId,
        name: impl Into<String>,
        prompt: Prompt,
        now: DateTime<Utc>,
    ) -> Self {
        let mut player = Player::new(player_id, name);
        player.begin(now);
        Self {
            prompt,
            player,
            round: 1,
        }
    }

    /// Apply the typed buffer.
    ///
    /// Returns [`ProgressOutcome::RaceFinished`] on the update that completes
    /// the prompt and [`ProgressOutcome::Ignored`] for anything after it.
    pub fn apply_typed(&mut self, text: &str, now: DateTime<Utc>) -> ProgressOutcome {
        if self.player.is_finished() {
            return ProgressOutcome::Ignored;
        }

        self.player.apply_typed(text, &self.prompt.text, now);
        if self.player.is_complete(self.prompt.len()) && self.player.finish(now) {
            ProgressOutcome::RaceFinished { place: 1 }
        } else {
            ProgressOutcome::Updated
        }
    }

    /// Throw away all progress and start over on `prompt`.
    pub fn restart(&mut self, prompt: Prompt, now: DateTime<Utc>) {
        let mut player = Player::new(self.player.id.clone(), self.player.name.clone());
        player.begin(now);
        self.player = player;
        self.prompt = prompt;
        self.round += 1;
    }

    /// Prompt being typed.
    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    /// The typist's live record.
    pub fn player(&self) -> &Player {
        &self.player
    }

    /// Prompt completed.
    pub fn is_finished(&self) -> bool {
        self.player.is_finished()
    }

    /// Runs so far, counting this one.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Milliseconds from the start to the finish, or to `now` while typing.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let Some(started_at) = self.player.started_at() else {
            return 0;
        };
        let until = self.player.ended_at().unwrap_or(now);
        (until - started_at).num_milliseconds().max(0) as u64
    }

    /// Stats for display. Once finished, this is the results screen.
    pub fn snapshot(&self, now: DateTime<Utc>) -> PracticeSnapshot {
        PracticeSnapshot {
            prompt: self.prompt.text.clone(),
            author: self.prompt.author.clone(),
            round: self.round,
            elapsed_ms: self.elapsed_ms(now),
            correct_chars: self.player.correct_chars(),
            player: self.player.snapshot(self.prompt.len()),
        }
    }
}

/// Practice run view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeSnapshot {
    /// Prompt text.
    pub prompt: String,
    /// Prompt attribution.
    pub author: String,
    /// Restart counter, starting at 1.
    pub round: u32,
    /// Typing time so far, frozen at the finish.
    pub elapsed_ms: u64,
    /// Characters matching the prompt.
    pub correct_chars: usize,
    /// Cursor, WPM, accuracy and finish flag.
    pub player: PlayerSnapshot,
}
