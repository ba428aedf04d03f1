//! Terminal progress indicator using OSC 9;4 escape sequences.
//!
//! Terminals that understand the sequence (Ghostty, iTerm2, Windows Terminal)
//! show a spinner in the tab while a run is in flight; the rest ignore it.

use std::io::{self, IsTerminal, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressState {
    Hidden = 0,
    Indeterminate = 3,
}

fn set_progress(state: ProgressState) {
    let mut stderr = io::stderr();
    if !stderr.is_terminal() {
        return;
    }

    // ESC ] 9 ; 4 ; <state> BEL
    let seq = format!("\x1b]9;4;{}\x07", state as u8);
    let _ = stderr.write_all(seq.as_bytes());
    let _ = stderr.flush();
}

/// Shows a spinner until dropped, so early exits and panics leave nothing behind.
pub struct ProgressGuard;

impl ProgressGuard {
    pub fn start() -> Self {
        set_progress(ProgressState::Indeterminate);
        Self
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        set_progress(ProgressState::Hidden);
    }
}
