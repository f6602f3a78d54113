//! TTY-aware waiting indicator for the reconfigure commands, which block on
//! the scheduler's own management-queue consumer (spec §6) for up to five
//! minutes. A human watching a terminal gets a spinner; a script piping our
//! stdout gets nothing extra to parse around.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

pub fn is_tty() -> bool {
    std::io::stderr().is_terminal()
}

/// Started before a blocking command socket round trip, dropped (or
/// explicitly finished) once the response arrives. `None` in non-TTY mode —
/// callers should check before printing anything that would otherwise race
/// the spinner's own redraws.
pub struct Waiter(Option<ProgressBar>);

impl Waiter {
    pub fn start(message: String) -> Self {
        if !is_tty() {
            return Self(None);
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(120));
        Self(Some(pb))
    }

    pub fn finish(self) {
        if let Some(pb) = self.0 {
            pb.finish_and_clear();
        }
    }
}
