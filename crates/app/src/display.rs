//! Console rendering of countdown signals

use std::io::Write;

use skillsync_core::{CountdownKey, CountdownPhase, CountdownSignal, CountdownView};
use skillsync_net::CloseReason;

use crate::bus::CountdownObserver;

const BELL: &str = "\x07";

/// Prints one line per notable signal
///
/// Per-second `Remaining` updates are not printed; `status` shows them.
pub struct ConsoleDisplay<W: Write> {
    out: W,
    sound: bool,
}

impl<W: Write> ConsoleDisplay<W> {
    pub fn new(out: W, sound: bool) -> Self {
        Self { out, sound }
    }

    /// Print a table of every countdown
    pub fn status(&mut self, views: &[CountdownView]) {
        if views.is_empty() {
            self.line("no active countdowns");
            return;
        }
        for view in views {
            let phase = match view.phase {
                CountdownPhase::Idle => "idle",
                CountdownPhase::Running => "running",
                CountdownPhase::Holding => "expired",
                CountdownPhase::Held => "ready",
                CountdownPhase::Rearming => "rearming",
            };
            let text = format!("{:<24} {:>5}s  {}", view.key.to_string(), view.remaining, phase);
            self.line(&text);
        }
    }

    pub fn line(&mut self, text: &str) {
        // Console output is best effort
        let _ = writeln!(self.out, "{}", text);
        let _ = self.out.flush();
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn bell(&mut self) {
        if self.sound {
            let _ = write!(self.out, "{}", BELL);
        }
    }
}

impl<W: Write> CountdownObserver for ConsoleDisplay<W> {
    fn on_signal(&mut self, key: &CountdownKey, signal: CountdownSignal, remaining: u32) {
        match signal {
            CountdownSignal::Remaining(_) => {}
            CountdownSignal::Alert if remaining > 0 => {
                self.line(&format!("{} ready in {}s", key, remaining));
            }
            CountdownSignal::Alert => {}
            CountdownSignal::Expired => {
                self.bell();
                self.line(&format!("{} is ready", key));
            }
            CountdownSignal::Rearmed => {
                self.line(&format!("{} restarted ({}s)", key, remaining));
            }
            CountdownSignal::Closed => {}
        }
    }

    fn on_members(&mut self, members: &[String]) {
        self.line(&format!("members: {}", members.join(", ")));
    }

    fn on_closed(&mut self, reason: CloseReason) {
        self.line(&format!("left room: {}", reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillsync_core::CountdownMode;

    fn output(display: ConsoleDisplay<Vec<u8>>) -> String {
        String::from_utf8(display.into_inner()).unwrap()
    }

    #[test]
    fn test_signals() {
        let key = CountdownKey::new("bob", "dash");
        let mut display = ConsoleDisplay::new(Vec::new(), true);

        display.on_signal(&key, CountdownSignal::Remaining(9), 9);
        display.on_signal(&key, CountdownSignal::Alert, 3);
        display.on_signal(&key, CountdownSignal::Alert, 0);
        display.on_signal(&key, CountdownSignal::Expired, 0);
        display.on_signal(&key, CountdownSignal::Closed, 0);

        assert_eq!(output(display), "bob/dash ready in 3s\n\x07bob/dash is ready\n");
    }

    #[test]
    fn test_silent_expiry() {
        let key = CountdownKey::new("bob", "dash");
        let mut display = ConsoleDisplay::new(Vec::new(), false);
        display.on_signal(&key, CountdownSignal::Expired, 0);
        display.on_signal(&key, CountdownSignal::Rearmed, 30);
        assert_eq!(output(display), "bob/dash is ready\nbob/dash restarted (30s)\n");
    }

    #[test]
    fn test_room_lines() {
        let mut display = ConsoleDisplay::new(Vec::new(), false);
        display.on_members(&["host".to_string(), "bob".to_string()]);
        display.on_closed(CloseReason::RoomDisbanded);
        assert_eq!(
            output(display),
            "members: host, bob\nleft room: room disbanded by host\n"
        );
    }

    #[test]
    fn test_status_table() {
        let mut display = ConsoleDisplay::new(Vec::new(), false);
        display.status(&[]);
        display.status(&[CountdownView {
            key: CountdownKey::new("alice", "aura"),
            remaining: 0,
            phase: CountdownPhase::Held,
            mode: CountdownMode::Permanent,
        }]);

        let text = output(display);
        assert!(text.starts_with("no active countdowns\n"));
        assert!(text.contains("alice/aura"));
        assert!(text.trim_end().ends_with("ready"));
    }
}
