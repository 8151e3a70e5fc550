//! Interactive approval of a server key rotation.

use std::sync::mpsc;
use std::time::Duration;

use warden_auth::trust::{RotationCandidate, RotationPrompt};

use crate::utils::format_timestamp_secs;

/// Asks on the terminal; no answer within `timeout` counts as a refusal.
pub struct TerminalPrompt {
    timeout: Duration,
}

impl TerminalPrompt {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RotationPrompt for TerminalPrompt {
    fn confirm(&self, candidate: &RotationCandidate) -> bool {
        eprintln!();
        eprintln!("WARNING: server {} presented a different key.", candidate.server_id);
        eprintln!();
        eprintln!("  Address:   {}", candidate.address);
        eprintln!("  Pinned:    {}", candidate.pinned_fingerprint());
        eprintln!("  Presented: {}", candidate.presented_fingerprint());
        eprintln!(
            "  Valid:     {} .. {}",
            format_timestamp_secs(candidate.not_before),
            format_timestamp_secs(candidate.not_after)
        );
        eprintln!();
        eprintln!("Verify the new fingerprint out-of-band before accepting.");
        eprint!("Replace the pinned key? [y/N] ({}s) ", self.timeout.as_secs());

        // The reader thread is left behind on timeout; it ends with the process.
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_ok() {
                let _ = tx.send(line);
            }
        });

        match rx.recv_timeout(self.timeout) {
            Ok(answer) => is_yes(&answer),
            Err(_) => {
                eprintln!();
                eprintln!("No answer; keeping the pinned key.");
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_explicit_yes_approves() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }
}
