//! Watchdog
//!
//! Wall-clock supervision of a running child. The watchdog, the reaper and
//! a caller abort all race to record the terminal observation in a
//! `TerminalSlot`; only the first writer acts.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Who observed the end of the run first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Terminal {
    /// The child was reaped on its own
    Exited = 1,
    /// The wall-clock deadline passed
    TimedOut = 2,
    /// The caller cancelled the run
    Aborted = 3,
}

const UNRESOLVED: u8 = 0;

/// Single-writer slot for the terminal observation
#[derive(Debug, Default)]
pub struct TerminalSlot(AtomicU8);

impl TerminalSlot {
    pub fn new() -> Self {
        Self(AtomicU8::new(UNRESOLVED))
    }

    /// Record `terminal` if nothing has been recorded yet
    pub fn claim(&self, terminal: Terminal) -> bool {
        self.0
            .compare_exchange(UNRESOLVED, terminal as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn winner(&self) -> Option<Terminal> {
        match self.0.load(Ordering::Acquire) {
            1 => Some(Terminal::Exited),
            2 => Some(Terminal::TimedOut),
            3 => Some(Terminal::Aborted),
            _ => None,
        }
    }
}

/// Armed timer for one child's process group
#[derive(Debug)]
pub struct Watchdog {
    handle: JoinHandle<()>,
    slot: Arc<TerminalSlot>,
}

impl Watchdog {
    /// Start the timer. When `limit` passes before anyone else claims the
    /// slot, the whole group is terminated.
    pub fn arm(pgid: Pid, limit: Duration, grace: Duration, slot: Arc<TerminalSlot>) -> Self {
        let timer_slot = Arc::clone(&slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if timer_slot.claim(Terminal::TimedOut) {
                warn!(
                    "Wall time limit of {}ms exceeded, terminating process group {}",
                    limit.as_millis(),
                    pgid
                );
                terminate_group(pgid, grace).await;
            }
        });

        Self { handle, slot }
    }

    /// Stop the timer once the child is gone.
    ///
    /// If the timer already won, its kill sequence is allowed to finish.
    pub async fn disarm(self) {
        if self.slot.winner() == Some(Terminal::TimedOut) {
            let _ = self.handle.await;
        } else {
            self.handle.abort();
            debug!("Watchdog cancelled");
        }
    }
}

/// SIGTERM the group, wait `grace`, then SIGKILL whatever is left
pub async fn terminate_group(pgid: Pid, grace: Duration) {
    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return,
        Err(e) => warn!("Failed to send SIGTERM to process group {}: {}", pgid, e),
    }

    tokio::time::sleep(grace).await;
    kill_group(pgid);
}

/// SIGKILL the group; an already empty group is not an error
pub fn kill_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send SIGKILL to process group {}: {}", pgid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::{Child, Command};

    fn spawn_group(script: &str) -> (Child, Pid) {
        let child = Command::new("/bin/sh")
            .args(["-c", script])
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = Pid::from_raw(child.id() as i32);
        (child, pgid)
    }

    #[test]
    fn test_first_claim_wins() {
        let slot = TerminalSlot::new();
        assert_eq!(slot.winner(), None);

        assert!(slot.claim(Terminal::Exited));
        assert!(!slot.claim(Terminal::TimedOut));
        assert!(!slot.claim(Terminal::Aborted));
        assert_eq!(slot.winner(), Some(Terminal::Exited));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let slot = Arc::new(TerminalSlot::new());
        let handles: Vec<_> = [Terminal::Exited, Terminal::TimedOut, Terminal::Aborted]
            .into_iter()
            .map(|terminal| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || slot.claim(terminal))
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(slot.winner().is_some());
    }

    #[tokio::test]
    async fn test_watchdog_terminates_group() {
        let (mut child, pgid) = spawn_group("sleep 5");
        let slot = Arc::new(TerminalSlot::new());

        let watchdog = Watchdog::arm(
            pgid,
            Duration::from_millis(100),
            Duration::from_millis(50),
            Arc::clone(&slot),
        );
        let status = tokio::task::spawn_blocking(move || child.wait().unwrap())
            .await
            .unwrap();
        watchdog.disarm().await;

        assert_eq!(slot.winner(), Some(Terminal::TimedOut));
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_disarm_after_exit_leaves_process_alone() {
        let (mut child, pgid) = spawn_group("sleep 5");
        let slot = Arc::new(TerminalSlot::new());

        let watchdog = Watchdog::arm(
            pgid,
            Duration::from_millis(50),
            Duration::from_millis(10),
            Arc::clone(&slot),
        );
        assert!(slot.claim(Terminal::Exited));
        watchdog.disarm().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(child.try_wait().unwrap().is_none());

        kill_group(pgid);
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_terminate_group_escalates_to_kill() {
        let (mut child, pgid) = spawn_group("trap '' TERM; sleep 5; sleep 5");

        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;
        terminate_group(pgid, Duration::from_millis(100)).await;

        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_terminate_missing_group_is_noop() {
        let (mut child, pgid) = spawn_group("exit 0");
        child.wait().unwrap();

        terminate_group(pgid, Duration::from_millis(10)).await;
        kill_group(pgid);
    }
}
