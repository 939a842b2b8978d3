//! Deadline timers for the worker's auto-disconnect policies.
//!
//! Each timer is a task holding an explicit deadline inside a select loop,
//! so a reset can never race a deadline that already fired but was not yet
//! observed. The handle only pushes commands; the task owns all timing
//! state.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
enum TimerCommand {
    Reset,
    Disarm,
}

/// What happens after the deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerMode {
    /// Fire once, then exit.
    OneShot,
    /// Stay parked after firing until the next reset re-arms the deadline.
    Rearm,
}

/// Handle to a spawned deadline task.
pub(crate) struct DeadlineTimer {
    label: &'static str,
    tx: mpsc::UnboundedSender<TimerCommand>,
}

impl DeadlineTimer {
    /// Arms a timer for `timeout` and invokes `on_deadline` when it
    /// elapses. The task exits on [`DeadlineTimer::disarm`], when the
    /// handle is dropped, or when `stop` is cancelled.
    pub fn spawn<F>(
        label: &'static str,
        timeout: Duration,
        mode: TimerMode,
        stop: CancellationToken,
        on_deadline: F,
    ) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut deadline = Some(Instant::now() + timeout);
            eprintln!("DEBUG spawn start at {:?} deadline={:?}", Instant::now(), deadline);
            let mut iter = 0;
            loop {
                iter += 1;
                eprintln!("DEBUG loop top #{} at {:?} deadline={:?}", iter, Instant::now(), deadline);
                tokio::select! {
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        eprintln!("DEBUG fired at {:?}", Instant::now());
                        on_deadline();
                        match mode {
                            TimerMode::OneShot => return,
                            TimerMode::Rearm => deadline = None,
                        }
                    }
                    cmd = rx.recv() => match cmd {
                        Some(TimerCommand::Reset) => {
                            eprintln!("DEBUG got reset at {:?}", Instant::now());
                            deadline = Some(Instant::now() + timeout);
                        }
                        Some(TimerCommand::Disarm) | None => {
                            debug!("Disarming the {label} timer");
                            return;
                        }
                    },
                    _ = stop.cancelled() => {
                        debug!("Stopping the {label} timer");
                        return;
                    }
                }
            }
        });
        Self { label, tx }
    }

    /// Pushes the deadline back to the full timeout.
    pub fn reset(&self) {
        debug!("Resetting the {} timer", self.label);
        let _ = self.tx.send(TimerCommand::Reset);
    }

    /// Cancels the deadline and ends the task.
    pub fn disarm(&self) {
        let _ = self.tx.send(TimerCommand::Disarm);
    }
}
