// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic discovery and heartbeat.
//!
//! [`Schedule`] is plain deadline arithmetic; [`Scheduler`] runs it on a
//! thread that sleeps on a stop channel between deadlines.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error};
use parking_lot::Mutex;

/// Tasks due within this much of their deadline run early.
pub const SLACK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Discovery,
    Heartbeat,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    discovery_period: Duration,
    heartbeat_period: Duration,
    next_discovery: Instant,
    next_heartbeat: Instant,
}

impl Schedule {
    /// Discovery is due immediately; the first heartbeat one period in.
    pub fn new(discovery_period: Duration, heartbeat_period: Duration, now: Instant) -> Self {
        Self {
            discovery_period,
            heartbeat_period,
            next_discovery: now,
            next_heartbeat: now + heartbeat_period,
        }
    }

    /// Tasks whose deadline is within [`SLACK`] of `now`, rescheduling each.
    pub fn due(&mut self, now: Instant) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(2);
        if self.next_discovery <= now + SLACK {
            tasks.push(Task::Discovery);
            self.next_discovery = now + self.discovery_period;
        }
        if self.next_heartbeat <= now + SLACK {
            tasks.push(Task::Heartbeat);
            self.next_heartbeat = now + self.heartbeat_period;
        }
        tasks
    }

    /// Time until the nearest deadline.
    pub fn sleep_for(&self, now: Instant) -> Duration {
        self.next_discovery
            .min(self.next_heartbeat)
            .saturating_duration_since(now)
    }
}

/// Background thread running a [`Schedule`].
pub struct Scheduler {
    stop: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn spawn<F>(mut schedule: Schedule, mut run: F) -> io::Result<Self>
    where
        F: FnMut(Task) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("roomhub-scheduler".to_string())
            .spawn(move || {
                loop {
                    for task in schedule.due(Instant::now()) {
                        run(task);
                    }
                    match stop_rx.recv_timeout(schedule.sleep_for(Instant::now())) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("[MANAGER] scheduler stopped");
            })?;

        Ok(Self {
            stop: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn shutdown(&self) {
        // Dropping the sender wakes the thread.
        drop(self.stop.lock().take());
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[MANAGER] scheduler thread panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DISCOVERY: Duration = Duration::from_millis(10_000);
    const HEARTBEAT: Duration = Duration::from_millis(8_000);

    #[test]
    fn test_discovery_runs_first() {
        let t0 = Instant::now();
        let mut schedule = Schedule::new(DISCOVERY, HEARTBEAT, t0);
        assert_eq!(schedule.due(t0), vec![Task::Discovery]);
        assert_eq!(schedule.sleep_for(t0), HEARTBEAT);
    }

    #[test]
    fn test_interleaving() {
        let t0 = Instant::now();
        let mut schedule = Schedule::new(DISCOVERY, HEARTBEAT, t0);
        schedule.due(t0);

        let t8 = t0 + HEARTBEAT;
        assert_eq!(schedule.due(t8), vec![Task::Heartbeat]);
        assert_eq!(schedule.sleep_for(t8), Duration::from_millis(2_000));

        let t10 = t0 + DISCOVERY;
        assert_eq!(schedule.due(t10), vec![Task::Discovery]);
        assert_eq!(schedule.sleep_for(t10), Duration::from_millis(6_000));
    }

    #[test]
    fn test_slack_runs_early() {
        let t0 = Instant::now();
        let mut schedule = Schedule::new(DISCOVERY, HEARTBEAT, t0);
        schedule.due(t0);

        let early = t0 + HEARTBEAT - Duration::from_millis(500);
        assert!(schedule.due(early).is_empty());
        let almost = t0 + HEARTBEAT - Duration::from_millis(50);
        assert_eq!(schedule.due(almost), vec![Task::Heartbeat]);
    }

    #[test]
    fn test_both_due_together() {
        let t0 = Instant::now();
        let mut schedule = Schedule::new(HEARTBEAT, HEARTBEAT, t0);
        schedule.due(t0);
        assert_eq!(
            schedule.due(t0 + HEARTBEAT),
            vec![Task::Discovery, Task::Heartbeat]
        );
    }

    #[test]
    fn test_scheduler_runs_and_stops() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&runs);
        let schedule = Schedule::new(
            Duration::from_millis(20),
            Duration::from_millis(30),
            Instant::now(),
        );
        let scheduler = Scheduler::spawn(schedule, move |task| sink.lock().push(task)).unwrap();

        thread::sleep(Duration::from_millis(300));
        scheduler.shutdown();
        let seen = runs.lock().clone();
        assert!(seen.contains(&Task::Discovery));
        assert!(seen.contains(&Task::Heartbeat));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.lock().len(), seen.len());
    }
}
