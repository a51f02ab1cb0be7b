//! Background refresh loops
//!
//! Pollers run on the tokio runtime and live exactly as long as their
//! `TaskGuard`; dropping the guard aborts the task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::models::TimeSlot;
use crate::slots::SlotWindow;

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs `tick` immediately and then every `period`.
pub fn spawn_every<F, Fut>(period: Duration, mut tick: F) -> TaskGuard
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    TaskGuard::new(tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick().await;
        }
    }))
}

/// Reservation slots regenerated on a timer so "today" never offers an
/// hour that has already begun.
pub struct SlotFeed {
    rx: watch::Receiver<Vec<TimeSlot>>,
    _task: TaskGuard,
}

impl SlotFeed {
    pub fn spawn<C: Clock + 'static>(window: SlotWindow, clock: Arc<C>, period: Duration) -> Self {
        let (tx, rx) = watch::channel(window.generate(&clock.now()));
        let task = spawn_every(period, move || {
            let slots = window.generate(&clock.now());
            tx.send_if_modified(|current| {
                if *current == slots {
                    return false;
                }
                *current = slots;
                true
            });
            async {}
        });

        Self { rx, _task: task }
    }

    pub fn current(&self) -> Vec<TimeSlot> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TimeSlot>> {
        self.rx.clone()
    }
}
