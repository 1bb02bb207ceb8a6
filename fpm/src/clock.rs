// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::session::FsmEvent;
use gw_common::lock;
use slog::{error, Logger};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::{sleep, spawn};
use std::time::Duration;

/// The clock drives the idle watchdog for one FPM session. A background
/// thread ticks the timer at the configured resolution and delivers an
/// [`FsmEvent::IdleTimerExpires`] event when it runs down. The thread stops
/// when the clock is dropped.
pub struct Clock {
    pub resolution: Duration,

    /// Time allowed between messages before a keepalive-capable peer is
    /// considered dead. Disabled entirely for peers that predate
    /// keepalives.
    pub idle_timer: Timer,

    shutdown: Arc<AtomicBool>,
}

impl Clock {
    pub fn new(
        resolution: Duration,
        idle_interval: Duration,
        s: Sender<FsmEvent>,
        log: Logger,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let idle_timer = Timer::new(idle_interval);
        Self::run(resolution, idle_timer.clone(), s, shutdown.clone(), log);
        Self {
            resolution,
            idle_timer,
            shutdown,
        }
    }

    fn run(
        resolution: Duration,
        timer: Timer,
        s: Sender<FsmEvent>,
        shutdown: Arc<AtomicBool>,
        log: Logger,
    ) {
        spawn(move || loop {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            timer.tick(resolution);
            if timer.expired() {
                if let Err(e) = s.send(FsmEvent::IdleTimerExpires) {
                    error!(log, "send idle timer event: {e}");
                    return;
                }
                timer.reset();
            }
            sleep(resolution);
        });
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// A countdown timer ticked by the clock thread.
#[derive(Clone)]
pub struct Timer {
    /// How long the timer runs until it fires.
    pub interval: Duration,

    /// The first value indicates whether the timer is enabled, the second
    /// how much time is left.
    value: Arc<Mutex<(bool, Duration)>>,
}

impl Timer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            value: Arc::new(Mutex::new((false, interval))),
        }
    }

    /// Tick the timer down by the given resolution. Saturating, so ticking
    /// an expired timer is a no-op.
    pub fn tick(&self, resolution: Duration) {
        let mut value = lock!(self.value);
        if value.0 {
            value.1 = value.1.saturating_sub(resolution);
        }
    }

    /// Only enabled timers tick and expire.
    pub fn enabled(&self) -> bool {
        lock!(self.value).0
    }

    pub fn enable(&self) {
        lock!(self.value).0 = true
    }

    pub fn disable(&self) {
        lock!(self.value).0 = false
    }

    /// True if the timer is enabled and has ticked down to zero.
    pub fn expired(&self) -> bool {
        let v = lock!(self.value);
        v.0 && v.1.is_zero()
    }

    /// Wind the timer back to its full interval.
    pub fn reset(&self) {
        lock!(self.value).1 = self.interval;
    }
}
