/*
 * keepalive.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Postino, a mail transport engine.
 *
 * Postino is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Postino is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Postino.  If not, see <http://www.gnu.org/licenses/>.
 */

//! NOOP keepalive bookkeeping.

use std::time::{Duration, Instant};

/// What a keepalive tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveOutcome {
    /// Disabled, or the interval has not elapsed since the last exchange.
    NotDue,
    /// Due, but a command was in flight; the tick is dropped.
    Skipped,
    /// NOOP sent and answered.
    Sent,
}

/// Interval deadline plus a count of exchanges in flight.
#[derive(Debug, Clone)]
pub struct Keepalive {
    interval: Option<Duration>,
    last_activity: Instant,
    busy: usize,
}

impl Keepalive {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            last_activity: Instant::now(),
            busy: 0,
        }
    }

    /// A command is going out.
    pub fn enter(&mut self) {
        self.busy += 1;
    }

    /// Its response has been consumed (or it failed).
    pub fn leave(&mut self) {
        self.busy = self.busy.saturating_sub(1);
        self.last_activity = Instant::now();
    }

    pub fn is_busy(&self) -> bool {
        self.busy > 0
    }

    /// Classify a tick at `now`: `Sent` means a NOOP should go out.
    pub fn tick(&self, now: Instant) -> KeepaliveOutcome {
        let Some(interval) = self.interval else {
            return KeepaliveOutcome::NotDue;
        };
        if now.saturating_duration_since(self.last_activity) < interval {
            KeepaliveOutcome::NotDue
        } else if self.is_busy() {
            KeepaliveOutcome::Skipped
        } else {
            KeepaliveOutcome::Sent
        }
    }
}
