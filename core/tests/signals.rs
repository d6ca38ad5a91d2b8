/*
 * signals.rs
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

//! Real signal delivery through `SignalGuard`. Kept in its own test binary:
//! the counters are process-wide.

use postino_core::net::cancel::{CancellationContext, Interrupt, SignalGuard};
use postino_core::net::CancelHandle;
use postino_core::Error;

#[test]
fn raised_sigint_is_soft_then_hard() {
    let guard = SignalGuard::install_default().expect("install handlers");
    let mut cx = CancellationContext::new(CancelHandle::new(), false);
    assert_eq!(cx.poll(), Interrupt::None);

    // SAFETY: the installed handler only bumps an atomic counter.
    assert_eq!(unsafe { libc::raise(libc::SIGINT) }, 0);
    assert_eq!(cx.poll(), Interrupt::Soft);
    assert!(cx.check().is_ok());

    assert_eq!(unsafe { libc::raise(libc::SIGINT) }, 0);
    assert_eq!(cx.poll(), Interrupt::Hard);
    assert!(matches!(cx.check(), Err(Error::Cancelled)));

    cx.rearm();
    assert_eq!(cx.poll(), Interrupt::None);

    // SIGTERM only counts once the context opts in
    assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);
    assert_eq!(cx.poll(), Interrupt::None);
    let mut aborting = CancellationContext::new(CancelHandle::new(), false).abort_on_sigterm();
    assert_eq!(unsafe { libc::raise(libc::SIGTERM) }, 0);
    assert_eq!(aborting.poll(), Interrupt::Hard);

    drop(guard);
}
