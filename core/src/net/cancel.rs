/*
 * cancel.rs
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

//! Signal-driven cancellation.
//!
//! Handlers only bump process-wide counters. Each session owns a
//! `CancellationContext` holding a snapshot of those counters and classifies
//! what arrived since as an `Interrupt`: the first SIGINT is soft (warn and
//! carry on), a second SIGINT or a SIGTERM (when the session asked for it) is
//! hard and aborts the operation at the next suspension point. Handlers are
//! installed without `SA_RESTART`, so a blocked read returns EINTR and the
//! transport gets to look at the context before retrying.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use libc::c_int;
use tracing::warn;

static SIGINT_COUNT: AtomicUsize = AtomicUsize::new(0);
static SIGTERM_COUNT: AtomicUsize = AtomicUsize::new(0);
static SIGHUP_COUNT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_signal(sig: c_int) {
    let counter = match sig {
        libc::SIGINT => &SIGINT_COUNT,
        libc::SIGTERM => &SIGTERM_COUNT,
        libc::SIGHUP => &SIGHUP_COUNT,
        _ => return,
    };
    counter.fetch_add(1, Ordering::SeqCst);
}

/// How far an interruption should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    None,
    /// Warn, let the operation continue.
    Soft,
    /// Abort the operation and close the connection.
    Hard,
}

/// Installs the counting handler for a set of signals; restores the previous
/// dispositions on drop.
pub struct SignalGuard {
    saved: Vec<(c_int, libc::sigaction)>,
}

impl SignalGuard {
    pub fn install(signals: &[c_int]) -> io::Result<Self> {
        let mut guard = SignalGuard { saved: Vec::with_capacity(signals.len()) };
        for &sig in signals {
            // SAFETY: sigaction structs are plain data; the handler only touches atomics.
            unsafe {
                let mut action: libc::sigaction = mem::zeroed();
                action.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
                libc::sigemptyset(&mut action.sa_mask);
                action.sa_flags = 0;
                let mut old: libc::sigaction = mem::zeroed();
                if libc::sigaction(sig, &action, &mut old) != 0 {
                    return Err(io::Error::last_os_error());
                }
                guard.saved.push((sig, old));
            }
        }
        Ok(guard)
    }

    /// SIGINT, SIGHUP and SIGTERM.
    pub fn install_default() -> io::Result<Self> {
        Self::install(&[libc::SIGINT, libc::SIGHUP, libc::SIGTERM])
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for (sig, old) in self.saved.drain(..).rev() {
            // SAFETY: restoring a disposition previously returned by sigaction.
            unsafe {
                libc::sigaction(sig, &old, std::ptr::null_mut());
            }
        }
    }
}

/// Programmatic interruption, for host applications without signals (and tests).
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    interrupts: Arc<AtomicUsize>,
    hard: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same effect as one SIGINT.
    pub fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    /// Same effect as SIGTERM on a session that aborts on it.
    pub fn cancel(&self) {
        self.hard.store(true, Ordering::SeqCst);
    }
}

/// Per-session view of the interrupt counters.
#[derive(Debug, Clone)]
pub struct CancellationContext {
    handle: CancelHandle,
    sigint_base: usize,
    sigterm_base: usize,
    sighup_base: usize,
    handle_base: usize,
    abort_on_sigterm: bool,
    interactive: bool,
    warned: bool,
    resolver_warned: bool,
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new(CancelHandle::default(), false)
    }
}

impl CancellationContext {
    pub fn new(handle: CancelHandle, interactive: bool) -> Self {
        let handle_base = handle.interrupts.load(Ordering::SeqCst);
        Self {
            handle,
            sigint_base: SIGINT_COUNT.load(Ordering::SeqCst),
            sigterm_base: SIGTERM_COUNT.load(Ordering::SeqCst),
            sighup_base: SIGHUP_COUNT.load(Ordering::SeqCst),
            handle_base,
            abort_on_sigterm: false,
            interactive,
            warned: false,
            resolver_warned: false,
        }
    }

    /// SIGTERM becomes a hard interrupt for this context.
    pub fn abort_on_sigterm(mut self) -> Self {
        self.abort_on_sigterm = true;
        self
    }

    /// Forget interrupts delivered so far (start of a new operation).
    pub fn rearm(&mut self) {
        let interactive = self.interactive;
        let abort_on_sigterm = self.abort_on_sigterm;
        *self = Self::new(self.handle.clone(), interactive);
        self.abort_on_sigterm = abort_on_sigterm;
    }

    fn interrupts(&self) -> usize {
        SIGINT_COUNT.load(Ordering::SeqCst).wrapping_sub(self.sigint_base)
            + self.handle.interrupts.load(Ordering::SeqCst).wrapping_sub(self.handle_base)
    }

    fn terminated(&self) -> bool {
        self.handle.hard.load(Ordering::SeqCst)
            || (self.abort_on_sigterm
                && SIGTERM_COUNT.load(Ordering::SeqCst) != self.sigterm_base)
    }

    /// Classify what arrived since the context was armed. Emits the soft warning once.
    pub fn poll(&mut self) -> Interrupt {
        if self.terminated() {
            return Interrupt::Hard;
        }
        match self.interrupts() {
            0 => Interrupt::None,
            1 => {
                if !self.warned {
                    self.warned = true;
                    warn!("interrupt received; interrupt again to abort");
                    if self.interactive {
                        eprintln!("Interrupt: press again to abort the operation");
                    }
                }
                Interrupt::Soft
            }
            _ => Interrupt::Hard,
        }
    }

    /// `Err(Cancelled)` on a hard interrupt.
    pub fn check(&mut self) -> crate::error::Result<()> {
        match self.poll() {
            Interrupt::Hard => Err(crate::error::Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Like `poll`, but SIGHUP counts too and the first interruption warns that
    /// the lookup itself cannot be stopped.
    pub fn poll_resolver(&mut self) -> Interrupt {
        if self.terminated() {
            return Interrupt::Hard;
        }
        let hups = SIGHUP_COUNT.load(Ordering::SeqCst).wrapping_sub(self.sighup_base);
        match self.interrupts() + hups {
            0 => Interrupt::None,
            1 => {
                if !self.resolver_warned {
                    self.resolver_warned = true;
                    warn!("cannot cancel the resolver; interrupt again to abandon the lookup");
                    if self.interactive {
                        eprintln!("Cannot cancel resolver; interrupt again to give up");
                    }
                }
                Interrupt::Soft
            }
            _ => Interrupt::Hard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_interrupt_is_soft_second_is_hard() {
        let handle = CancelHandle::new();
        let mut cx = CancellationContext::new(handle.clone(), false);
        assert_eq!(cx.poll(), Interrupt::None);
        handle.interrupt();
        assert_eq!(cx.poll(), Interrupt::Soft);
        assert!(cx.check().is_ok());
        handle.interrupt();
        assert_eq!(cx.poll(), Interrupt::Hard);
        assert!(matches!(cx.check(), Err(crate::error::Error::Cancelled)));
    }

    #[test]
    fn cancel_is_always_hard() {
        let handle = CancelHandle::new();
        let mut cx = CancellationContext::new(handle.clone(), false);
        handle.cancel();
        assert_eq!(cx.poll(), Interrupt::Hard);
    }

    #[test]
    fn rearm_forgets_earlier_interrupts() {
        let handle = CancelHandle::new();
        let mut cx = CancellationContext::new(handle.clone(), false);
        handle.interrupt();
        assert_eq!(cx.poll(), Interrupt::Soft);
        cx.rearm();
        assert_eq!(cx.poll(), Interrupt::None);
        handle.interrupt();
        assert_eq!(cx.poll(), Interrupt::Soft);
    }

    #[test]
    fn resolver_wait_soft_then_hard() {
        let handle = CancelHandle::new();
        let mut cx = CancellationContext::new(handle.clone(), false);
        handle.interrupt();
        assert_eq!(cx.poll_resolver(), Interrupt::Soft);
        handle.interrupt();
        assert_eq!(cx.poll_resolver(), Interrupt::Hard);
    }
}
