//! Interrupt controller
//!
//! Level-triggered lines shared by any number of registered actions.
//! A line is wired-OR: it stays asserted while any function drives it.
//!
//! ## Delivery model
//!
//! Handlers run on the thread that raised the line, the way a simulated vCPU
//! is interrupted by the device it just poked. The controller lock is never
//! held while a handler runs, so handlers are free to touch the register bus.
//!
//! After every round of handlers the line is sampled again:
//! - de-asserted: delivery is complete
//! - still asserted: run another round
//! - still asserted after `storm_threshold` rounds: interrupt storm, the line
//!   is masked and the storm is counted
//!
//! A raise that arrives while the same line is mid-dispatch is folded into the
//! running loop instead of being delivered re-entrantly.
//!
//! ## Teardown
//!
//! `free_irq` unlinks the action and then waits until no invocation of it is
//! still running. Once it returns the handler is never called again. It must
//! not be called from inside that same handler.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use crossbeam::utils::Backoff;
use spin::Mutex;
use thiserror::Error;

use crate::bus::PciAddress;

/// Rounds a line may stay asserted before it is declared a storm
pub const DEFAULT_STORM_THRESHOLD: u32 = 1000;

bitflags! {
    /// Registration flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Line may be shared with other actions that also set this flag
        const SHARED = 1 << 0;
    }
}

/// Handler verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Not ours
    None,
    /// Serviced
    Handled,
}

/// Interrupt handler. Runs in interrupt context: must not block.
pub type IrqHandler = Box<dyn Fn(u32) -> IrqReturn + Send + Sync>;

/// Identifies one registered action on a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionToken(u64);

/// Interrupt controller errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IrqError {
    #[error("IRQ {line} busy: held by \"{holder}\" and not shareable")]
    Busy { line: u32, holder: &'static str },

    #[error("IRQ {line} has no action {token:?}")]
    UnknownAction { line: u32, token: ActionToken },
}

pub type Result<T> = core::result::Result<T, IrqError>;

/// Per-line delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineStats {
    /// Times a device raised the line
    pub raised: u64,
    /// Handler rounds run
    pub dispatched: u64,
    /// Rounds in which at least one handler returned `Handled`
    pub handled: u64,
    /// Rounds in which nobody claimed the interrupt
    pub unhandled: u64,
    /// Times the line was masked for staying asserted
    pub storms: u64,
}

struct IrqAction {
    token: ActionToken,
    name: &'static str,
    flags: IrqFlags,
    handler: IrqHandler,
    live: AtomicBool,
    in_flight: AtomicUsize,
}

/// Keeps `in_flight` balanced even if a handler panics
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IrqAction {
    fn invoke(&self, line: u32) -> IrqReturn {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.live.load(Ordering::SeqCst) {
            return IrqReturn::None;
        }
        (self.handler)(line)
    }

    fn synchronize(&self) {
        let backoff = Backoff::new();
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }
}

#[derive(Default)]
struct Line {
    /// Functions currently driving the line
    sources: BTreeSet<PciAddress>,
    masked: bool,
    dispatching: bool,
    actions: Vec<Arc<IrqAction>>,
    stats: LineStats,
}

impl Line {
    fn asserted(&self) -> bool {
        !self.sources.is_empty()
    }
}

/// Platform interrupt controller
pub struct InterruptController {
    lines: Mutex<BTreeMap<u32, Line>>,
    next_token: AtomicU64,
    storm_threshold: u32,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptController {
    pub fn new() -> Self {
        Self::with_storm_threshold(DEFAULT_STORM_THRESHOLD)
    }

    /// Create a controller that declares a storm after `threshold` rounds
    pub fn with_storm_threshold(threshold: u32) -> Self {
        Self {
            lines: Mutex::new(BTreeMap::new()),
            next_token: AtomicU64::new(1),
            storm_threshold: threshold.max(1),
        }
    }

    /// Attach `handler` to `line`
    ///
    /// # Errors
    /// `Busy` if the line already has an action and either side did not ask
    /// for `IrqFlags::SHARED`.
    pub fn request_irq(
        &self,
        line: u32,
        flags: IrqFlags,
        name: &'static str,
        handler: IrqHandler,
    ) -> Result<ActionToken> {
        let mut lines = self.lines.lock();
        let entry = lines.entry(line).or_default();

        let conflict = entry
            .actions
            .iter()
            .find(|a| !(flags.contains(IrqFlags::SHARED) && a.flags.contains(IrqFlags::SHARED)));
        if let Some(holder) = conflict {
            return Err(IrqError::Busy {
                line,
                holder: holder.name,
            });
        }

        let token = ActionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        entry.actions.push(Arc::new(IrqAction {
            token,
            name,
            flags,
            handler,
            live: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        }));

        log::debug!("irq {}: \"{}\" registered ({:?})", line, name, flags);
        Ok(token)
    }

    /// Detach an action and wait for any running invocation of it to finish
    pub fn free_irq(&self, line: u32, token: ActionToken) -> Result<()> {
        let action = {
            let mut lines = self.lines.lock();
            let entry = lines
                .get_mut(&line)
                .ok_or(IrqError::UnknownAction { line, token })?;
            let index = entry
                .actions
                .iter()
                .position(|a| a.token == token)
                .ok_or(IrqError::UnknownAction { line, token })?;

            let action = entry.actions.remove(index);
            if entry.actions.is_empty() {
                // Last user gone: a storm mask does not outlive its cause
                entry.masked = false;
            }
            action
        };

        action.live.store(false, Ordering::SeqCst);
        action.synchronize();

        log::debug!("irq {}: \"{}\" freed", line, action.name);
        Ok(())
    }

    /// Assert `line` on behalf of `source` and deliver it
    pub fn raise(&self, line: u32, source: PciAddress) {
        self.assert_line(line, source);
        self.deliver(line);
    }

    /// Drive `line` high for `source` without running any handler
    ///
    /// Devices call this while still holding their register lock so the line
    /// level never disagrees with their pending bit, then call [`deliver`]
    /// once the lock is dropped.
    ///
    /// [`deliver`]: Self::deliver
    pub fn assert_line(&self, line: u32, source: PciAddress) {
        let mut lines = self.lines.lock();
        let entry = lines.entry(line).or_default();
        entry.sources.insert(source);
        entry.stats.raised += 1;
    }

    /// Run the handlers of `line` if it is asserted and deliverable
    pub fn deliver(&self, line: u32) {
        {
            let mut lines = self.lines.lock();
            let entry = lines.entry(line).or_default();

            if !entry.asserted() || entry.dispatching {
                return;
            }
            if entry.masked {
                log::trace!("irq {}: raised while masked", line);
                return;
            }
            if entry.actions.is_empty() {
                log::debug!("irq {}: raised with no handler attached", line);
                return;
            }
            entry.dispatching = true;
        }

        self.dispatch(line);
    }

    /// Stop `source` driving `line`; other sources keep it asserted
    pub fn lower(&self, line: u32, source: PciAddress) {
        if let Some(entry) = self.lines.lock().get_mut(&line) {
            entry.sources.remove(&source);
        }
    }

    fn dispatch(&self, line: u32) {
        let mut rounds = 0u32;

        loop {
            let actions: Vec<Arc<IrqAction>> = self
                .lines
                .lock()
                .get(&line)
                .map(|entry| entry.actions.clone())
                .unwrap_or_default();

            let mut handled = false;
            for action in &actions {
                if action.invoke(line) == IrqReturn::Handled {
                    handled = true;
                }
            }

            let mut lines = self.lines.lock();
            let entry = lines.entry(line).or_default();
            entry.stats.dispatched += 1;
            if handled {
                entry.stats.handled += 1;
            } else {
                entry.stats.unhandled += 1;
            }

            if !entry.asserted() || entry.actions.is_empty() {
                entry.dispatching = false;
                return;
            }

            rounds += 1;
            if rounds >= self.storm_threshold {
                entry.masked = true;
                entry.dispatching = false;
                entry.stats.storms += 1;
                log::error!(
                    "irq {}: still asserted after {} rounds, interrupt storm - line disabled",
                    line,
                    rounds
                );
                return;
            }
        }
    }

    /// Is `line` currently asserted?
    pub fn is_asserted(&self, line: u32) -> bool {
        self.lines.lock().get(&line).is_some_and(|l| l.asserted())
    }

    /// Was `line` masked by storm detection?
    pub fn is_masked(&self, line: u32) -> bool {
        self.lines.lock().get(&line).is_some_and(|l| l.masked)
    }

    /// Number of actions attached to `line`
    pub fn action_count(&self, line: u32) -> usize {
        self.lines.lock().get(&line).map_or(0, |l| l.actions.len())
    }

    /// Delivery counters for `line`
    pub fn stats(&self, line: u32) -> LineStats {
        self.lines.lock().get(&line).map(|l| l.stats).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    const SRC: PciAddress = PciAddress::new(0, 4, 0);

    fn counting(counter: &Arc<AtomicU32>) -> IrqHandler {
        let counter = Arc::clone(counter);
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            IrqReturn::Handled
        })
    }

    #[test]
    fn test_raise_without_handler_stays_pending() {
        let irq = InterruptController::new();
        irq.raise(11, SRC);
        assert!(irq.is_asserted(11));
        assert_eq!(irq.stats(11).dispatched, 0);
    }

    #[test]
    fn test_handler_that_lowers_runs_once() {
        let irq = Arc::new(InterruptController::new());
        let hits = Arc::new(AtomicU32::new(0));

        let ctl = Arc::clone(&irq);
        let counter = Arc::clone(&hits);
        irq.request_irq(
            11,
            IrqFlags::SHARED,
            "test",
            Box::new(move |line| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctl.lower(line, SRC);
                IrqReturn::Handled
            }),
        )
        .unwrap();

        irq.raise(11, SRC);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!irq.is_asserted(11));
        assert_eq!(irq.stats(11).handled, 1);
    }

    #[test]
    fn test_storm_masks_line() {
        let irq = InterruptController::with_storm_threshold(8);
        let hits = Arc::new(AtomicU32::new(0));
        irq.request_irq(5, IrqFlags::empty(), "sloppy", counting(&hits)).unwrap();

        // Handler never acks
        irq.raise(5, SRC);

        assert_eq!(hits.load(Ordering::SeqCst), 8);
        assert!(irq.is_masked(5));
        assert_eq!(irq.stats(5).storms, 1);

        // Masked: further raises are not delivered
        irq.raise(5, SRC);
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_exclusive_line_rejects_second_action() {
        let irq = InterruptController::new();
        let hits = Arc::new(AtomicU32::new(0));
        irq.request_irq(4, IrqFlags::empty(), "serial", counting(&hits)).unwrap();

        let result = irq.request_irq(4, IrqFlags::SHARED, "other", counting(&hits));
        assert_eq!(
            result,
            Err(IrqError::Busy {
                line: 4,
                holder: "serial"
            })
        );
    }

    #[test]
    fn test_shared_line_runs_every_action() {
        // Nobody lowers the line, a threshold of one bounds the run to a single round
        let irq = InterruptController::with_storm_threshold(1);
        let a = Arc::new(AtomicU32::new(0));
        let b = Arc::new(AtomicU32::new(0));
        irq.request_irq(11, IrqFlags::SHARED, "a", counting(&a)).unwrap();
        irq.request_irq(11, IrqFlags::SHARED, "b", counting(&b)).unwrap();
        assert_eq!(irq.action_count(11), 2);

        irq.raise(11, SRC);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_free_irq_stops_delivery() {
        let irq = InterruptController::with_storm_threshold(1);
        let hits = Arc::new(AtomicU32::new(0));
        let token = irq.request_irq(7, IrqFlags::SHARED, "t", counting(&hits)).unwrap();

        irq.free_irq(7, token).unwrap();
        irq.raise(7, SRC);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(
            irq.free_irq(7, token),
            Err(IrqError::UnknownAction { line: 7, token })
        );
    }

    #[test]
    fn test_free_clears_storm_mask() {
        let irq = InterruptController::with_storm_threshold(2);
        let hits = Arc::new(AtomicU32::new(0));
        let token = irq.request_irq(9, IrqFlags::empty(), "t", counting(&hits)).unwrap();
        irq.raise(9, SRC);
        assert!(irq.is_masked(9));

        irq.free_irq(9, token).unwrap();
        assert!(!irq.is_masked(9));
    }

    #[test]
    fn test_shared_line_is_wired_or() {
        let irq = InterruptController::new();
        let other = PciAddress::new(0, 5, 0);

        irq.assert_line(11, SRC);
        irq.assert_line(11, other);
        irq.lower(11, SRC);
        assert!(irq.is_asserted(11));

        irq.lower(11, other);
        assert!(!irq.is_asserted(11));
    }
}
