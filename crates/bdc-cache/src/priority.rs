//! Scheduling-priority mechanism and the inversion-avoidance policy.
//!
//! The mechanism ([`PriorityControl`]) reads and changes the priority of the
//! calling thread. The policy ([`boost_target`]) decides how far a worker is
//! raised while it performs I/O that other tasks are blocked on. The two are
//! kept apart so a host scheduler can be plugged in without touching the
//! policy.

use bdc_types::Priority;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use thread_priority::{ThreadPriority, ThreadPriorityValue};
use tracing::debug;

/// Priority of the calling thread, as seen by the host scheduler.
pub trait PriorityControl: Send + Sync {
    /// Priority of the calling thread.
    fn current(&self) -> Priority;

    /// Change the priority of the calling thread, returning the previous one.
    fn set(&self, priority: Priority) -> Priority;
}

thread_local! {
    static LOGICAL_PRIORITY: Cell<Priority> = Cell::new(Priority::default());
    static OS_BASELINE: RefCell<Option<ThreadPriority>> = const { RefCell::new(None) };
}

/// Per-thread logical priority.
///
/// Does not talk to the OS scheduler; every thread carries a priority value
/// the cache records in wait lists and the workers raise and restore.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPriority;

impl HostPriority {
    /// Set the calling thread's logical priority.
    pub fn set_current(priority: Priority) -> Priority {
        LOGICAL_PRIORITY.with(|cell| cell.replace(priority))
    }

    #[must_use]
    pub fn get_current() -> Priority {
        LOGICAL_PRIORITY.with(Cell::get)
    }
}

impl PriorityControl for HostPriority {
    fn current(&self) -> Priority {
        Self::get_current()
    }

    fn set(&self, priority: Priority) -> Priority {
        Self::set_current(priority)
    }
}

/// Logical priority mirrored onto the host thread scheduler.
///
/// Keeps the same per-thread value as [`HostPriority`] and, while the thread
/// is more urgent than [`Priority::default`], also asks the OS to run it at
/// the matching cross-platform priority. Returning to the default or a less
/// urgent value restores the scheduler priority the thread had before its
/// first raise. A scheduler that refuses the change (for example an
/// unprivileged process on Linux) leaves the OS priority untouched; the
/// logical value still moves.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerPriority;

impl SchedulerPriority {
    /// Cross-platform scheduler level (1..=99) for a logical priority, or
    /// `None` when the thread should run at its own baseline. The scheduler
    /// scale runs the other way: higher is more urgent.
    #[must_use]
    pub fn os_level(priority: Priority) -> Option<u8> {
        if !priority.is_more_urgent_than(Priority::default()) {
            return None;
        }
        let raised = Priority::default().0.saturating_sub(priority.0).clamp(1, 99);
        u8::try_from(raised).ok()
    }

    fn raise_os(priority: Priority, value: ThreadPriorityValue) {
        let saved = OS_BASELINE.with(|cell| cell.borrow().is_some());
        if !saved {
            match thread_priority::get_current_thread_priority() {
                Ok(baseline) => OS_BASELINE.with(|cell| *cell.borrow_mut() = Some(baseline)),
                Err(err) => {
                    debug!(
                        target: "bdc::priority",
                        event = "os_priority_unreadable",
                        priority = priority.0,
                        error = ?err
                    );
                    return;
                }
            }
        }
        let requested = ThreadPriority::Crossplatform(value);
        if let Err(err) = thread_priority::set_current_thread_priority(requested) {
            debug!(
                target: "bdc::priority",
                event = "os_priority_refused",
                priority = priority.0,
                error = ?err
            );
        }
    }

    fn restore_os() {
        let Some(baseline) = OS_BASELINE.with(|cell| cell.borrow_mut().take()) else {
            return;
        };
        if let Err(err) = thread_priority::set_current_thread_priority(baseline) {
            debug!(
                target: "bdc::priority",
                event = "os_priority_restore_failed",
                error = ?err
            );
        }
    }
}

impl PriorityControl for SchedulerPriority {
    fn current(&self) -> Priority {
        HostPriority::get_current()
    }

    fn set(&self, priority: Priority) -> Priority {
        let previous = HostPriority::set_current(priority);
        match Self::os_level(priority).map(ThreadPriorityValue::try_from) {
            Some(Ok(value)) => Self::raise_os(priority, value),
            Some(Err(err)) => debug!(
                target: "bdc::priority",
                event = "os_priority_out_of_range",
                priority = priority.0,
                error = ?err
            ),
            None => Self::restore_os(),
        }
        previous
    }
}

/// Priority a worker runs at while serving the given waiters: the most
/// urgent of its own base priority and every waiter's priority.
#[must_use]
pub fn boost_target(base: Priority, waiters: impl IntoIterator<Item = Priority>) -> Priority {
    waiters.into_iter().fold(base, Priority::most_urgent)
}

/// Raises the calling thread's priority until dropped.
pub struct PriorityBoost {
    control: Arc<dyn PriorityControl>,
    restore: Option<Priority>,
}

impl PriorityBoost {
    /// Raise to `target` if it is more urgent than the current priority.
    #[must_use]
    pub fn raise(control: &Arc<dyn PriorityControl>, target: Priority) -> Self {
        let current = control.current();
        let restore = if target.is_more_urgent_than(current) {
            Some(control.set(target))
        } else {
            None
        };
        Self {
            control: Arc::clone(control),
            restore,
        }
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.restore.is_some()
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            self.control.set(previous);
        }
    }
}
