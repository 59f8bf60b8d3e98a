//! Round-robin scheduler and the calls thread bodies use to give up the CPU.
//!
//! Threads only switch inside [`Scheduler::yield_now`] and [`Scheduler::finish`].
//! Nothing preempts them, so exactly one flow of control exists at any time and
//! the record table needs no protection beyond the lock that hands it from one
//! call to the next.

use crate::context;
use crate::thread::{ThreadEntry, ThreadId, ThreadRecord, ThreadStack, ThreadState, ThreadTable};
use core::fmt;
use spin::Mutex;
use x86_64::VirtAddr;

/// `create` found no empty slot. The thread was not created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted;

impl fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("thread pool exhausted")
    }
}

/// No thread is Ready any more. Not an error: it is how a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllThreadsFinished;

impl fmt::Display for AllThreadsFinished {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("all threads finished")
    }
}

/// The switch `run` has to perform once the scheduler lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPlan {
    /// Nothing worth saving is running: the bootstrap flow, or a thread that
    /// just finished and whose stack is abandoned.
    Cold { next: ThreadId, to: VirtAddr },
    /// Suspend the running thread into `from`, its saved-stack-pointer slot.
    Warm {
        next: ThreadId,
        from: *mut VirtAddr,
        to: VirtAddr,
    },
    /// The caller is the only Ready thread and just keeps running. Its saved
    /// stack pointer is stale while it runs, so it cannot be switched to.
    Stay { current: ThreadId },
}

impl SwitchPlan {
    pub fn next(&self) -> ThreadId {
        match *self {
            SwitchPlan::Cold { next, .. } | SwitchPlan::Warm { next, .. } => next,
            SwitchPlan::Stay { current } => current,
        }
    }
}

/// The record table plus the id of whichever thread currently owns the CPU.
pub struct SchedulerState<const N: usize> {
    table: ThreadTable<N>,
    current: Option<ThreadId>,
}

impl<const N: usize> SchedulerState<N> {
    pub const fn new() -> Self {
        SchedulerState {
            table: ThreadTable::new(),
            current: None,
        }
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn record(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.table.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.table.iter()
    }

    /// Claims the first empty slot for `entry_point` and writes its first frame
    /// on `stack`.
    pub fn create(
        &mut self,
        entry_point: ThreadEntry,
        stack: &'static mut ThreadStack,
    ) -> Result<ThreadId, PoolExhausted> {
        let id = self.table.first_empty().ok_or(PoolExhausted)?;
        stack.install_canary();
        let saved_stack_pointer = context::build_initial_frame(stack, entry_point);
        let record = self.table.get_mut(id).ok_or(PoolExhausted)?;
        record.occupy(entry_point, stack, saved_stack_pointer);
        Ok(id)
    }

    /// Next Ready thread in circular order, starting right after the current
    /// one and ending with the current one itself.
    pub fn select_next(&self) -> Option<ThreadId> {
        let start = self.current.map_or(0, |id| id.index() + 1);
        (0..N)
            .map(|offset| ThreadId::new((start + offset) % N))
            .find(|&id| self.table.get(id).is_some_and(ThreadRecord::is_ready))
    }

    /// Marks the running thread Finished. It will never be selected again.
    pub fn finish_current(&mut self) {
        let id = self
            .current
            .expect("finish called outside of a thread");
        if let Some(record) = self.table.get_mut(id) {
            record.mark_finished();
        }
    }

    /// Picks the next thread and makes it current. `current` has to be right
    /// before the switch is issued: the outgoing thread only comes back out of
    /// `switch` once somebody else has scheduled it again.
    pub fn plan_switch(&mut self) -> Result<SwitchPlan, AllThreadsFinished> {
        if let Some(previous) = self.current {
            self.check_stack(previous);
        }
        let next = self.select_next().ok_or(AllThreadsFinished)?;
        let to = self
            .table
            .get(next)
            .map(ThreadRecord::saved_stack_pointer)
            .ok_or(AllThreadsFinished)?;

        let previous = self.current.replace(next);
        let outgoing = previous
            .and_then(|id| self.table.get_mut(id))
            .filter(|record| record.is_ready());
        Ok(match outgoing {
            Some(record) if record.id() == next => SwitchPlan::Stay { current: next },
            Some(record) => SwitchPlan::Warm {
                next,
                from: record.saved_stack_pointer_slot(),
                to,
            },
            None => SwitchPlan::Cold { next, to },
        })
    }

    fn check_stack(&self, id: ThreadId) {
        if let Some(record) = self.table.get(id) {
            if !record.stack_intact() {
                panic!("thread {} overflowed its stack (top {:?})", id, record.stack_top());
            }
        }
    }
}

impl<const N: usize> Default for SchedulerState<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool of `N` cooperative threads.
///
/// Meant to live in a `static`: thread bodies reach the scheduler that runs them
/// through it, since an entry point takes no arguments.
pub struct Scheduler<const N: usize> {
    state: Mutex<SchedulerState<N>>,
    on_complete: fn(AllThreadsFinished) -> !,
}

impl<const N: usize> Scheduler<N> {
    /// `on_complete` runs once, on the stack of the last thread to finish.
    pub const fn new(on_complete: fn(AllThreadsFinished) -> !) -> Self {
        Scheduler {
            state: Mutex::new(SchedulerState::new()),
            on_complete,
        }
    }

    /// Adds a thread. Must happen before `start`; there is no locking against a
    /// running thread creating more.
    ///
    /// The body behind `entry_point` must end by calling `finish` and must keep
    /// within `STACK_SIZE` bytes of stack.
    pub fn create(
        &self,
        entry_point: ThreadEntry,
        stack: &'static mut ThreadStack,
    ) -> Result<ThreadId, PoolExhausted> {
        let mut state = self.state.lock();
        debug_assert!(state.current.is_none(), "threads must be created before start");
        match state.create(entry_point, stack) {
            Ok(id) => {
                log::info!("thread {} created", id);
                Ok(id)
            }
            Err(error) => {
                log::warn!("cannot create thread: {}", error);
                Err(error)
            }
        }
    }

    /// The thread running right now, if any.
    pub fn current(&self) -> Option<ThreadId> {
        self.state.lock().current()
    }

    pub fn thread_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.state.lock().record(id).map(ThreadRecord::state)
    }

    /// Cold-switches into the first Ready thread. Only comes back if there is
    /// none, which includes a table nobody ever created a thread in.
    pub fn start(&self) -> AllThreadsFinished {
        assert!(self.current().is_none(), "scheduler already started");
        match self.run() {
            Ok(()) => unreachable!("bootstrap flow was resumed"),
            Err(done) => {
                log::info!("no thread to start");
                done
            }
        }
    }

    /// Lets every other Ready thread run once before the caller continues.
    /// Returns right after the call once the caller is picked again.
    pub fn yield_now(&self) {
        assert!(self.current().is_some(), "yield_now called outside of a thread");
        // The caller is still Ready, so there is always someone to switch to.
        if let Err(done) = self.run() {
            (self.on_complete)(done);
        }
    }

    /// Ends the calling thread. Its stack is abandoned as is.
    pub fn finish(&self) -> ! {
        {
            let mut state = self.state.lock();
            state.finish_current();
            if let Some(id) = state.current() {
                log::debug!("thread {} finished", id);
            }
        }
        match self.run() {
            Ok(()) => unreachable!("finished thread was resumed"),
            Err(done) => {
                log::info!("All threads done");
                (self.on_complete)(done)
            }
        }
    }

    /// Switches to the next Ready thread, if there is one.
    ///
    /// The lock is dropped before switching: the switch only returns when this
    /// flow is resumed, long after other threads have needed the table.
    fn run(&self) -> Result<(), AllThreadsFinished> {
        let plan = self.state.lock().plan_switch()?;
        log::trace!("switching: {:?}", plan);
        match plan {
            SwitchPlan::Stay { .. } => {}
            // SAFETY: `to` is the saved stack pointer of a Ready thread that is
            // not running.
            SwitchPlan::Cold { to, .. } => unsafe { context::switch(None, to) },
            // SAFETY: as above, and `from` points into this scheduler's table,
            // which outlives every thread it runs.
            SwitchPlan::Warm { from, to, .. } => unsafe { context::switch(Some(from), to) },
        }
        Ok(())
    }
}
