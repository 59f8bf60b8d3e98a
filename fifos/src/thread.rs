// Thread control records and the fixed-size table that holds them.
//
// Nothing in here switches or schedules anything: the table is plain data that
// only the scheduler in `thread_manager` is allowed to mutate.

use core::fmt;
use x86_64::VirtAddr;

/// Size in bytes of every thread stack.
pub const STACK_SIZE: usize = 16 * 1024;

const STACK_WORDS: usize = STACK_SIZE / core::mem::size_of::<u64>();

/// Written into the lowest word of every stack when its thread is created.
/// If it ever changes, the thread has run off the bottom of its region.
pub const STACK_CANARY: u64 = 0xF1F0_5CA9_A8D5_7ACC;

/// The code a thread starts running. It takes nothing and can only leave through
/// `Scheduler::finish`.
pub type ThreadEntry = extern "C" fn() -> !;

/// Slot index of a thread in its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(usize);

impl ThreadId {
    pub const fn new(index: usize) -> Self {
        ThreadId(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Slot never handed out.
    Empty,
    /// Created and not yet finished: either running or waiting for its turn.
    Ready,
    /// The body called `finish`. Finished slots are never reused.
    Finished,
}

/// A private, statically sized stack for one thread.
#[repr(C, align(16))]
pub struct ThreadStack {
    words: [u64; STACK_WORDS],
}

impl ThreadStack {
    pub const fn new() -> Self {
        ThreadStack { words: [0; STACK_WORDS] }
    }

    /// Lowest address of the region.
    pub fn bottom(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.words.as_ptr())
    }

    /// One past the highest address of the region. Always 16-byte aligned.
    pub fn top(&self) -> VirtAddr {
        self.bottom() + STACK_SIZE as u64
    }

    pub(crate) fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }

    pub(crate) fn install_canary(&mut self) {
        self.words[0] = STACK_CANARY;
    }
}

impl Default for ThreadStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct ThreadRecord {
    id: ThreadId,
    stack_top: VirtAddr,
    stack_bottom: VirtAddr,
    saved_stack_pointer: VirtAddr,
    entry_point: Option<ThreadEntry>,
    state: ThreadState,
    /// Reserved for a future priority scheduler. Always 0 and never read by
    /// `select_next`.
    priority: u8,
}

impl ThreadRecord {
    const fn empty(index: usize) -> Self {
        ThreadRecord {
            id: ThreadId::new(index),
            stack_top: VirtAddr::zero(),
            stack_bottom: VirtAddr::zero(),
            saved_stack_pointer: VirtAddr::zero(),
            entry_point: None,
            state: ThreadState::Empty,
            priority: 0,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ThreadState::Ready
    }

    pub fn stack_top(&self) -> VirtAddr {
        self.stack_top
    }

    pub fn saved_stack_pointer(&self) -> VirtAddr {
        self.saved_stack_pointer
    }

    pub fn entry_point(&self) -> Option<ThreadEntry> {
        self.entry_point
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Turns an empty slot into a ready thread whose first frame already sits at
    /// `saved_stack_pointer`.
    pub(crate) fn occupy(
        &mut self,
        entry_point: ThreadEntry,
        stack: &ThreadStack,
        saved_stack_pointer: VirtAddr,
    ) {
        debug_assert_eq!(self.state, ThreadState::Empty);
        self.stack_top = stack.top();
        self.stack_bottom = stack.bottom();
        self.saved_stack_pointer = saved_stack_pointer;
        self.entry_point = Some(entry_point);
        self.state = ThreadState::Ready;
        self.priority = 0;
    }

    pub(crate) fn mark_finished(&mut self) {
        self.state = ThreadState::Finished;
    }

    /// Where the switch primitive stores this thread's stack pointer on suspension.
    pub(crate) fn saved_stack_pointer_slot(&mut self) -> *mut VirtAddr {
        &mut self.saved_stack_pointer
    }

    /// Whether the lowest word of the stack still holds `STACK_CANARY`.
    pub(crate) fn stack_intact(&self) -> bool {
        if self.state == ThreadState::Empty {
            return true;
        }
        // SAFETY: `stack_bottom` is the first word of a `&'static mut ThreadStack`
        // handed over in `Scheduler::create`; the region outlives the record.
        let word = unsafe { self.stack_bottom.as_ptr::<u64>().read_volatile() };
        word == STACK_CANARY
    }
}

/// Fixed-capacity table of `N` thread records, slot `i` holding thread id `i`.
pub struct ThreadTable<const N: usize> {
    records: [ThreadRecord; N],
}

impl<const N: usize> ThreadTable<N> {
    pub const fn new() -> Self {
        let mut records = [ThreadRecord::empty(0); N];
        let mut index = 0;
        while index < N {
            records[index] = ThreadRecord::empty(index);
            index += 1;
        }
        ThreadTable { records }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.records.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut ThreadRecord> {
        self.records.get_mut(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadRecord> {
        self.records.iter()
    }

    /// First slot nobody has claimed yet.
    pub fn first_empty(&self) -> Option<ThreadId> {
        self.records
            .iter()
            .find(|record| record.state == ThreadState::Empty)
            .map(ThreadRecord::id)
    }
}

impl<const N: usize> Default for ThreadTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[test_case]
fn new_table_is_all_empty() {
    let table: ThreadTable<4> = ThreadTable::new();
    assert_eq!(table.capacity(), 4);
    for (index, record) in table.iter().enumerate() {
        assert_eq!(record.id(), ThreadId::new(index));
        assert_eq!(record.state(), ThreadState::Empty);
        assert!(record.entry_point().is_none());
        assert_eq!(record.priority(), 0);
    }
    assert_eq!(table.first_empty(), Some(ThreadId::new(0)));
}

#[test_case]
fn first_empty_skips_ready_and_finished_slots() {
    extern "C" fn idle() -> ! {
        crate::hlt_loop()
    }
    static mut STACK: ThreadStack = ThreadStack::new();
    // SAFETY: only this test touches STACK, and it never runs on it.
    let stack = unsafe { &*core::ptr::addr_of!(STACK) };

    let mut table: ThreadTable<3> = ThreadTable::new();
    let first = table.get_mut(ThreadId::new(0)).unwrap();
    first.occupy(idle, stack, stack.top());
    first.mark_finished();
    table
        .get_mut(ThreadId::new(1))
        .unwrap()
        .occupy(idle, stack, stack.top());

    assert_eq!(table.first_empty(), Some(ThreadId::new(2)));
    assert_eq!(table.get(ThreadId::new(0)).unwrap().state(), ThreadState::Finished);
    assert!(table.get(ThreadId::new(1)).unwrap().is_ready());
    assert!(table.get(ThreadId::new(3)).is_none());
}

#[test_case]
fn stack_bounds_are_aligned() {
    static mut STACK: ThreadStack = ThreadStack::new();
    // SAFETY: only this test touches STACK.
    let stack = unsafe { &mut *core::ptr::addr_of_mut!(STACK) };
    assert!(stack.top().is_aligned(16u64));
    assert_eq!(stack.top() - stack.bottom(), STACK_SIZE as u64);
    stack.install_canary();
    assert_eq!(stack.words_mut()[0], STACK_CANARY);
}
