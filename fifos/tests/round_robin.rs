// Three counting threads sharing the CPU: the interleaving must follow strict
// round-robin order, and completion must be reported exactly once.

#![no_std]
#![no_main]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicUsize, Ordering};
use fifos::{
    exit_qemu, serial_print, serial_println, AllThreadsFinished, PoolExhausted, QemuExitCode,
    Scheduler, ThreadId, ThreadStack, ThreadState,
};
use spin::Mutex;

// Digits are the "<n>" lines, letters the "thread n finished" lines.
const EXPECTED: &[u8] = b"123123123A23B3C";

static SCHEDULER: Scheduler<3> = Scheduler::new(completed);
static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);
static TRACE: Mutex<Trace> = Mutex::new(Trace::new());

static mut STACKS: [ThreadStack; 4] = [const { ThreadStack::new() }; 4];

struct Trace {
    events: [u8; 32],
    len: usize,
}

impl Trace {
    const fn new() -> Self {
        Trace { events: [0; 32], len: 0 }
    }

    fn push(&mut self, event: u8) {
        self.events[self.len] = event;
        self.len += 1;
    }

    fn as_bytes(&self) -> &[u8] {
        &self.events[..self.len]
    }
}

entry_point!(main);

fn main(_boot_info: &'static BootInfo) -> ! {
    fifos::init();
    serial_print!("round_robin::three_threads_interleave...\t");

    // SAFETY: the only use of STACKS.
    let [first, second, third, spare] = unsafe { &mut *core::ptr::addr_of_mut!(STACKS) };
    assert_eq!(SCHEDULER.create(counter1, first), Ok(ThreadId::new(0)));
    assert_eq!(SCHEDULER.create(counter2, second), Ok(ThreadId::new(1)));
    assert_eq!(SCHEDULER.create(counter3, third), Ok(ThreadId::new(2)));

    assert_eq!(SCHEDULER.create(counter1, spare), Err(PoolExhausted));
    for index in 0..3 {
        assert_eq!(SCHEDULER.thread_state(ThreadId::new(index)), Some(ThreadState::Ready));
    }
    assert_eq!(SCHEDULER.current(), None);

    SCHEDULER.start();
    serial_println!("[start returned]");
    exit_qemu(QemuExitCode::Failed);
}

fn count_down(label: u8, finished: u8, mut times: u32) -> ! {
    while times > 0 {
        TRACE.lock().push(label);
        times -= 1;
        SCHEDULER.yield_now();
    }
    TRACE.lock().push(finished);
    SCHEDULER.finish()
}

extern "C" fn counter1() -> ! {
    assert_eq!(SCHEDULER.current(), Some(ThreadId::new(0)));
    count_down(b'1', b'A', 3)
}

extern "C" fn counter2() -> ! {
    assert_eq!(SCHEDULER.current(), Some(ThreadId::new(1)));
    count_down(b'2', b'B', 4)
}

extern "C" fn counter3() -> ! {
    assert_eq!(SCHEDULER.current(), Some(ThreadId::new(2)));
    count_down(b'3', b'C', 5)
}

fn completed(_: AllThreadsFinished) -> ! {
    assert_eq!(COMPLETIONS.fetch_add(1, Ordering::SeqCst), 0);
    assert_eq!(TRACE.lock().as_bytes(), EXPECTED);
    for index in 0..3 {
        assert_eq!(
            SCHEDULER.thread_state(ThreadId::new(index)),
            Some(ThreadState::Finished)
        );
    }
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    fifos::test_panic_handler(info)
}
