// A thread whose stack bottom was overwritten must be caught at its next switch.
// Mirrors a `should_panic` test: the panic handler is where success is reported.

#![no_std]
#![no_main]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};
use fifos::{
    exit_qemu, serial_print, serial_println, AllThreadsFinished, QemuExitCode, Scheduler,
    ThreadStack,
};

static SCHEDULER: Scheduler<2> = Scheduler::new(completed);

static mut STACKS: [ThreadStack; 2] = [const { ThreadStack::new() }; 2];

// Lowest address of the victim's stack, captured before the stack is handed over.
static VICTIM_BOTTOM: AtomicU64 = AtomicU64::new(0);

entry_point!(main);

fn main(_boot_info: &'static BootInfo) -> ! {
    fifos::init();
    serial_print!("stack_canary::clobbered_canary_panics...\t");

    // SAFETY: the only use of STACKS.
    let [victim, bystander] = unsafe { &mut *core::ptr::addr_of_mut!(STACKS) };
    VICTIM_BOTTOM.store(victim.bottom().as_u64(), Ordering::SeqCst);
    SCHEDULER.create(overflowing, victim).expect("pool has room");
    SCHEDULER.create(bystander_body, bystander).expect("pool has room");

    SCHEDULER.start();
    serial_println!("[start returned]");
    exit_qemu(QemuExitCode::Failed);
}

extern "C" fn overflowing() -> ! {
    // Stands in for a deep recursion reaching the end of the region.
    let bottom = VICTIM_BOTTOM.load(Ordering::SeqCst) as *mut u64;
    unsafe { bottom.write_volatile(0) };
    SCHEDULER.yield_now();

    serial_println!("[test did not panic]");
    exit_qemu(QemuExitCode::Failed);
}

extern "C" fn bystander_body() -> ! {
    serial_println!("[bystander ran]");
    exit_qemu(QemuExitCode::Failed);
}

fn completed(_: AllThreadsFinished) -> ! {
    serial_println!("[completed without panic]");
    exit_qemu(QemuExitCode::Failed);
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);
}
