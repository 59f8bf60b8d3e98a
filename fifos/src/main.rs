#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(fifos::test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use fifos::vga::{Color, WRITER};
use fifos::{hlt_loop, println, AllThreadsFinished, Scheduler, ThreadEntry, ThreadStack};

const POOL_SIZE: usize = 3;

// Busy-wait between two prints so the interleaving can be followed on screen
const SPIN_DELAY: usize = 20_000_000;

static SCHEDULER: Scheduler<POOL_SIZE> = Scheduler::new(all_done);

static mut STACK1: ThreadStack = ThreadStack::new();
static mut STACK2: ThreadStack = ThreadStack::new();
static mut STACK3: ThreadStack = ThreadStack::new();

entry_point!(kernel_main);

fn kernel_main(_boot_info: &'static BootInfo) -> ! {
    fifos::init();

    #[cfg(test)]
    test_main();

    banner();
    spin_delay();

    // SAFETY: kernel_main runs once, and each stack is handed out exactly once.
    let stacks = unsafe {
        [
            &mut *core::ptr::addr_of_mut!(STACK1),
            &mut *core::ptr::addr_of_mut!(STACK2),
            &mut *core::ptr::addr_of_mut!(STACK3),
        ]
    };
    let workers: [(&str, ThreadEntry); POOL_SIZE] =
        [("worker1", worker1), ("worker2", worker2), ("worker3", worker3)];
    for ((name, entry), stack) in workers.into_iter().zip(stacks) {
        match SCHEDULER.create(entry, stack) {
            Ok(id) => println!("thread '{}' created as #{}.", name, id),
            Err(error) => println!("create thread '{}' failed: {}.", name, error),
        }
    }

    let done = SCHEDULER.start();
    all_done(done)
}

fn banner() {
    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        let mut writer = WRITER.lock();
        writer.set_color(Color::Yellow, Color::Black);
        writer.write_line("FIFOS: cooperative round-robin threads");
        writer.set_color(Color::White, Color::Black);
    });
}

fn spin_delay() {
    for _ in 0..SPIN_DELAY {
        core::hint::spin_loop();
    }
}

// Prints `<label>` `times` times, yielding after each line, then finishes.
fn count_down(label: u32, mut times: u32) -> ! {
    while times > 0 {
        println!("<{}>", label);
        spin_delay();
        times -= 1;
        SCHEDULER.yield_now();
    }
    println!("thread 'worker{}' finished.", label);
    SCHEDULER.finish()
}

extern "C" fn worker1() -> ! {
    count_down(1, 3)
}

extern "C" fn worker2() -> ! {
    count_down(2, 4)
}

extern "C" fn worker3() -> ! {
    count_down(3, 5)
}

fn all_done(_: AllThreadsFinished) -> ! {
    println!("All threads done");
    hlt_loop()
}

// This function is called in case of panic
#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    println!("{}", info);
    hlt_loop()
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    fifos::test_panic_handler(info)
}

