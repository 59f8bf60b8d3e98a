#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(fifos::test_runner)]
#![reexport_test_harness_main = "test_main"]

use bootloader::{entry_point, BootInfo};
use core::panic::PanicInfo;
use fifos::println;

entry_point!(main);

fn main(_boot_info: &'static BootInfo) -> ! {
    fifos::init();
    test_main();
    fifos::hlt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    fifos::test_panic_handler(info)
}

#[test_case]
fn test_println() {
    println!("test_println output");
}

#[test_case]
fn interrupts_stay_disabled_after_init() {
    assert!(!x86_64::instructions::interrupts::are_enabled());
}
