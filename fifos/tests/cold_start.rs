// A cold switch into a freshly built frame must land on the entry point with
// interrupts off and every general register zeroed. There is no way back from a
// cold switch, so the entry point itself reports the result and exits QEMU.

#![no_std]
#![no_main]

use bootloader::{entry_point, BootInfo};
use core::arch::naked_asm;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicU64, Ordering};
use fifos::context::{self, INITIAL_RFLAGS};
use fifos::{exit_qemu, serial_print, serial_println, QemuExitCode, ThreadStack};
use x86_64::instructions::segmentation::{Segment, DS, ES, FS, GS};
use x86_64::registers::rflags::RFlags;

// rax rbx rcx rdx rsi rdi rbp r8..r15, then rflags
const SNAPSHOT_WORDS: usize = 16;

static SNAPSHOT: [AtomicU64; SNAPSHOT_WORDS] = [const { AtomicU64::new(u64::MAX) }; SNAPSHOT_WORDS];

static mut STACK: ThreadStack = ThreadStack::new();

entry_point!(main);

fn main(_boot_info: &'static BootInfo) -> ! {
    fifos::init();
    serial_print!("cold_start::cold_switch_lands_on_entry...\t");

    // SAFETY: the only use of STACK.
    let stack = unsafe { &mut *core::ptr::addr_of_mut!(STACK) };
    let sp = context::build_initial_frame(stack, register_probe);
    unsafe { context::switch(None, sp) };

    serial_println!("[switch returned]");
    exit_qemu(QemuExitCode::Failed);
}

/// Records every register before any compiled code can touch them.
#[unsafe(naked)]
extern "C" fn register_probe() -> ! {
    naked_asm!(
        "mov [rip + {snapshot}], rax",
        "mov [rip + {snapshot} + 8], rbx",
        "mov [rip + {snapshot} + 16], rcx",
        "mov [rip + {snapshot} + 24], rdx",
        "mov [rip + {snapshot} + 32], rsi",
        "mov [rip + {snapshot} + 40], rdi",
        "mov [rip + {snapshot} + 48], rbp",
        "mov [rip + {snapshot} + 56], r8",
        "mov [rip + {snapshot} + 64], r9",
        "mov [rip + {snapshot} + 72], r10",
        "mov [rip + {snapshot} + 80], r11",
        "mov [rip + {snapshot} + 88], r12",
        "mov [rip + {snapshot} + 96], r13",
        "mov [rip + {snapshot} + 104], r14",
        "mov [rip + {snapshot} + 112], r15",
        "pushfq",
        "pop rax",
        "mov [rip + {snapshot} + 120], rax",
        "jmp {check}",
        snapshot = sym SNAPSHOT,
        check = sym check_snapshot,
    );
}

extern "C" fn check_snapshot() -> ! {
    let rflags = SNAPSHOT[SNAPSHOT_WORDS - 1].load(Ordering::SeqCst);
    for (index, register) in SNAPSHOT[..SNAPSHOT_WORDS - 1].iter().enumerate() {
        assert_eq!(register.load(Ordering::SeqCst), 0, "register #{} not zeroed", index);
    }
    assert_eq!(rflags, INITIAL_RFLAGS);
    assert!(!RFlags::from_bits_truncate(rflags).contains(RFlags::INTERRUPT_FLAG));

    let data = fifos::gdt::data_selector();
    assert_eq!(DS::get_reg(), data);
    assert_eq!(ES::get_reg(), data);
    assert_eq!(FS::get_reg(), data);
    assert_eq!(GS::get_reg(), data);

    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    fifos::test_panic_handler(info)
}
