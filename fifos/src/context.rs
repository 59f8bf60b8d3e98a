// Execution-state snapshots on raw thread stacks, and the primitive that swaps them.
//
// A suspended thread is nothing but a `SwitchFrame` sitting at its saved stack
// pointer. `switch` pushes one for the running flow (warm) or skips that part
// (cold), loads the target's stack pointer and pops the target frame back into
// the processor. Every register, flag and selector the kernel touches while
// switching threads is handled in this file.

use crate::gdt;
use crate::thread::{ThreadEntry, ThreadStack};
use core::arch::naked_asm;
use core::mem::size_of;
use x86_64::VirtAddr;

/// `RFLAGS` bit 1 is reserved and reads as 1.
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// `RFLAGS` a new thread starts with: the reserved bit only, so `IF` is clear.
pub const INITIAL_RFLAGS: u64 = RFLAGS_RESERVED;

/// Words of one frame.
pub const FRAME_WORDS: usize = size_of::<SwitchFrame>() / size_of::<u64>();

// The frame plus its fake return address must be a small slice of any stack.
const _: () = assert!(FRAME_WORDS == 21);
const _: () = assert!((FRAME_WORDS + 1) * 8 * 16 <= crate::thread::STACK_SIZE);

/// Saved execution state, lowest address first.
///
/// The order is fixed by `switch_warm`: the `call` pushes `rip`, then `pushfq`,
/// the general registers from `rax` down to `r15`, and the data selectors
/// `ds es fs gs`. `restore_frame` pops in exactly the reverse order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchFrame {
    pub gs: u64,
    pub fs: u64,
    pub es: u64,
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl SwitchFrame {
    /// State a thread sees on its first instruction: interrupts off, zeroed
    /// registers, flat kernel data selectors.
    pub fn initial(entry_point: ThreadEntry) -> Self {
        let data = u64::from(gdt::data_selector().0);
        SwitchFrame {
            gs: data,
            fs: data,
            es: data,
            ds: data,
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rflags: INITIAL_RFLAGS,
            rip: entry_point as usize as u64,
        }
    }

    /// Reads the frame a suspended (or never started) thread keeps at `stack_pointer`.
    ///
    /// # Safety
    /// `stack_pointer` must be the saved stack pointer of a thread that is not
    /// running.
    pub unsafe fn read_at(stack_pointer: VirtAddr) -> SwitchFrame {
        stack_pointer.as_ptr::<SwitchFrame>().read()
    }
}

/// Writes the first frame of a thread at the top of `stack` and returns its
/// address, which becomes the thread's saved stack pointer.
///
/// Above the frame sits one zero word standing in for a return address, so the
/// entry point starts with the stack alignment of an ordinary call and stack
/// walks end there.
pub fn build_initial_frame(stack: &mut ThreadStack, entry_point: ThreadEntry) -> VirtAddr {
    let words = stack.words_mut();
    let fake_return = words.len() - 1;
    let start = fake_return - FRAME_WORDS;
    words[fake_return] = 0;

    let frame = &mut words[start..fake_return];
    // SAFETY: `frame` is exactly `FRAME_WORDS` in-bounds, 8-byte aligned words,
    // and `SwitchFrame` is `repr(C)` made only of `u64`s.
    unsafe {
        frame
            .as_mut_ptr()
            .cast::<SwitchFrame>()
            .write(SwitchFrame::initial(entry_point));
    }
    VirtAddr::from_ptr(frame.as_ptr())
}

/// Transfers control to the thread whose frame is at `to`.
///
/// With `from` set, the running flow is suspended first: its frame is pushed on
/// the current stack and the resulting stack pointer stored through `from`.
/// The call then returns once some later `switch` targets that stored pointer.
/// With `from` empty nothing is saved and the call never returns.
///
/// # Safety
/// `to` must point at a frame written by `build_initial_frame` or by an earlier
/// warm switch, on a stack that is still alive and not in use. `from`, if set,
/// must stay valid until this flow is resumed.
pub unsafe fn switch(from: Option<*mut VirtAddr>, to: VirtAddr) {
    match from {
        Some(from) => switch_warm(from.cast::<u64>(), to.as_u64()),
        None => switch_cold(to.as_u64()),
    }
}

#[unsafe(naked)]
unsafe extern "C" fn switch_warm(_from: *mut u64, _to: u64) {
    naked_asm!(
        "pushfq",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "xor eax, eax",
        "mov ax, ds",
        "push rax",
        "mov ax, es",
        "push rax",
        "mov ax, fs",
        "push rax",
        "mov ax, gs",
        "push rax",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "jmp {restore}",
        restore = sym restore_frame,
    );
}

#[unsafe(naked)]
unsafe extern "C" fn switch_cold(_to: u64) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "jmp {restore}",
        restore = sym restore_frame,
    );
}

/// Pops the `SwitchFrame` at `rsp` and returns into its `rip`. Only ever jumped to.
#[unsafe(naked)]
unsafe extern "C" fn restore_frame() -> ! {
    naked_asm!(
        "pop rax",
        "mov gs, ax",
        "pop rax",
        "mov fs, ax",
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "popfq",
        "ret",
    );
}

#[cfg(test)]
extern "C" fn parked() -> ! {
    crate::hlt_loop()
}

#[test_case]
fn initial_frame_targets_entry_with_interrupts_off() {
    use x86_64::registers::rflags::RFlags;

    static mut STACK: ThreadStack = ThreadStack::new();
    // SAFETY: only this test touches STACK and nothing runs on it.
    let stack = unsafe { &mut *core::ptr::addr_of_mut!(STACK) };
    let sp = build_initial_frame(stack, parked);
    let frame = unsafe { SwitchFrame::read_at(sp) };

    assert_eq!(frame.rip, parked as usize as u64);
    assert_eq!(frame.rflags, INITIAL_RFLAGS);
    assert!(!RFlags::from_bits_truncate(frame.rflags).contains(RFlags::INTERRUPT_FLAG));
    let registers = [
        frame.rax, frame.rbx, frame.rcx, frame.rdx, frame.rsi, frame.rdi, frame.rbp, frame.r8,
        frame.r9, frame.r10, frame.r11, frame.r12, frame.r13, frame.r14, frame.r15,
    ];
    assert!(registers.iter().all(|&value| value == 0));
    let data = u64::from(gdt::data_selector().0);
    assert_eq!([frame.ds, frame.es, frame.fs, frame.gs], [data; 4]);
}

#[test_case]
fn initial_frame_sits_at_top_of_stack() {
    static mut STACK: ThreadStack = ThreadStack::new();
    // SAFETY: only this test touches STACK and nothing runs on it.
    let stack = unsafe { &mut *core::ptr::addr_of_mut!(STACK) };
    let top = stack.top();
    let sp = build_initial_frame(stack, parked);

    assert_eq!(top - sp, ((FRAME_WORDS + 1) * 8) as u64);
    // After the frame is popped rsp points at the fake return address, which
    // must look like the stack of a freshly called function.
    let entry_rsp = sp + (FRAME_WORDS * 8) as u64;
    assert_eq!(entry_rsp.as_u64() % 16, 8);
    assert_eq!(unsafe { entry_rsp.as_ptr::<u64>().read() }, 0);
}
