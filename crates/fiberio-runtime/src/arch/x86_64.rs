//! x86_64 context switching (System V AMD64)

use super::EntryFn;
use std::arch::naked_asm;

/// Saved register set of a suspended fiber
///
/// Field offsets are baked into `switch_context`; do not reorder.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Prepare `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `ctx` must be valid for writes and `stack_top` must be the upper end
/// of a writable stack that outlives every switch into `ctx`.
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // rsp is 16-byte aligned when the trampoline issues `call`, so the
    // callee sees rsp % 16 == 8 like after any ordinary call.
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry is `-> !`
        "ud2",
    );
}

/// Save the running context into `from` and resume `to`.
///
/// Returns when some other context switches back into `from`.
///
/// # Safety
///
/// Both pointers must be valid; `to` must have been filled either by
/// `init_context` or by a previous `switch_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        // save into rdi
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // load from rsi
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        "1:",
        "ret",
    );
}
