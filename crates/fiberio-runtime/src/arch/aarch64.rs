//! aarch64 context switching (AAPCS64)

use super::EntryFn;
use std::arch::naked_asm;

/// Saved register set of a suspended fiber
///
/// x19..x28, fp, lr, sp and the low halves of v8..v15. Offsets are baked
/// into `switch_context`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub x: [u64; 10], // x19..x28, 0..80
    pub fp: u64,      // 80
    pub lr: u64,      // 88
    pub sp: u64,      // 96
    pub d: [u64; 8],  // d8..d15, 104..168
}

/// Prepare `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `ctx` must be valid for writes and `stack_top` must be the upper end
/// of a writable stack that outlives every switch into `ctx`.
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.sp = ((stack_top as usize) & !0xF) as u64;
    ctx.lr = fiber_trampoline as usize as u64;
    ctx.x[0] = entry as usize as u64;
    ctx.x[1] = arg as u64;
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0",
    );
}

/// Save the running context into `from` and resume `to`.
///
/// # Safety
///
/// Both pointers must be valid; `to` must have been filled either by
/// `init_context` or by a previous `switch_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut Context, _to: *const Context) {
    naked_asm!(
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        "stp d8, d9, [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
    );
}
