//! Architecture-specific context switching
//!
//! Every switch between fibers goes through `switch_context`. A `Context`
//! holds only the callee-saved registers, the stack pointer and the resume
//! address; everything else is spilled by the compiler around the call.

/// Entry point of a fresh fiber. Receives the argument given to
/// `init_context` and must never return.
pub type EntryFn = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("fiberio supports x86_64 and aarch64 only");
    }
}
