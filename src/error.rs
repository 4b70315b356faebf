//! Errors raised while building trampolines

use thiserror::Error;

use crate::alloc::PageError;

/// Failure to construct a call or hook handle
///
/// Construction failures are local: the caller can refuse to bind the native call and report it. Nothing about the
/// compiler is left in a bad state.
#[derive(Debug, Error)]
pub enum CompileError {
    /// No backend knows the calling conventions of the running platform
    #[error("no trampoline backend for this host")]
    UnsupportedHost,
    /// A code page couldn't be allocated or protected
    #[error(transparent)]
    Page(#[from] PageError),
    /// The emitting pass produced a different amount of code than the measuring pass
    #[error("emitted {emitted} bytes of code but measured {measured}")]
    SizeMismatch {
        /// Size found by the measuring pass
        measured: usize,
        /// Size produced by the emitting pass
        emitted: usize,
    },
}
