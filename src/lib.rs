#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rustdoc::missing_doc_code_examples)]
#![doc = include_str!("../README.md")]

pub mod abi;
pub mod alloc;
pub mod buffer;
pub mod call;
pub mod code;
pub mod compiler;
pub mod error;
pub mod hook;
pub mod intercept;
pub mod signature;

pub use crate::abi::Target;
pub use crate::alloc::{PageProvider, SystemPages};
pub use crate::buffer::{ArgBuffer, ArgFrame, VirtualStack};
pub use crate::call::{CallHandle, CallTarget};
pub use crate::compiler::{compile_call, compile_hook, compile_virtual_call, Compiler};
pub use crate::error::CompileError;
pub use crate::hook::{HookAction, HookHandle, HookInvocation};
pub use crate::intercept::{InterceptError, VtableIntercept};
pub use crate::signature::{CallConvention, FunctionFlags, PassFlags, PassInfo, Signature};
