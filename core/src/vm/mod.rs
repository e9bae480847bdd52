//! The virtual machine: values, instructions, object pool, segmented stack
//! and the evaluator.

pub mod instruction;
pub mod pool;
pub mod runtime;
pub mod stack;
pub mod value;

pub use instruction::Instruction;
pub use runtime::{BOOTSTRAP, Runtime, RuntimeOptions, VmError};
pub use value::{FnKind, Token, Value};
