//! Native execution engine: translates bytecode to AArch64 machine code and
//! runs it in place against a host-populated context record.

pub mod backend;
pub mod masm;
pub mod memory;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("the jit module only builds on Linux and macOS");

use std::time::Instant;

use tracing::debug;

use crate::bytecode::Program;
use crate::interp::{ExecutionInfo, PrintSymbol, State, VmError, VmResult};
use crate::jit::backend::{
    ERROR_NONE, ERROR_STACK_OVERFLOW, ERROR_STACK_UNDERFLOW, JitBackend, JitContext,
};

/// Errors surfaced while producing code, split from runtime error codes.
/// `OutputExhausted` is an emission-internal defect rather than a property
/// of the input program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    AllocationFailed(String),
    ProtectionFailed(String),
    UnsupportedHost,
    InvalidOpcode(u8),
    TruncatedOperand { offset: usize, opcode: u8 },
    InvalidBranchTarget { offset: usize, target: i64 },
    BranchOutOfRange { delta_bytes: i64 },
    InvalidOffset(i64),
    InvalidShift(u32),
    UnknownLabel(u32),
    LabelAlreadyBound(u32),
    UnboundLabel(u32),
    OutputExhausted { cursor: u32, capacity: usize },
    UnexpectedErrorCode(u32),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::AllocationFailed(message) => {
                write!(f, "executable memory allocation failed: {message}")
            }
            JitError::ProtectionFailed(message) => {
                write!(f, "memory protection change failed: {message}")
            }
            JitError::UnsupportedHost => {
                write!(f, "native execution requires an aarch64 linux/macos host")
            }
            JitError::InvalidOpcode(opcode) => {
                write!(f, "opcode {opcode:#04x} has no native lowering")
            }
            JitError::TruncatedOperand { offset, opcode } => {
                write!(f, "opcode {opcode:#04x} at {offset} has a truncated operand")
            }
            JitError::InvalidBranchTarget { offset, target } => {
                write!(f, "branch at {offset} targets invalid offset {target}")
            }
            JitError::BranchOutOfRange { delta_bytes } => {
                write!(f, "branch displacement {delta_bytes} exceeds encoding range")
            }
            JitError::InvalidOffset(offset) => {
                write!(f, "load/store offset {offset} is not encodable")
            }
            JitError::InvalidShift(shift) => {
                write!(f, "shift amount {shift} exceeds 31")
            }
            JitError::UnknownLabel(id) => write!(f, "unknown label {id}"),
            JitError::LabelAlreadyBound(id) => write!(f, "label {id} bound twice"),
            JitError::UnboundLabel(id) => {
                write!(f, "label {id} referenced but never bound")
            }
            JitError::OutputExhausted { cursor, capacity } => {
                write!(f, "code buffer exhausted at {cursor} of {capacity} bytes")
            }
            JitError::UnexpectedErrorCode(code) => {
                write!(f, "compiled code reported unknown error code {code}")
            }
        }
    }
}

impl std::error::Error for JitError {}

pub fn native_jit_supported() -> bool {
    cfg!(target_arch = "aarch64") && (cfg!(target_os = "linux") || cfg!(target_os = "macos"))
}

/// Minimum operand stack guaranteed to compiled code, in 32-bit words.
pub const STACK_CAPACITY_WORDS: usize = 4096;

/// Compiles a program and runs the result against caller-provided state
/// buffers, reporting through the same result type as the interpreter.
pub struct JitEngine {
    backend: JitBackend,
}

impl Default for JitEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl JitEngine {
    pub fn new() -> Self {
        Self {
            backend: JitBackend::new(),
        }
    }

    pub fn with_print_symbol(print: PrintSymbol) -> Self {
        Self {
            backend: JitBackend::with_print_symbol(print),
        }
    }

    pub fn run(&self, program: &Program, state: &mut State) -> VmResult<ExecutionInfo> {
        if !native_jit_supported() {
            return Err(JitError::UnsupportedHost.into());
        }

        let started = Instant::now();
        let compiled = self.backend.compile(program)?;
        debug!(
            "compiled {} bytecode bytes to {} native bytes in {:?}",
            program.code.len(),
            compiled.code_size(),
            started.elapsed()
        );

        if state.stack.len() < STACK_CAPACITY_WORDS {
            state.stack.resize(STACK_CAPACITY_WORDS, 0);
        }

        let stack_base = state.stack.as_mut_ptr();
        let mut ctx = JitContext {
            memory: if state.memory.is_empty() {
                std::ptr::null_mut()
            } else {
                state.memory.as_mut_ptr()
            },
            stack_base,
            stack_top: stack_base,
            stack_end: unsafe { stack_base.add(state.stack.len()) },
            locals: if state.locals.is_empty() {
                std::ptr::null_mut()
            } else {
                state.locals.as_mut_ptr()
            },
            error_code: ERROR_NONE,
        };

        let entry = compiled.entry();
        let started = Instant::now();
        let return_value = unsafe { entry(&mut ctx) };
        debug!("native execution finished in {:?}", started.elapsed());

        match ctx.error_code {
            ERROR_NONE => {}
            ERROR_STACK_UNDERFLOW => return Err(VmError::StackUnderflow),
            ERROR_STACK_OVERFLOW => return Err(VmError::StackOverflow),
            other => return Err(JitError::UnexpectedErrorCode(other).into()),
        }

        let consumed = unsafe { ctx.stack_top.offset_from(ctx.stack_base) };
        if consumed < 0 {
            return Err(VmError::StackUnderflow);
        }
        state.stack.truncate(consumed as usize);

        Ok(ExecutionInfo {
            pc: 0,
            return_value,
        })
    }
}
