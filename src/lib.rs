pub mod assembler;
pub mod bytecode;
pub mod interp;
pub mod jit;
pub mod mandelbrot;

pub use assembler::{AssemblerError, ProgramAssembler};
pub use bytecode::{OpCode, Program};
pub use interp::{ExecutionInfo, Interpreter, PrintSymbol, State, VmError, VmResult};
pub use jit::{JitEngine, JitError, STACK_CAPACITY_WORDS, native_jit_supported};
pub use mandelbrot::MandelbrotError;
