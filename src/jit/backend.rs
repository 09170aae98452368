use super::JitError;
use super::masm::{Cond, Label, MacroAssembler};
use super::memory::{ExecutableMemory, flush_instruction_cache};
use crate::bytecode::{OpCode, Program, read_i32_le, read_u32_le};
use crate::interp::PrintSymbol;

/// Record shared between the host and compiled code. Compiled code locates
/// the operand stack, locals, and linear memory through it and reports
/// runtime errors into `error_code`.
#[repr(C)]
pub struct JitContext {
    pub memory: *mut u8,
    pub stack_base: *mut u32,
    pub stack_top: *mut u32,
    pub stack_end: *mut u32,
    pub locals: *mut u32,
    pub error_code: u32,
}

pub type EntryFn = unsafe extern "C" fn(*mut JitContext) -> u32;

pub const ERROR_NONE: u32 = 0;
pub const ERROR_STACK_UNDERFLOW: u32 = 1;
pub const ERROR_STACK_OVERFLOW: u32 = 2;

const PTR: i32 = std::mem::size_of::<*const u8>() as i32;
const OFF_STACK_BASE: i32 = PTR;
const OFF_STACK_TOP: i32 = 2 * PTR;
const OFF_STACK_END: i32 = 3 * PTR;
const OFF_LOCALS: i32 = 4 * PTR;
const OFF_ERROR_CODE: i32 = 5 * PTR;

// Fixed register assignment for compiled functions. Live values only ever
// inhabit the callee-saved pair X19/X20, which is what makes the host call
// in PRINT safe.
const CTX: u8 = 19;
const TOP: u8 = 20;
const RET_W0: u8 = 0;
const ERR_W1: u8 = 1;
const VAL_W2: u8 = 2;
const LHS_W3: u8 = 3;
const LOCALS_X4: u8 = 4;
const INDEX_W5: u8 = 5;
const ADDR_X6: u8 = 6;
const FLAG_W7: u8 = 7;
const SCRATCH_X9: u8 = 9;
const LIMIT_X10: u8 = 10;
const CALL_X16: u8 = 16;
const LR: u8 = 30;
const SP: u8 = 31;
const ZR: u8 = 31;

const FRAME_SIZE: u32 = 32;

// Conservative upper bound on the emitted code: no lowering exceeds 24
// instructions per opcode, plus the fixed prologue/exit scaffolding.
const MAX_WORDS_PER_OPCODE: usize = 24;
const SCAFFOLD_WORDS: usize = 32;

pub(crate) fn estimate_code_bytes(program: &Program) -> usize {
    (program.code.len() * MAX_WORDS_PER_OPCODE + SCAFFOLD_WORDS) * 4
}

/// Owning handle to a finalized region of compiled code.
#[derive(Debug)]
pub struct CompiledCode {
    memory: ExecutableMemory,
    code_size: u32,
}

impl CompiledCode {
    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr(), self.code_size as usize) }
    }

    /// Reinterprets the buffer base as the entry function.
    ///
    /// # Safety
    ///
    /// Calling the returned pointer executes the buffer as AArch64 machine
    /// code; the caller must be on a matching host with a fully populated
    /// context.
    pub fn entry(&self) -> EntryFn {
        unsafe { std::mem::transmute::<*const u8, EntryFn>(self.memory.as_ptr()) }
    }
}

/// Translates bytecode to native AArch64 code, one fixed micro-sequence per
/// opcode, against the `JitContext` calling convention.
pub struct JitBackend {
    print: PrintSymbol,
}

impl Default for JitBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl JitBackend {
    pub fn new() -> Self {
        Self {
            print: libc::putchar,
        }
    }

    pub fn with_print_symbol(print: PrintSymbol) -> Self {
        Self { print }
    }

    pub fn compile(&self, program: &Program) -> Result<CompiledCode, JitError> {
        let mut memory = ExecutableMemory::new(estimate_code_bytes(program))?;
        memory.begin_write()?;

        let code_size = {
            let mut masm = MacroAssembler::new(&mut memory);
            self.translate(program, &mut masm)?;
            masm.finalize()?;
            masm.code_size_bytes()
        };

        memory.end_write()?;
        flush_instruction_cache(memory.as_ptr(), code_size as usize);
        memory.finalize()?;

        Ok(CompiledCode { memory, code_size })
    }

    fn translate(
        &self,
        program: &Program,
        masm: &mut MacroAssembler<'_>,
    ) -> Result<(), JitError> {
        let code = &program.code;

        // Pass 1: one label per opcode offset, plus one past the end.
        let mut offset_labels: Vec<Option<Label>> = vec![None; code.len() + 1];
        let mut pc = 0usize;
        while pc < code.len() {
            offset_labels[pc] = Some(masm.create_label());
            let raw = code[pc];
            let op = OpCode::from_u8(raw).ok_or(JitError::InvalidOpcode(raw))?;
            let next = pc + 1 + op.operand_width();
            if next > code.len() {
                return Err(JitError::TruncatedOperand {
                    offset: pc,
                    opcode: raw,
                });
            }
            pc = next;
        }
        offset_labels[code.len()] = Some(masm.create_label());

        let runtime_error = masm.create_label();
        let epilogue = masm.create_label();

        // Prologue: 32-byte frame, X30/X20/X19 saved, context into X19,
        // cached stack top into X20.
        masm.emit_subtract_immediate_from_pointer(SP, SP, FRAME_SIZE)?;
        masm.emit_store_pointer_from_register_to_base_plus_offset(LR, SP, 24)?;
        masm.emit_store_pointer_from_register_to_base_plus_offset(TOP, SP, 16)?;
        masm.emit_store_pointer_from_register_to_base_plus_offset(CTX, SP, 8)?;
        masm.emit_move_pointer_register(CTX, 0)?;
        masm.emit_load_pointer_from_base_plus_offset(TOP, CTX, OFF_STACK_TOP)?;

        // Pass 2: per-opcode emission.
        let mut pc = 0usize;
        while pc < code.len() {
            let opcode_pc = pc;
            masm.bind_label(label_at(&offset_labels, opcode_pc)?)?;

            let raw = code[pc];
            pc += 1;
            let op = OpCode::from_u8(raw).ok_or(JitError::InvalidOpcode(raw))?;

            match op {
                OpCode::Nop => {}

                OpCode::Push => {
                    let imm = read_operand_u32(code, &mut pc, opcode_pc, raw)?;
                    check_push_bytes(masm, 4, ERROR_STACK_OVERFLOW, runtime_error)?;
                    masm.emit_move_immediate_u32(VAL_W2, imm)?;
                    masm.emit_store_u32_from_register_to_base_plus_offset(VAL_W2, TOP, 0)?;
                    masm.emit_add_immediate_to_pointer(TOP, TOP, 4)?;
                }

                OpCode::Pop => {
                    check_pop_bytes(masm, 4, ERROR_STACK_UNDERFLOW, runtime_error)?;
                    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
                }

                OpCode::LocalGet => {
                    let index = read_operand_u32(code, &mut pc, opcode_pc, raw)?;
                    emit_local_address(masm, index)?;
                    masm.emit_load_u32_from_base_plus_offset(VAL_W2, ADDR_X6, 0)?;
                    masm.emit_store_u32_from_register_to_base_plus_offset(VAL_W2, TOP, 0)?;
                    masm.emit_add_immediate_to_pointer(TOP, TOP, 4)?;
                }

                OpCode::LocalSet => {
                    let index = read_operand_u32(code, &mut pc, opcode_pc, raw)?;
                    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
                    masm.emit_load_u32_from_base_plus_offset(VAL_W2, TOP, 0)?;
                    emit_local_address(masm, index)?;
                    masm.emit_store_u32_from_register_to_base_plus_offset(VAL_W2, ADDR_X6, 0)?;
                }

                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div => {
                    check_pop_bytes(masm, 8, ERROR_STACK_UNDERFLOW, runtime_error)?;
                    emit_pop_operands(masm)?;
                    match op {
                        OpCode::Add => masm.emit_add_u32_register(LHS_W3, LHS_W3, VAL_W2)?,
                        OpCode::Sub => masm.emit_subtract_u32_register(LHS_W3, LHS_W3, VAL_W2)?,
                        OpCode::Mul => masm.emit_multiply_u32_register(LHS_W3, LHS_W3, VAL_W2)?,
                        _ => masm.emit_divide_i32_register(LHS_W3, LHS_W3, VAL_W2)?,
                    }
                    masm.emit_store_u32_from_register_to_base_plus_offset(LHS_W3, TOP, 0)?;
                    masm.emit_add_immediate_to_pointer(TOP, TOP, 4)?;
                }

                OpCode::Eq | OpCode::LtS | OpCode::LtU => {
                    check_pop_bytes(masm, 8, ERROR_STACK_UNDERFLOW, runtime_error)?;
                    emit_pop_operands(masm)?;
                    masm.emit_compare_u32_registers(LHS_W3, VAL_W2)?;
                    let cond = match op {
                        OpCode::Eq => Cond::Eq,
                        OpCode::LtS => Cond::Lt,
                        _ => Cond::Lo,
                    };
                    masm.emit_cset_u32(FLAG_W7, cond)?;
                    masm.emit_store_u32_from_register_to_base_plus_offset(FLAG_W7, TOP, 0)?;
                    masm.emit_add_immediate_to_pointer(TOP, TOP, 4)?;
                }

                OpCode::Jump => {
                    let rel = read_operand_i32(code, &mut pc, opcode_pc, raw)?;
                    let target = branch_target(&offset_labels, code.len(), opcode_pc, rel)?;
                    masm.branch(target)?;
                }

                OpCode::JumpIfZero => {
                    let rel = read_operand_i32(code, &mut pc, opcode_pc, raw)?;
                    let target = branch_target(&offset_labels, code.len(), opcode_pc, rel)?;
                    check_pop_bytes(masm, 4, ERROR_STACK_UNDERFLOW, runtime_error)?;
                    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
                    masm.emit_load_u32_from_base_plus_offset(VAL_W2, TOP, 0)?;
                    masm.emit_compare_u32_registers(VAL_W2, ZR)?;
                    masm.branch_equal(target)?;
                }

                OpCode::JumpIfNotZero => {
                    let rel = read_operand_i32(code, &mut pc, opcode_pc, raw)?;
                    let target = branch_target(&offset_labels, code.len(), opcode_pc, rel)?;
                    check_pop_bytes(masm, 4, ERROR_STACK_UNDERFLOW, runtime_error)?;
                    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
                    masm.emit_load_u32_from_base_plus_offset(VAL_W2, TOP, 0)?;
                    masm.emit_compare_u32_registers(VAL_W2, ZR)?;
                    masm.branch_not_equal(target)?;
                }

                OpCode::Print => {
                    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
                    masm.emit_load_u32_from_base_plus_offset(VAL_W2, TOP, 0)?;
                    masm.emit_move_u32_register(RET_W0, VAL_W2)?;
                    masm.emit_move_pointer_immediate(CALL_X16, self.print as usize as u64)?;
                    masm.emit_call_register(CALL_X16)?;
                }

                OpCode::Ret => {
                    check_pop_bytes(masm, 4, ERROR_STACK_UNDERFLOW, runtime_error)?;
                    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
                    masm.emit_load_u32_from_base_plus_offset(VAL_W2, TOP, 0)?;
                    masm.emit_store_pointer_from_register_to_base_plus_offset(
                        TOP,
                        CTX,
                        OFF_STACK_TOP,
                    )?;
                    masm.emit_move_u32_register(RET_W0, VAL_W2)?;
                    masm.branch(epilogue)?;
                }

                OpCode::Load8U
                | OpCode::Load16U
                | OpCode::Load32
                | OpCode::Store8
                | OpCode::Read8U => {
                    return Err(JitError::InvalidOpcode(raw));
                }
            }
        }

        // Fell off the end: publish the stack top and return zero.
        masm.bind_label(label_at(&offset_labels, code.len())?)?;
        masm.emit_store_pointer_from_register_to_base_plus_offset(TOP, CTX, OFF_STACK_TOP)?;
        masm.emit_move_immediate_u32(RET_W0, 0)?;
        masm.branch(epilogue)?;

        // Shared runtime-error exit: publish the stack top, record the
        // staged error code, return zero.
        masm.bind_label(runtime_error)?;
        masm.emit_store_pointer_from_register_to_base_plus_offset(TOP, CTX, OFF_STACK_TOP)?;
        masm.emit_store_u32_from_register_to_base_plus_offset(ERR_W1, CTX, OFF_ERROR_CODE)?;
        masm.emit_move_immediate_u32(RET_W0, 0)?;
        masm.branch(epilogue)?;

        masm.bind_label(epilogue)?;
        masm.emit_load_pointer_from_base_plus_offset(CTX, SP, 8)?;
        masm.emit_load_pointer_from_base_plus_offset(TOP, SP, 16)?;
        masm.emit_load_pointer_from_base_plus_offset(LR, SP, 24)?;
        masm.emit_add_immediate_to_pointer(SP, SP, FRAME_SIZE)?;
        masm.emit_return()?;

        Ok(())
    }
}

/// Loads the address of local `index` into X6.
fn emit_local_address(masm: &mut MacroAssembler<'_>, index: u32) -> Result<(), JitError> {
    masm.emit_load_pointer_from_base_plus_offset(LOCALS_X4, CTX, OFF_LOCALS)?;
    masm.emit_move_immediate_u32(INDEX_W5, index)?;
    masm.emit_shift_left_u32_immediate(INDEX_W5, INDEX_W5, 2)?;
    masm.emit_add_pointer_register(ADDR_X6, LOCALS_X4, INDEX_W5)
}

/// Pops rhs into W2 and lhs into W3. The top is decremented before each
/// load.
fn emit_pop_operands(masm: &mut MacroAssembler<'_>) -> Result<(), JitError> {
    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
    masm.emit_load_u32_from_base_plus_offset(VAL_W2, TOP, 0)?;
    masm.emit_subtract_immediate_from_pointer(TOP, TOP, 4)?;
    masm.emit_load_u32_from_base_plus_offset(LHS_W3, TOP, 0)
}

/// Guard for `bytes` of headroom: stages the error code in W1 and branches
/// to the runtime-error block when top + bytes would pass stack_end.
fn check_push_bytes(
    masm: &mut MacroAssembler<'_>,
    bytes: u32,
    error_code: u32,
    runtime_error: Label,
) -> Result<(), JitError> {
    masm.emit_move_immediate_u32(ERR_W1, error_code)?;
    masm.emit_load_pointer_from_base_plus_offset(LIMIT_X10, CTX, OFF_STACK_END)?;
    masm.emit_add_immediate_to_pointer(SCRATCH_X9, TOP, bytes)?;
    masm.emit_compare_pointer_registers(SCRATCH_X9, LIMIT_X10)?;
    masm.branch_cond(Cond::Hi, runtime_error)
}

/// Guard for `bytes` of populated stack: branches to the runtime-error
/// block when top - bytes would pass stack_base.
fn check_pop_bytes(
    masm: &mut MacroAssembler<'_>,
    bytes: u32,
    error_code: u32,
    runtime_error: Label,
) -> Result<(), JitError> {
    masm.emit_move_immediate_u32(ERR_W1, error_code)?;
    masm.emit_load_pointer_from_base_plus_offset(LIMIT_X10, CTX, OFF_STACK_BASE)?;
    masm.emit_subtract_immediate_from_pointer(SCRATCH_X9, TOP, bytes)?;
    masm.emit_compare_pointer_registers(SCRATCH_X9, LIMIT_X10)?;
    masm.branch_cond(Cond::Lo, runtime_error)
}

fn label_at(labels: &[Option<Label>], offset: usize) -> Result<Label, JitError> {
    labels
        .get(offset)
        .copied()
        .flatten()
        .ok_or(JitError::InvalidBranchTarget {
            offset,
            target: offset as i64,
        })
}

fn branch_target(
    labels: &[Option<Label>],
    code_len: usize,
    opcode_pc: usize,
    rel: i32,
) -> Result<Label, JitError> {
    let target = opcode_pc as i64 + i64::from(rel);
    if target < 0 || target > code_len as i64 {
        return Err(JitError::InvalidBranchTarget {
            offset: opcode_pc,
            target,
        });
    }
    labels
        .get(target as usize)
        .copied()
        .flatten()
        .ok_or(JitError::InvalidBranchTarget {
            offset: opcode_pc,
            target,
        })
}

fn read_operand_u32(
    code: &[u8],
    pc: &mut usize,
    opcode_pc: usize,
    opcode: u8,
) -> Result<u32, JitError> {
    read_u32_le(code, pc).ok_or(JitError::TruncatedOperand {
        offset: opcode_pc,
        opcode,
    })
}

fn read_operand_i32(
    code: &[u8],
    pc: &mut usize,
    opcode_pc: usize,
    opcode: u8,
) -> Result<i32, JitError> {
    read_i32_le(code, pc).ok_or(JitError::TruncatedOperand {
        offset: opcode_pc,
        opcode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::ProgramAssembler;

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    #[test]
    fn context_layout_matches_the_documented_abi() {
        assert_eq!(std::mem::offset_of!(JitContext, memory), 0);
        assert_eq!(std::mem::offset_of!(JitContext, stack_base), PTR as usize);
        assert_eq!(
            std::mem::offset_of!(JitContext, stack_top),
            2 * PTR as usize
        );
        assert_eq!(
            std::mem::offset_of!(JitContext, stack_end),
            3 * PTR as usize
        );
        assert_eq!(std::mem::offset_of!(JitContext, locals), 4 * PTR as usize);
        assert_eq!(
            std::mem::offset_of!(JitContext, error_code),
            5 * PTR as usize
        );
    }

    #[test]
    fn compiled_code_opens_with_the_frame_setup() {
        let mut asm = ProgramAssembler::new();
        asm.push_u32(40);
        asm.push_u32(2);
        asm.add();
        asm.ret();
        let program = asm.finish().expect("assemble should succeed");

        let compiled = JitBackend::new()
            .compile(&program)
            .expect("compile should succeed");
        let words = words(compiled.code());
        // sub sp, sp, #32
        assert_eq!(words[0], 0xD100_0000 | (32 << 10) | (31 << 5) | 31);
        // str x30, [sp, #24]
        assert_eq!(words[1], 0xF900_0000 | (3 << 10) | (31 << 5) | 30);
        // last word is ret
        assert_eq!(*words.last().expect("code is non-empty"), 0xD65F_03C0);
    }

    #[test]
    fn print_lowering_calls_through_x16() {
        let mut asm = ProgramAssembler::new();
        asm.push_u32(u32::from(b'A'));
        asm.print();
        asm.push_u32(0);
        asm.ret();
        let program = asm.finish().expect("assemble should succeed");

        let compiled = JitBackend::new()
            .compile(&program)
            .expect("compile should succeed");
        let blr_count = words(compiled.code())
            .iter()
            .filter(|&&word| word == 0xD63F_0200)
            .count();
        assert_eq!(blr_count, 1, "print should call the host symbol once");
    }

    #[test]
    fn arithmetic_lowering_emits_no_host_calls() {
        let mut asm = ProgramAssembler::new();
        asm.push_u32(40);
        asm.push_u32(2);
        asm.add();
        asm.ret();
        let program = asm.finish().expect("assemble should succeed");

        let compiled = JitBackend::new()
            .compile(&program)
            .expect("compile should succeed");
        assert!(
            !words(compiled.code()).contains(&0xD63F_0200),
            "straight arithmetic must not call out"
        );
    }

    #[test]
    fn unknown_opcode_fails_translation() {
        let program = Program::new(vec![0x42]);
        let err = JitBackend::new()
            .compile(&program)
            .expect_err("compile should fail");
        assert_eq!(err, JitError::InvalidOpcode(0x42));
    }

    #[test]
    fn memory_opcodes_are_not_translated() {
        for op in [OpCode::Load8U, OpCode::Load32, OpCode::Store8, OpCode::Read8U] {
            let program = Program::new(vec![op as u8]);
            let err = JitBackend::new()
                .compile(&program)
                .expect_err("compile should fail");
            assert_eq!(err, JitError::InvalidOpcode(op as u8));
        }
    }

    #[test]
    fn truncated_operand_fails_translation() {
        let program = Program::new(vec![OpCode::Push as u8, 0x01, 0x02]);
        let err = JitBackend::new()
            .compile(&program)
            .expect_err("compile should fail");
        assert!(matches!(err, JitError::TruncatedOperand { offset: 0, .. }));
    }

    #[test]
    fn branch_outside_the_program_fails_translation() {
        for rel in [-1i32, 1000] {
            let mut code = vec![OpCode::Jump as u8];
            code.extend_from_slice(&rel.to_le_bytes());
            code.push(OpCode::Ret as u8);
            let err = JitBackend::new()
                .compile(&Program::new(code))
                .expect_err("compile should fail");
            assert!(matches!(err, JitError::InvalidBranchTarget { .. }));
        }
    }

    #[test]
    fn branch_into_an_operand_fails_translation() {
        // Jump lands inside the push immediate at offset 7.
        let mut code = vec![OpCode::Jump as u8];
        code.extend_from_slice(&7i32.to_le_bytes());
        code.push(OpCode::Push as u8);
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(OpCode::Ret as u8);

        let err = JitBackend::new()
            .compile(&Program::new(code))
            .expect_err("compile should fail");
        assert!(matches!(
            err,
            JitError::InvalidBranchTarget { offset: 0, target: 7 }
        ));
    }

    #[test]
    fn jump_to_one_past_the_end_is_accepted() {
        let mut code = vec![OpCode::Jump as u8];
        code.extend_from_slice(&5i32.to_le_bytes());
        let compiled = JitBackend::new()
            .compile(&Program::new(code))
            .expect("compile should succeed");
        assert!(compiled.code_size() > 0);
    }

    #[test]
    fn size_estimate_covers_the_densest_program() {
        // All-print programs emit the longest per-opcode sequences.
        let mut asm = ProgramAssembler::new();
        for _ in 0..64 {
            asm.push_u32(u32::from(b'x'));
            asm.print();
        }
        asm.push_u32(0);
        asm.ret();
        let program = asm.finish().expect("assemble should succeed");

        let compiled = JitBackend::new()
            .compile(&program)
            .expect("compile should succeed");
        assert!((compiled.code_size() as usize) < estimate_code_bytes(&program));
    }
}
