use crate::bytecode::{OpCode, Program};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    UnknownLabel(u32),
    DuplicateBind(u32),
    UnboundLabel(u32),
    OffsetOutOfRange { from: usize, to: usize },
}

impl std::fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblerError::UnknownLabel(id) => write!(f, "unknown label {id}"),
            AssemblerError::DuplicateBind(id) => write!(f, "label {id} bound twice"),
            AssemblerError::UnboundLabel(id) => {
                write!(f, "label {id} referenced but never bound")
            }
            AssemblerError::OffsetOutOfRange { from, to } => {
                write!(f, "jump offset from {from} to {to} exceeds 32-bit range")
            }
        }
    }
}

impl std::error::Error for AssemblerError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label {
    id: u32,
}

#[derive(Clone, Copy)]
struct LabelState {
    bound: bool,
    pc: usize,
}

struct Fixup {
    imm_position: usize,
    opcode_pc: usize,
    label: u32,
}

/// Builds a flat bytecode program, resolving forward jump targets through
/// labels. Jump operands are signed 32-bit deltas measured from the opcode
/// byte of the jump instruction.
pub struct ProgramAssembler {
    code: Vec<u8>,
    labels: Vec<LabelState>,
    fixups: Vec<Fixup>,
}

impl Default for ProgramAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramAssembler {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn create_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelState {
            bound: false,
            pc: 0,
        });
        Label { id }
    }

    pub fn bind_label(&mut self, label: Label) -> Result<(), AssemblerError> {
        let state = self
            .labels
            .get_mut(label.id as usize)
            .ok_or(AssemblerError::UnknownLabel(label.id))?;
        if state.bound {
            return Err(AssemblerError::DuplicateBind(label.id));
        }
        state.bound = true;
        state.pc = self.code.len();
        Ok(())
    }

    fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    fn emit_u32_le(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_u8(op as u8);
    }

    fn emit_jump_op(&mut self, op: OpCode, target: Label) {
        let opcode_pc = self.code.len();
        self.emit_op(op);
        let imm_position = self.code.len();
        self.emit_u32_le(0);
        self.fixups.push(Fixup {
            imm_position,
            opcode_pc,
            label: target.id,
        });
    }

    pub fn nop(&mut self) {
        self.emit_op(OpCode::Nop);
    }

    pub fn push_u32(&mut self, value: u32) {
        self.emit_op(OpCode::Push);
        self.emit_u32_le(value);
    }

    pub fn push_i32(&mut self, value: i32) {
        self.push_u32(value as u32);
    }

    pub fn pop(&mut self) {
        self.emit_op(OpCode::Pop);
    }

    pub fn local_get(&mut self, index: u32) {
        self.emit_op(OpCode::LocalGet);
        self.emit_u32_le(index);
    }

    pub fn local_set(&mut self, index: u32) {
        self.emit_op(OpCode::LocalSet);
        self.emit_u32_le(index);
    }

    pub fn add(&mut self) {
        self.emit_op(OpCode::Add);
    }

    pub fn sub(&mut self) {
        self.emit_op(OpCode::Sub);
    }

    pub fn mul(&mut self) {
        self.emit_op(OpCode::Mul);
    }

    pub fn div(&mut self) {
        self.emit_op(OpCode::Div);
    }

    pub fn eq(&mut self) {
        self.emit_op(OpCode::Eq);
    }

    pub fn lt_s(&mut self) {
        self.emit_op(OpCode::LtS);
    }

    pub fn lt_u(&mut self) {
        self.emit_op(OpCode::LtU);
    }

    pub fn load8_u(&mut self) {
        self.emit_op(OpCode::Load8U);
    }

    pub fn load16_u(&mut self) {
        self.emit_op(OpCode::Load16U);
    }

    pub fn load32(&mut self) {
        self.emit_op(OpCode::Load32);
    }

    pub fn jump(&mut self, target: Label) {
        self.emit_jump_op(OpCode::Jump, target);
    }

    pub fn jump_if_zero(&mut self, target: Label) {
        self.emit_jump_op(OpCode::JumpIfZero, target);
    }

    pub fn jump_if_not_zero(&mut self, target: Label) {
        self.emit_jump_op(OpCode::JumpIfNotZero, target);
    }

    pub fn ret(&mut self) {
        self.emit_op(OpCode::Ret);
    }

    pub fn print(&mut self) {
        self.emit_op(OpCode::Print);
    }

    pub fn print_literal(&mut self, text: &str) {
        for byte in text.bytes() {
            self.push_u32(u32::from(byte));
            self.print();
        }
    }

    /// Resolves every recorded jump fixup and hands back the finished
    /// program. Every referenced label must be bound by now.
    pub fn finish(mut self) -> Result<Program, AssemblerError> {
        for fixup in &self.fixups {
            let state = self
                .labels
                .get(fixup.label as usize)
                .ok_or(AssemblerError::UnknownLabel(fixup.label))?;
            if !state.bound {
                return Err(AssemblerError::UnboundLabel(fixup.label));
            }

            let delta = state.pc as i64 - fixup.opcode_pc as i64;
            let delta = i32::try_from(delta).map_err(|_| AssemblerError::OffsetOutOfRange {
                from: fixup.opcode_pc,
                to: state.pc,
            })?;
            self.code[fixup.imm_position..fixup.imm_position + 4]
                .copy_from_slice(&delta.to_le_bytes());
        }
        Ok(Program::new(self.code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_program_matches_expected_bytes() {
        let mut asm = ProgramAssembler::new();
        asm.push_u32(40);
        asm.push_u32(2);
        asm.add();
        asm.ret();

        let program = asm.finish().expect("finish should succeed");
        assert_eq!(
            program.code,
            vec![0x01, 40, 0, 0, 0, 0x01, 2, 0, 0, 0, 0x05, 0x13]
        );
    }

    #[test]
    fn forward_jump_delta_counts_from_opcode_byte() {
        let mut asm = ProgramAssembler::new();
        let target = asm.create_label();
        asm.jump(target); // offsets 0..=4
        asm.nop(); // offset 5
        asm.bind_label(target).expect("bind should succeed");
        asm.ret();

        let program = asm.finish().expect("finish should succeed");
        let delta = i32::from_le_bytes([
            program.code[1],
            program.code[2],
            program.code[3],
            program.code[4],
        ]);
        assert_eq!(delta, 6, "jump lands past the nop, measured from opcode");
    }

    #[test]
    fn backward_jump_delta_is_negative() {
        let mut asm = ProgramAssembler::new();
        let top = asm.create_label();
        asm.bind_label(top).expect("bind should succeed");
        asm.nop();
        asm.jump(top);

        let program = asm.finish().expect("finish should succeed");
        let delta = i32::from_le_bytes([
            program.code[2],
            program.code[3],
            program.code[4],
            program.code[5],
        ]);
        assert_eq!(delta, -1);
    }

    #[test]
    fn unbound_label_fails_finish() {
        let mut asm = ProgramAssembler::new();
        let dangling = asm.create_label();
        asm.jump(dangling);

        let err = asm.finish().expect_err("finish should fail");
        assert_eq!(err, AssemblerError::UnboundLabel(0));
    }

    #[test]
    fn duplicate_bind_is_rejected() {
        let mut asm = ProgramAssembler::new();
        let label = asm.create_label();
        asm.bind_label(label).expect("first bind should succeed");
        let err = asm.bind_label(label).expect_err("second bind should fail");
        assert_eq!(err, AssemblerError::DuplicateBind(0));
    }
}
