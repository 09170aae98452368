use super::JitError;
use super::memory::ExecutableMemory;

/// AArch64 condition codes, as encoded in B.cond and CSINC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Lo = 3,
    Hi = 8,
    Lt = 11,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label {
    id: u32,
}

#[derive(Clone, Copy)]
struct LabelState {
    bound: bool,
    offset: u32,
}

#[derive(Clone, Copy)]
enum PatchKind {
    Branch26,
    Cond19(Cond),
}

struct BranchPatch {
    at: u32,
    label: u32,
    kind: PatchKind,
}

/// Serializes 32-bit little-endian AArch64 instructions into an executable
/// memory region at a monotonically increasing cursor, and resolves branch
/// fixups against labels on `finalize`.
///
/// Branch deltas are measured from the branch instruction itself, not from
/// PC+4: a branch to the next instruction encodes +1, a branch to itself 0.
pub struct MacroAssembler<'m> {
    memory: &'m mut ExecutableMemory,
    cursor: u32,
    labels: Vec<LabelState>,
    patches: Vec<BranchPatch>,
}

impl<'m> MacroAssembler<'m> {
    /// Binds the output buffer, resetting the cursor and the label and
    /// patch tables.
    pub fn new(memory: &'m mut ExecutableMemory) -> Self {
        Self {
            memory,
            cursor: 0,
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn code_size_bytes(&self) -> u32 {
        self.cursor
    }

    /// Reads back the instruction word at `offset`. Test hook; offsets past
    /// the cursor hold no emitted instruction.
    pub fn word_at(&self, offset: u32) -> Option<u32> {
        if offset % 4 != 0 || offset + 4 > self.cursor {
            return None;
        }
        Some(self.memory.read_u32_le(offset as usize))
    }

    fn emit_u32(&mut self, instruction: u32) -> Result<(), JitError> {
        let offset = self.cursor as usize;
        if offset + 4 > self.memory.len() {
            return Err(JitError::OutputExhausted {
                cursor: self.cursor,
                capacity: self.memory.len(),
            });
        }
        self.memory.write_u32_le(offset, instruction);
        self.cursor += 4;
        Ok(())
    }

    fn overwrite_u32(&mut self, at: u32, instruction: u32) -> Result<(), JitError> {
        if at + 4 > self.cursor {
            return Err(JitError::OutputExhausted {
                cursor: at,
                capacity: self.memory.len(),
            });
        }
        self.memory.write_u32_le(at as usize, instruction);
        Ok(())
    }

    pub fn create_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelState {
            bound: false,
            offset: 0,
        });
        Label { id }
    }

    pub fn bind_label(&mut self, label: Label) -> Result<(), JitError> {
        let state = self
            .labels
            .get_mut(label.id as usize)
            .ok_or(JitError::UnknownLabel(label.id))?;
        if state.bound {
            return Err(JitError::LabelAlreadyBound(label.id));
        }
        state.bound = true;
        state.offset = self.cursor;
        Ok(())
    }

    /// MOVZ of the low 16 bits, plus MOVK at LSL 16 when the high half is
    /// non-zero.
    pub fn emit_move_immediate_u32(&mut self, rd: u8, imm: u32) -> Result<(), JitError> {
        let lo = imm & 0xFFFF;
        let hi = (imm >> 16) & 0xFFFF;

        self.emit_u32(0x5280_0000 | (lo << 5) | reg(rd))?;
        if hi != 0 {
            self.emit_u32(0x7280_0000 | (1 << 21) | (hi << 5) | reg(rd))?;
        }
        Ok(())
    }

    /// MOVZ of the low 16 bits, plus MOVK at shifts 16/32/48 for each
    /// non-zero half-word.
    pub fn emit_move_pointer_immediate(&mut self, rd: u8, imm: u64) -> Result<(), JitError> {
        self.emit_u32(0xD280_0000 | (((imm & 0xFFFF) as u32) << 5) | reg(rd))?;
        for hw in 1u32..4 {
            let part = ((imm >> (hw * 16)) & 0xFFFF) as u32;
            if part != 0 {
                self.emit_u32(0xF280_0000 | (hw << 21) | (part << 5) | reg(rd))?;
            }
        }
        Ok(())
    }

    /// Register move as `orr wd, wzr, wm`.
    pub fn emit_move_u32_register(&mut self, rd: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x2A00_03E0 | (reg(rm) << 16) | reg(rd))
    }

    /// Register move as `orr xd, xzr, xm`.
    pub fn emit_move_pointer_register(&mut self, rd: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0xAA00_03E0 | (reg(rm) << 16) | reg(rd))
    }

    /// LDR Wd, [Xn, #offset]. The offset must be non-negative, a multiple
    /// of 4, and at most 4092.
    pub fn emit_load_u32_from_base_plus_offset(
        &mut self,
        rd: u8,
        rn: u8,
        offset: i32,
    ) -> Result<(), JitError> {
        let imm12 = scaled_offset_u32(offset)?;
        self.emit_u32(0xB940_0000 | (imm12 << 10) | (reg(rn) << 5) | reg(rd))
    }

    /// STR Wd, [Xn, #offset], same offset constraints as the load.
    pub fn emit_store_u32_from_register_to_base_plus_offset(
        &mut self,
        rt: u8,
        rn: u8,
        offset: i32,
    ) -> Result<(), JitError> {
        let imm12 = scaled_offset_u32(offset)?;
        self.emit_u32(0xB900_0000 | (imm12 << 10) | (reg(rn) << 5) | reg(rt))
    }

    /// LDR Xd, [Xn, #offset]. The offset must be non-negative and a
    /// multiple of 8.
    pub fn emit_load_pointer_from_base_plus_offset(
        &mut self,
        rd: u8,
        rn: u8,
        offset: i32,
    ) -> Result<(), JitError> {
        let imm12 = scaled_offset_pointer(offset)?;
        self.emit_u32(0xF940_0000 | (imm12 << 10) | (reg(rn) << 5) | reg(rd))
    }

    /// STR Xd, [Xn, #offset], same offset constraints as the load.
    pub fn emit_store_pointer_from_register_to_base_plus_offset(
        &mut self,
        rt: u8,
        rn: u8,
        offset: i32,
    ) -> Result<(), JitError> {
        let imm12 = scaled_offset_pointer(offset)?;
        self.emit_u32(0xF900_0000 | (imm12 << 10) | (reg(rn) << 5) | reg(rt))
    }

    /// ADD Xd, Xn, #imm with imm <= 4095.
    pub fn emit_add_immediate_to_pointer(
        &mut self,
        rd: u8,
        rn: u8,
        imm: u32,
    ) -> Result<(), JitError> {
        if imm > 4095 {
            return Err(JitError::InvalidOffset(i64::from(imm)));
        }
        self.emit_u32(0x9100_0000 | (imm << 10) | (reg(rn) << 5) | reg(rd))
    }

    /// SUB Xd, Xn, #imm with imm <= 4095.
    pub fn emit_subtract_immediate_from_pointer(
        &mut self,
        rd: u8,
        rn: u8,
        imm: u32,
    ) -> Result<(), JitError> {
        if imm > 4095 {
            return Err(JitError::InvalidOffset(i64::from(imm)));
        }
        self.emit_u32(0xD100_0000 | (imm << 10) | (reg(rn) << 5) | reg(rd))
    }

    pub fn emit_add_u32_register(&mut self, rd: u8, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x0B00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd))
    }

    pub fn emit_subtract_u32_register(&mut self, rd: u8, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x4B00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd))
    }

    /// MADD with Ra = WZR.
    pub fn emit_multiply_u32_register(&mut self, rd: u8, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x1B00_7C00 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd))
    }

    pub fn emit_divide_i32_register(&mut self, rd: u8, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x1AC0_0C00 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd))
    }

    pub fn emit_divide_u32_register(&mut self, rd: u8, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x1AC0_0800 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd))
    }

    pub fn emit_add_pointer_register(&mut self, rd: u8, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x8B00_0000 | (reg(rm) << 16) | (reg(rn) << 5) | reg(rd))
    }

    /// LSL alias of UBFM: immr = (32 - shift) mod 32, imms = 31 - shift.
    pub fn emit_shift_left_u32_immediate(
        &mut self,
        rd: u8,
        rn: u8,
        shift: u32,
    ) -> Result<(), JitError> {
        if shift > 31 {
            return Err(JitError::InvalidShift(shift));
        }
        let immr = (32 - shift) % 32;
        let imms = 31 - shift;
        self.emit_u32(0x5300_0000 | (immr << 16) | (imms << 10) | (reg(rn) << 5) | reg(rd))
    }

    /// SUBS WZR, Wn, Wm.
    pub fn emit_compare_u32_registers(&mut self, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0x6B00_001F | (reg(rm) << 16) | (reg(rn) << 5))
    }

    /// SUBS XZR, Xn, Xm.
    pub fn emit_compare_pointer_registers(&mut self, rn: u8, rm: u8) -> Result<(), JitError> {
        self.emit_u32(0xEB00_001F | (reg(rm) << 16) | (reg(rn) << 5))
    }

    /// CSET alias: CSINC Wd, WZR, WZR with the inverted condition.
    pub fn emit_cset_u32(&mut self, rd: u8, cond: Cond) -> Result<(), JitError> {
        let inverted = (cond as u32) ^ 1;
        self.emit_u32(0x1A9F_07E0 | (inverted << 12) | reg(rd))
    }

    /// BLR Xn.
    pub fn emit_call_register(&mut self, rn: u8) -> Result<(), JitError> {
        self.emit_u32(0xD63F_0000 | (reg(rn) << 5))
    }

    /// RET (X30).
    pub fn emit_return(&mut self) -> Result<(), JitError> {
        self.emit_u32(0xD65F_03C0)
    }

    /// Unconditional branch placeholder, fixed up at finalize.
    pub fn branch(&mut self, target: Label) -> Result<(), JitError> {
        let at = self.cursor;
        self.emit_u32(0x1400_0000)?;
        self.patches.push(BranchPatch {
            at,
            label: target.id,
            kind: PatchKind::Branch26,
        });
        Ok(())
    }

    pub fn branch_equal(&mut self, target: Label) -> Result<(), JitError> {
        self.branch_cond(Cond::Eq, target)
    }

    pub fn branch_not_equal(&mut self, target: Label) -> Result<(), JitError> {
        self.branch_cond(Cond::Ne, target)
    }

    /// Conditional branch placeholder, fixed up at finalize.
    pub fn branch_cond(&mut self, cond: Cond, target: Label) -> Result<(), JitError> {
        let at = self.cursor;
        self.emit_u32(0x5400_0000 | cond as u32)?;
        self.patches.push(BranchPatch {
            at,
            label: target.id,
            kind: PatchKind::Cond19(cond),
        });
        Ok(())
    }

    /// Resolves every recorded branch patch. The delta base is the branch
    /// instruction itself. Drains the patch table, so a second finalize
    /// leaves emitted bytes untouched.
    pub fn finalize(&mut self) -> Result<(), JitError> {
        let patches = std::mem::take(&mut self.patches);
        for patch in &patches {
            let state = self
                .labels
                .get(patch.label as usize)
                .ok_or(JitError::UnknownLabel(patch.label))?;
            if !state.bound {
                return Err(JitError::UnboundLabel(patch.label));
            }

            let delta_bytes = i64::from(state.offset) - i64::from(patch.at);
            debug_assert!(delta_bytes % 4 == 0);
            let delta_instr = delta_bytes / 4;

            let instruction = match patch.kind {
                PatchKind::Branch26 => {
                    if !(-(1 << 25)..(1 << 25)).contains(&delta_instr) {
                        return Err(JitError::BranchOutOfRange { delta_bytes });
                    }
                    0x1400_0000 | ((delta_instr as i32 as u32) & 0x03FF_FFFF)
                }
                PatchKind::Cond19(cond) => {
                    if !(-(1 << 18)..(1 << 18)).contains(&delta_instr) {
                        return Err(JitError::BranchOutOfRange { delta_bytes });
                    }
                    0x5400_0000 | (((delta_instr as i32 as u32) & 0x0007_FFFF) << 5) | cond as u32
                }
            };
            self.overwrite_u32(patch.at, instruction)?;
        }
        Ok(())
    }
}

fn reg(r: u8) -> u32 {
    u32::from(r & 0x1F)
}

fn scaled_offset_u32(offset: i32) -> Result<u32, JitError> {
    if offset < 0 || offset % 4 != 0 || offset > 4092 {
        return Err(JitError::InvalidOffset(i64::from(offset)));
    }
    Ok(offset as u32 / 4)
}

fn scaled_offset_pointer(offset: i32) -> Result<u32, JitError> {
    if offset < 0 || offset % 8 != 0 || offset / 8 > 4095 {
        return Err(JitError::InvalidOffset(i64::from(offset)));
    }
    Ok(offset as u32 / 8)
}
