//! Fixed-point ASCII Mandelbrot renderer, expressed entirely in bytecode.
//! The heaviest workload the demo CLI can throw at either engine: nested
//! loops, fixed-point multiplies, comparisons, and one PRINT per cell.

use crate::assembler::{AssemblerError, ProgramAssembler};
use crate::bytecode::Program;

const FIXED_SCALE: i32 = 4096;

const PALETTE: &[u8] = b" .:-=+*#%@";

// Local slots used by the generated program.
const L_X: u32 = 0;
const L_Y: u32 = 1;
const L_C_RE: u32 = 2;
const L_C_IM: u32 = 3;
const L_Z_RE: u32 = 4;
const L_Z_IM: u32 = 5;
const L_TMP_RE: u32 = 6;
const L_IT: u32 = 7;
const L_MAG2: u32 = 8;
const L_STEP_RE: u32 = 9;
const L_STEP_IM: u32 = 10;
const L_WIDTH: u32 = 11;
const L_HEIGHT: u32 = 12;
const L_MAX_IT: u32 = 13;
const L_RE_MIN: u32 = 14;
const L_IM_MIN: u32 = 15;
const L_ESCAPE: u32 = 16;
const L_SHADE: u32 = 17;
const L_PALETTE_LAST: u32 = 18;

/// Number of locals the generated program addresses.
pub const LOCAL_COUNT: usize = 19;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MandelbrotError {
    ImageTooSmall { width: u32, height: u32 },
    NoIterations,
    Assembler(AssemblerError),
}

impl std::fmt::Display for MandelbrotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MandelbrotError::ImageTooSmall { width, height } => {
                write!(f, "image {width}x{height} too small, need at least 2x2")
            }
            MandelbrotError::NoIterations => write!(f, "max_iter must be >= 1"),
            MandelbrotError::Assembler(err) => write!(f, "assembler error: {err}"),
        }
    }
}

impl std::error::Error for MandelbrotError {}

impl From<AssemblerError> for MandelbrotError {
    fn from(err: AssemblerError) -> Self {
        MandelbrotError::Assembler(err)
    }
}

/// Fixed-point multiply of the two stack operands: mul, then rescale.
fn mul_fixed(asm: &mut ProgramAssembler) {
    asm.mul();
    asm.push_i32(FIXED_SCALE);
    asm.div();
}

fn print_char(asm: &mut ProgramAssembler, c: u8) {
    asm.push_u32(u32::from(c));
    asm.print();
}

pub fn build_program(
    width: u32,
    height: u32,
    max_iter: u32,
) -> Result<Program, MandelbrotError> {
    if width < 2 || height < 2 {
        return Err(MandelbrotError::ImageTooSmall { width, height });
    }
    if max_iter == 0 {
        return Err(MandelbrotError::NoIterations);
    }

    // View window re in [-2.0, 1.0], im in [-1.2, 1.2], all in 4096-scale
    // fixed point.
    let re_min = -2 * FIXED_SCALE;
    let im_min = -(12 * FIXED_SCALE) / 10;
    let re_range = 3 * FIXED_SCALE;
    let im_range = (24 * FIXED_SCALE) / 10;

    let step_re = (i64::from(re_range) / i64::from(width - 1)) as i32;
    let step_im = (i64::from(im_range) / i64::from(height - 1)) as i32;

    // Escape once |z|^2 > 4.0.
    let escape_threshold = 4 * FIXED_SCALE;

    let palette_len = PALETTE.len() as u32;

    let mut asm = ProgramAssembler::new();

    asm.push_i32(step_re);
    asm.local_set(L_STEP_RE);
    asm.push_i32(step_im);
    asm.local_set(L_STEP_IM);
    asm.push_u32(width);
    asm.local_set(L_WIDTH);
    asm.push_u32(height);
    asm.local_set(L_HEIGHT);
    asm.push_u32(max_iter);
    asm.local_set(L_MAX_IT);
    asm.push_i32(re_min);
    asm.local_set(L_RE_MIN);
    asm.push_i32(im_min);
    asm.local_set(L_IM_MIN);
    asm.push_i32(escape_threshold);
    asm.local_set(L_ESCAPE);
    asm.push_u32(palette_len - 1);
    asm.local_set(L_PALETTE_LAST);

    asm.push_u32(0);
    asm.local_set(L_Y);

    let y_loop = asm.create_label();
    let y_done = asm.create_label();
    let x_loop = asm.create_label();
    let x_done = asm.create_label();
    let iter_loop = asm.create_label();
    let iter_done = asm.create_label();

    let print_palette: Vec<_> = PALETTE.iter().map(|_| asm.create_label()).collect();
    let print_done = asm.create_label();

    asm.bind_label(y_loop)?;

    // if y == height: done
    asm.local_get(L_Y);
    asm.local_get(L_HEIGHT);
    asm.eq();
    asm.jump_if_not_zero(y_done);

    // c_im = im_min + y * step_im
    asm.local_get(L_Y);
    asm.local_get(L_STEP_IM);
    asm.mul();
    asm.local_get(L_IM_MIN);
    asm.add();
    asm.local_set(L_C_IM);

    asm.push_u32(0);
    asm.local_set(L_X);

    asm.bind_label(x_loop)?;

    // if x == width: row done
    asm.local_get(L_X);
    asm.local_get(L_WIDTH);
    asm.eq();
    asm.jump_if_not_zero(x_done);

    // c_re = re_min + x * step_re
    asm.local_get(L_X);
    asm.local_get(L_STEP_RE);
    asm.mul();
    asm.local_get(L_RE_MIN);
    asm.add();
    asm.local_set(L_C_RE);

    // z = 0, it = 0
    asm.push_i32(0);
    asm.local_set(L_Z_RE);
    asm.push_i32(0);
    asm.local_set(L_Z_IM);
    asm.push_u32(0);
    asm.local_set(L_IT);

    asm.bind_label(iter_loop)?;

    // if it == max_iter: escape loop
    asm.local_get(L_IT);
    asm.local_get(L_MAX_IT);
    asm.eq();
    asm.jump_if_not_zero(iter_done);

    // mag2 = zr^2 + zi^2
    asm.local_get(L_Z_RE);
    asm.local_get(L_Z_RE);
    mul_fixed(&mut asm);
    asm.local_get(L_Z_IM);
    asm.local_get(L_Z_IM);
    mul_fixed(&mut asm);
    asm.add();
    asm.local_set(L_MAG2);

    // if escape < mag2: escape loop
    asm.local_get(L_ESCAPE);
    asm.local_get(L_MAG2);
    asm.lt_s();
    asm.jump_if_not_zero(iter_done);

    // tmp_re = (zr^2 - zi^2) + c_re
    asm.local_get(L_Z_RE);
    asm.local_get(L_Z_RE);
    mul_fixed(&mut asm);
    asm.local_get(L_Z_IM);
    asm.local_get(L_Z_IM);
    mul_fixed(&mut asm);
    asm.sub();
    asm.local_get(L_C_RE);
    asm.add();
    asm.local_set(L_TMP_RE);

    // z_im = 2*zr*zi + c_im
    asm.local_get(L_Z_RE);
    asm.local_get(L_Z_IM);
    mul_fixed(&mut asm);
    asm.push_i32(2);
    asm.mul();
    asm.local_get(L_C_IM);
    asm.add();
    asm.local_set(L_Z_IM);

    // z_re = tmp_re
    asm.local_get(L_TMP_RE);
    asm.local_set(L_Z_RE);

    // it += 1
    asm.local_get(L_IT);
    asm.push_u32(1);
    asm.add();
    asm.local_set(L_IT);

    asm.jump(iter_loop);

    asm.bind_label(iter_done)?;

    // shade = it * (palette_len - 1) / max_iter
    asm.local_get(L_IT);
    asm.local_get(L_PALETTE_LAST);
    asm.mul();
    asm.local_get(L_MAX_IT);
    asm.div();
    asm.local_set(L_SHADE);

    // compare chain: if shade == i, print palette[i]
    for (i, label) in print_palette.iter().enumerate() {
        asm.local_get(L_SHADE);
        asm.push_u32(i as u32);
        asm.eq();
        asm.jump_if_not_zero(*label);
    }

    // unreachable unless shade leaves the palette range
    asm.jump(print_palette[PALETTE.len() - 1]);

    for (i, label) in print_palette.iter().enumerate() {
        asm.bind_label(*label)?;
        print_char(&mut asm, PALETTE[i]);
        asm.jump(print_done);
    }

    asm.bind_label(print_done)?;

    // x += 1
    asm.local_get(L_X);
    asm.push_u32(1);
    asm.add();
    asm.local_set(L_X);
    asm.jump(x_loop);

    asm.bind_label(x_done)?;
    print_char(&mut asm, b'\n');

    // y += 1
    asm.local_get(L_Y);
    asm.push_u32(1);
    asm.add();
    asm.local_set(L_Y);
    asm.jump(y_loop);

    asm.bind_label(y_done)?;

    asm.push_u32(0);
    asm.ret();

    Ok(asm.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{Interpreter, State};

    #[test]
    fn rejects_degenerate_dimensions() {
        assert!(matches!(
            build_program(1, 40, 16),
            Err(MandelbrotError::ImageTooSmall { .. })
        ));
        assert!(matches!(
            build_program(40, 1, 16),
            Err(MandelbrotError::ImageTooSmall { .. })
        ));
        assert!(matches!(
            build_program(40, 20, 0),
            Err(MandelbrotError::NoIterations)
        ));
    }

    #[test]
    fn renders_the_expected_grid_shape() {
        let program = build_program(16, 8, 8).expect("build should succeed");

        let mut state = State::with_locals(LOCAL_COUNT);
        let info = Interpreter::with_print_symbol(capture_putchar)
            .run(&program, &mut state)
            .expect("program should run");
        assert_eq!(info.return_value, 0);

        let output = take_captured();
        let lines: Vec<&[u8]> = output.split(|&b| b == b'\n').collect();
        // trailing newline yields one empty trailing chunk
        assert_eq!(lines.len(), 9);
        for line in &lines[..8] {
            assert_eq!(line.len(), 16);
            for &b in *line {
                assert!(PALETTE.contains(&b), "glyph {b:#04x} outside palette");
            }
        }
        // the interior of the set must reach the deepest glyph
        assert!(output.contains(&b'@'));
    }

    std::thread_local! {
        static CAPTURED: std::cell::RefCell<Vec<u8>> =
            const { std::cell::RefCell::new(Vec::new()) };
    }

    extern "C" fn capture_putchar(c: libc::c_int) -> libc::c_int {
        CAPTURED.with(|buffer| buffer.borrow_mut().push(c as u8));
        c
    }

    fn take_captured() -> Vec<u8> {
        CAPTURED.with(|buffer| std::mem::take(&mut *buffer.borrow_mut()))
    }
}
