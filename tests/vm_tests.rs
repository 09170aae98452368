mod common;

use common::{capture_putchar, take_captured};
use wordvm::{
    Interpreter, OpCode, PrintSymbol, Program, ProgramAssembler, State, VmError,
};

fn run(program: &Program, state: &mut State) -> Result<u32, VmError> {
    Interpreter::with_print_symbol(capture_putchar as PrintSymbol)
        .run(program, state)
        .map(|info| info.return_value)
}

#[test]
fn add_program_from_raw_bytes() {
    let program = Program::new(vec![
        0x01, 0x28, 0x00, 0x00, 0x00, // push 40
        0x01, 0x02, 0x00, 0x00, 0x00, // push 2
        0x05, // add
        0x13, // ret
    ]);
    let value = run(&program, &mut State::new()).expect("program should run");
    assert_eq!(value, 42);
}

#[test]
fn forward_jump_skips_the_payload() {
    let mut asm = ProgramAssembler::new();
    let target = asm.create_label();
    asm.push_u32(1);
    asm.jump(target);
    asm.push_u32(99);
    asm.ret();
    asm.bind_label(target).expect("bind should succeed");
    asm.push_u32(7);
    asm.ret();
    let program = asm.finish().expect("assemble should succeed");

    let mut state = State::new();
    let value = run(&program, &mut state).expect("program should run");
    assert_eq!(value, 7);
    assert_eq!(state.stack, vec![1], "the early push stays behind");
}

#[test]
fn conditional_jumps_follow_the_popped_flag() {
    // returns 10 when the pushed flag is zero, 20 otherwise
    let build = |flag: u32| {
        let mut asm = ProgramAssembler::new();
        let if_zero = asm.create_label();
        asm.push_u32(flag);
        asm.jump_if_zero(if_zero);
        asm.push_u32(20);
        asm.ret();
        asm.bind_label(if_zero).expect("bind should succeed");
        asm.push_u32(10);
        asm.ret();
        asm.finish().expect("assemble should succeed")
    };

    assert_eq!(run(&build(0), &mut State::new()).expect("run"), 10);
    assert_eq!(run(&build(1), &mut State::new()).expect("run"), 20);
}

#[test]
fn jump_to_one_past_the_end_terminates_without_ret() {
    let mut asm = ProgramAssembler::new();
    let end = asm.create_label();
    asm.jump(end);
    asm.bind_label(end).expect("bind should succeed");
    let program = asm.finish().expect("assemble should succeed");

    let err = run(&program, &mut State::new()).expect_err("program should not produce a value");
    assert!(matches!(err, VmError::NonTerminatedProgram));
}

#[test]
fn jump_beyond_the_program_is_rejected() {
    let mut code = vec![OpCode::Jump as u8];
    code.extend_from_slice(&100i32.to_le_bytes());
    let err = run(&Program::new(code), &mut State::new()).expect_err("jump should fail");
    assert!(matches!(err, VmError::PcOutOfRange));

    let mut code = vec![OpCode::Jump as u8];
    code.extend_from_slice(&(-1i32).to_le_bytes());
    let err = run(&Program::new(code), &mut State::new()).expect_err("jump should fail");
    assert!(matches!(err, VmError::PcOutOfRange));
}

#[test]
fn print_literal_emits_the_exact_byte_stream() {
    let mut asm = ProgramAssembler::new();
    asm.print_literal("ok\n");
    asm.push_u32(0);
    asm.ret();
    let program = asm.finish().expect("assemble should succeed");

    let value = run(&program, &mut State::new()).expect("program should run");
    assert_eq!(value, 0);
    assert_eq!(take_captured(), b"ok\n");
}

#[test]
fn local_index_out_of_range_is_reported() {
    let mut asm = ProgramAssembler::new();
    asm.local_get(3);
    asm.ret();
    let program = asm.finish().expect("assemble should succeed");

    let err = run(&program, &mut State::with_locals(2)).expect_err("local_get should fail");
    assert!(matches!(err, VmError::InvalidLocal(3)));
}

#[test]
fn truncated_operand_is_a_pc_error() {
    let program = Program::new(vec![OpCode::Push as u8, 0x01]);
    let err = run(&program, &mut State::new()).expect_err("push should fail");
    assert!(matches!(err, VmError::PcOutOfRange));
}
