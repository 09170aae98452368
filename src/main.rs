use std::io;
use std::time::Instant;

use tracing::info;

use wordvm::{
    ExecutionInfo, Interpreter, JitEngine, Program, ProgramAssembler, State, mandelbrot,
    native_jit_supported,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DemoProgram {
    Add,
    Mandelbrot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineChoice {
    Interpreter,
    Jit,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliConfig {
    program: DemoProgram,
    engine: EngineChoice,
    width: u32,
    height: u32,
    max_iter: u32,
    help: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }

    let (program, local_count) = match cli.program {
        DemoProgram::Add => (build_add_program()?, 8),
        DemoProgram::Mandelbrot => (
            mandelbrot::build_program(cli.width, cli.height, cli.max_iter)?,
            mandelbrot::LOCAL_COUNT,
        ),
    };

    let interp_result = if cli.engine != EngineChoice::Jit {
        Some(run_timed("interpreter", || {
            Interpreter::new().run(&program, &mut State::with_locals(local_count))
        })?)
    } else {
        None
    };

    let jit_result = if cli.engine != EngineChoice::Interpreter {
        if !native_jit_supported() {
            return Err(io::Error::other(
                "native execution requires an aarch64 linux/macos host; \
                 use --engine interpreter",
            )
            .into());
        }
        Some(run_timed("jit", || {
            JitEngine::new().run(&program, &mut State::with_locals(local_count))
        })?)
    } else {
        None
    };

    match (interp_result, jit_result) {
        (Some(interp), Some(jit)) => {
            println!("interp={} jit={}", interp.return_value, jit.return_value);
            if interp.return_value != jit.return_value {
                return Err(io::Error::other("engines disagree on the return value").into());
            }
        }
        (Some(info), None) | (None, Some(info)) => {
            println!("ret={}", info.return_value);
        }
        (None, None) => {}
    }

    Ok(())
}

fn run_timed<E: std::error::Error>(
    name: &str,
    body: impl FnOnce() -> Result<ExecutionInfo, E>,
) -> Result<ExecutionInfo, E> {
    let started = Instant::now();
    let result = body()?;
    info!("{name} finished in {:?}", started.elapsed());
    Ok(result)
}

fn build_add_program() -> Result<Program, wordvm::AssemblerError> {
    let mut asm = ProgramAssembler::new();
    asm.push_u32(40);
    asm.push_u32(2);
    asm.add();
    asm.ret();
    asm.finish()
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig {
        program: DemoProgram::Add,
        engine: EngineChoice::Both,
        width: parse_env_u32("WORDVM_WIDTH", 213)?,
        height: parse_env_u32("WORDVM_HEIGHT", 85)?,
        max_iter: parse_env_u32("WORDVM_MAX_ITER", 1024)?,
        help: false,
    };
    let mut index = 0usize;

    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--program" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --program".to_string())?;
                cfg.program = match value.as_str() {
                    "add" => DemoProgram::Add,
                    "mandelbrot" => DemoProgram::Mandelbrot,
                    other => return Err(format!("unknown program '{other}'")),
                };
                index += 2;
            }
            "--engine" => {
                let value = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --engine".to_string())?;
                cfg.engine = match value.as_str() {
                    "interpreter" => EngineChoice::Interpreter,
                    "jit" => EngineChoice::Jit,
                    "both" => EngineChoice::Both,
                    other => return Err(format!("unknown engine '{other}'")),
                };
                index += 2;
            }
            "--width" => {
                cfg.width = parse_u32_arg(args, index, "--width")?;
                index += 2;
            }
            "--height" => {
                cfg.height = parse_u32_arg(args, index, "--height")?;
                index += 2;
            }
            "--max-iter" => {
                cfg.max_iter = parse_u32_arg(args, index, "--max-iter")?;
                index += 2;
            }
            other => {
                return Err(format!("unknown flag '{other}'"));
            }
        }
    }

    Ok(cfg)
}

fn parse_u32_arg(args: &[String], index: usize, flag: &str) -> Result<u32, String> {
    let raw = args
        .get(index + 1)
        .ok_or_else(|| format!("missing value for {flag}"))?;
    raw.parse::<u32>()
        .map_err(|_| format!("invalid {flag} value '{raw}'"))
}

fn parse_env_u32(key: &str, default: u32) -> Result<u32, String> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u32>()
            .map_err(|_| format!("invalid {key} value '{value}'")),
        Err(_) => Ok(default),
    }
}

fn print_usage() {
    println!("Usage:");
    println!("  wordvm [--program add|mandelbrot] [--engine interpreter|jit|both]");
    println!("  wordvm --program mandelbrot [--width N] [--height N] [--max-iter N]");
    println!();
    println!("Environment: WORDVM_WIDTH, WORDVM_HEIGHT, WORDVM_MAX_ITER override");
    println!("the mandelbrot defaults; flags win over the environment.");
}
