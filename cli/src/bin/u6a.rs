//! `u6a` - executes Unlambda bytecode.

use std::fmt::Display;
use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::process::ExitCode;

use clap::{ArgAction, Parser};

use u6a_core::bytecode::{self, Info, LoadError, PROG_HEADER_SIZE, Program};
use u6a_core::vm::runtime::{
    DEFAULT_POOL_SIZE, DEFAULT_SEGMENT_SIZE, MAX_POOL_SIZE, MAX_SEGMENT_SIZE, MIN_POOL_SIZE,
    MIN_SEGMENT_SIZE,
};
use u6a_core::vm::{Runtime, RuntimeOptions};

const EC_OPTIONS: u8 = 1;
const EC_INIT: u8 = 2;
const EC_RUNTIME: u8 = 3;

/// Runtime for the Unlambda programming language.
#[derive(Parser, Debug)]
#[command(
    name = "u6a",
    version,
    about = "Runtime for the Unlambda programming language",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Args {
    /// Bytecode file, or `-` for standard input
    #[arg(value_name = "bytecode-file")]
    file: String,

    /// Stack segment size, in values
    #[arg(
        short = 's',
        long = "stack-segment-size",
        value_name = "SIZE",
        default_value_t = DEFAULT_SEGMENT_SIZE,
        value_parser = clap::value_parser!(u32).range(MIN_SEGMENT_SIZE as i64..=MAX_SEGMENT_SIZE as i64)
    )]
    stack_segment_size: u32,

    /// Object pool size, in cells
    #[arg(
        short = 'p',
        long = "pool-size",
        value_name = "SIZE",
        default_value_t = DEFAULT_POOL_SIZE,
        value_parser = clap::value_parser!(u32).range(MIN_POOL_SIZE as i64..=MAX_POOL_SIZE as i64)
    )]
    pool_size: u32,

    /// Print bytecode file information and exit
    #[arg(short = 'i', long = "info")]
    info: bool,

    /// Run despite bytecode version or opcode problems
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Print help
    #[arg(short = 'H', long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Print version
    #[arg(short = 'V', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

fn report(stage: &str, message: impl Display) {
    eprintln!("u6a: [{stage}] {message}.");
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            use clap::error::ErrorKind;
            let ok = matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            );
            let _ = err.print();
            return if ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EC_OPTIONS)
            };
        }
    };
    init_tracing();

    let options = RuntimeOptions {
        stack_segment_size: args.stack_segment_size,
        pool_size: args.pool_size,
        force_exec: args.force,
    };

    if args.file == "-" {
        // The loader consumes exactly the framed bytes; the rest of stdin
        // remains available as the program's input.
        let mut stdin = io::stdin().lock();
        if args.info {
            return print_info(&mut stdin, "STDIN");
        }
        match load(&mut stdin, args.force, "STDIN") {
            Ok(program) => run_program(program, &options, stdin),
            Err(code) => ExitCode::from(code),
        }
    } else {
        let file = match fs::File::open(&args.file) {
            Ok(file) => file,
            Err(_) => {
                report("error", format_args!("failed to open file {}", args.file));
                return ExitCode::from(EC_OPTIONS);
            }
        };
        let mut reader = BufReader::new(file);
        if args.info {
            return print_info(&mut reader, &args.file);
        }
        match load(&mut reader, args.force, &args.file) {
            Ok(program) => run_program(program, &options, io::stdin().lock()),
            Err(code) => ExitCode::from(code),
        }
    }
}

fn load(reader: &mut impl Read, force: bool, name: &str) -> Result<Program, u8> {
    bytecode::load(reader, force).map_err(|err| {
        match err {
            LoadError::InvalidFile => report(
                "runtime error",
                format_args!("{name} is not a valid Unlambda bytecode file"),
            ),
            err => report("runtime error", err),
        }
        EC_INIT
    })
}

fn print_info(reader: &mut impl Read, name: &str) -> ExitCode {
    let info: Info = match bytecode::read_info(reader) {
        Ok(info) => info,
        Err(_) => {
            report(
                "runtime error",
                format_args!("{name} is not a valid Unlambda bytecode file"),
            );
            return ExitCode::from(EC_INIT);
        }
    };
    println!("Version: {}.{}.X", info.ver_major, info.ver_minor);
    if info.version_matches() {
        match info.sizes {
            Some((text, rodata)) if info.prog_header_size == PROG_HEADER_SIZE => {
                println!("Size of section .text   (bytes): 0x{text:08X}");
                println!("Size of section .rodata (bytes): 0x{rodata:08X}");
            }
            _ => {
                println!(
                    "Program header unrecognizable ({} bytes)",
                    info.prog_header_size
                );
            }
        }
    }
    ExitCode::SUCCESS
}

fn run_program<R: Read>(program: Program, options: &RuntimeOptions, input: R) -> ExitCode {
    let output = io::BufWriter::new(io::stdout().lock());
    let mut rt = Runtime::new(program, options, input, output);
    let result = rt.execute();
    let (_, mut output) = rt.into_io();
    let _ = output.flush();
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            report("runtime error", err);
            ExitCode::from(EC_RUNTIME)
        }
    }
}
