//! `u6ac` - compiles Unlambda source to bytecode.

use std::fmt::Display;
use std::fs;
use std::io::{self, Read, Write};
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing::debug;

use u6a_core::bytecode::{self, Program};
use u6a_core::codegen::generate;
use u6a_core::lexer::lex;
use u6a_core::parser::parse;

const EC_OPTIONS: u8 = 1;
const EC_LEX: u8 = 2;
const EC_PARSE: u8 = 3;
const EC_CODEGEN: u8 = 4;

const DEFAULT_PREFIX: &str = "#!/usr/bin/env u6a\n";

/// Bytecode compiler for the Unlambda programming language.
#[derive(Parser, Debug)]
#[command(
    name = "u6ac",
    version,
    about = "Bytecode compiler for the Unlambda programming language",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Args {
    /// Unlambda source file, or `-` for standard input
    #[arg(value_name = "source-file")]
    source: String,

    /// Output bytecode file, or `-` for standard output
    #[arg(short = 'o', long = "out-file", value_name = "FILE")]
    out_file: Option<String>,

    /// Optimization level; 1 and above folds constant strings
    #[arg(short = 'O', value_name = "N", num_args = 0..=1, default_missing_value = "1")]
    optimize: Option<u8>,

    /// Prepend PREFIX to the output file (defaults to a u6a shebang line)
    #[arg(
        short = 'p',
        long = "add-prefix",
        value_name = "PREFIX",
        num_args = 0..=1,
        default_missing_value = DEFAULT_PREFIX
    )]
    add_prefix: Option<String>,

    /// Report the progress of each compilation stage
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Stop after parsing; no bytecode is written
    #[arg(short = 's', long = "syntax-only")]
    syntax_only: bool,

    /// Print help
    #[arg(short = 'H', long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// Print version
    #[arg(short = 'V', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

fn report(stage: &str, message: impl Display) {
    eprintln!("u6ac: [{stage}] {message}.");
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

enum Target {
    None,
    Stdout,
    File(String),
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
    init_tracing(args.verbose);
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn run(args: &Args) -> Result<(), u8> {
    let source_name = if args.source == "-" { "STDIN" } else { &args.source };
    debug!("reading source code from {source_name}");
    let source = if args.source == "-" {
        let mut buf = Vec::new();
        io::stdin().lock().read_to_end(&mut buf).map_err(|err| {
            report("error", format_args!("failed to read STDIN: {err}"));
            EC_OPTIONS
        })?;
        buf
    } else {
        fs::read(&args.source).map_err(|_| {
            report("error", format_args!("failed to open file {}", args.source));
            EC_OPTIONS
        })?
    };

    let target = if args.syntax_only {
        Target::None
    } else {
        match args.out_file.as_deref() {
            Some("-") => Target::Stdout,
            Some(name) => Target::File(name.to_owned()),
            None if args.source == "-" => Target::Stdout,
            None => Target::File(format!("{}.bc", args.source)),
        }
    };
    if matches!(target, Target::Stdout) && args.verbose {
        report("error", "cannot write to STDOUT in verbose mode");
        return Err(EC_OPTIONS);
    }

    // Open the target up front so a bad path is an option error and a stale
    // file never survives a failed compile.
    let (writer, out_path): (Option<Box<dyn Write>>, Option<String>) = match target {
        Target::None => (None, None),
        Target::Stdout => (Some(Box::new(io::stdout().lock())), None),
        Target::File(name) => {
            let file = fs::File::create(&name).map_err(|_| {
                report("error", format_args!("failed to open file {name}"));
                EC_OPTIONS
            })?;
            (Some(Box::new(io::BufWriter::new(file))), Some(name))
        }
    };

    let result = compile(args, &source, writer, out_path.as_deref());
    if result.is_err() {
        if let Some(path) = &out_path {
            let _ = fs::remove_file(path);
        }
    }
    result
}

fn compile(
    args: &Args,
    source: &[u8],
    writer: Option<Box<dyn Write>>,
    out_name: Option<&str>,
) -> Result<(), u8> {
    let tokens = lex(source).map_err(|err| {
        report("lex error", err);
        EC_LEX
    })?;
    let ast = parse(&tokens).map_err(|err| {
        report("parse error", err);
        EC_PARSE
    })?;
    let Some(mut writer) = writer else {
        return Ok(());
    };

    let optimize = args.optimize.unwrap_or(0) > 0;
    let program = generate(&ast, optimize);
    emit(&mut writer, &program, args.add_prefix.as_deref()).map_err(|err| {
        report(
            "codegen error",
            format_args!(
                "failed writing to {}: {err}",
                out_name.unwrap_or("STDOUT")
            ),
        );
        EC_CODEGEN
    })
}

fn emit(
    writer: &mut Box<dyn Write>,
    program: &Program,
    prefix: Option<&str>,
) -> io::Result<()> {
    if let Some(prefix) = prefix {
        writer.write_all(prefix.as_bytes())?;
        debug!("prefix string written, {} chars total", prefix.len());
    }
    bytecode::write(writer, program)?;
    writer.flush()
}
