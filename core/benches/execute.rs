use criterion::{Criterion, black_box, criterion_group, criterion_main};

use u6a_core::bytecode::Program;
use u6a_core::codegen::generate;
use u6a_core::lexer::lex;
use u6a_core::parser::parse;
use u6a_core::vm::{Runtime, RuntimeOptions};

const SKI: &str = "```s`kr``si`kii";
const CHAIN: &str = "`.H`.e`.l`.l`.o`.!`.!`.!i";

fn compile(source: &str, optimize: bool) -> Program {
    generate(&parse(&lex(source.as_bytes()).unwrap()).unwrap(), optimize)
}

fn run(program: &Program) -> Vec<u8> {
    let mut rt = Runtime::new(
        program.clone(),
        &RuntimeOptions::default(),
        &b""[..],
        Vec::new(),
    );
    rt.execute().unwrap();
    rt.into_io().1
}

fn bench_pipeline(c: &mut Criterion) {
    c.bench_function("compile_ski", |b| {
        b.iter(|| compile(black_box(SKI), true))
    });

    let ski = compile(SKI, false);
    c.bench_function("execute_ski", |b| b.iter(|| black_box(run(&ski))));

    let chain = compile(CHAIN, false);
    c.bench_function("execute_print_chain", |b| b.iter(|| black_box(run(&chain))));

    let folded = compile(CHAIN, true);
    c.bench_function("execute_print_chain_folded", |b| {
        b.iter(|| black_box(run(&folded)))
    });
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
