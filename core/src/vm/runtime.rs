//! The evaluator.
//!
//! A single dispatch loop over the loaded text, with an inner reduction
//! table for applications. The machine state is one accumulator, an
//! instruction pointer, the segmented stack, the object pool and the last
//! byte read from input. All of it lives in [`Runtime`]; nothing is global,
//! so independent runtimes can execute side by side.
//!
//! Every loaded program runs behind a fixed five-instruction bootstrap
//! prologue (`la xch la la la`). The `s2` reduction re-enters it to
//! evaluate `` `(xz)(yz) `` without growing the native call stack, and the
//! address of its fourth slot doubles as the re-entry point for forced
//! `d1_s` promises.

use std::io::{Read, Write};

use thiserror::Error;

use crate::bytecode::Program;
use crate::vm::instruction::Instruction;
use crate::vm::pool::Pool;
use crate::vm::stack::SegmentStore;
use crate::vm::value::{FnKind, Value};

pub use crate::vm::pool::{DEFAULT_POOL_SIZE, MAX_POOL_SIZE, MIN_POOL_SIZE};
pub use crate::vm::stack::{DEFAULT_SEGMENT_SIZE, MAX_SEGMENT_SIZE, MIN_SEGMENT_SIZE};

/// The implicit outer application context prepended to every program.
pub const BOOTSTRAP: [Instruction; 5] = [
    Instruction::La,
    Instruction::Xch,
    Instruction::La,
    Instruction::La,
    Instruction::La,
];

#[derive(Clone, Copy, Debug)]
pub struct RuntimeOptions {
    pub stack_segment_size: u32,
    pub pool_size: u32,
    pub force_exec: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            stack_segment_size: DEFAULT_SEGMENT_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            force_exec: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("object pool exhausted")]
    PoolExhausted,
    #[error("invalid opcode 0x{0:02X}")]
    InvalidOpcode(u8),
    #[error("instruction pointer out of range")]
    IpOutOfRange,
    #[error("no function value to apply")]
    EmptyAccumulator,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Runtime<R, W> {
    text: Vec<Instruction>,
    rodata: Vec<u8>,
    pool: Pool,
    stack: SegmentStore,
    acc: Option<Value>,
    ip: usize,
    current_char: Option<u8>,
    force: bool,
    input: R,
    output: W,
}

impl<R: Read, W: Write> Runtime<R, W> {
    pub fn new(program: Program, options: &RuntimeOptions, input: R, output: W) -> Runtime<R, W> {
        let mut text = Vec::with_capacity(BOOTSTRAP.len() + program.text.len());
        text.extend_from_slice(&BOOTSTRAP);
        text.extend_from_slice(&program.text);
        let ins_len = text.len();
        Runtime {
            text,
            rodata: program.rodata,
            pool: Pool::new(options.pool_size, ins_len),
            stack: SegmentStore::new(options.stack_segment_size),
            acc: None,
            ip: BOOTSTRAP.len(),
            current_char: None,
            force: options.force_exec,
            input,
            output,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Consumes the runtime, returning the I/O endpoints.
    pub fn into_io(self) -> (R, W) {
        (self.input, self.output)
    }

    /// Runs until the program applies `e`, returning its terminal argument.
    pub fn execute(&mut self) -> Result<Value, VmError> {
        loop {
            let ins = *self.text.get(self.ip).ok_or(VmError::IpOutOfRange)?;
            match ins {
                Instruction::App { func, arg } => {
                    let (func, arg) = match (func, arg) {
                        (Some(f), Some(a)) => (f.value(), a.value()),
                        (Some(f), None) => (f.value(), self.take_acc()?),
                        (None, Some(a)) => (self.take_acc()?, a.value()),
                        (None, None) => return Err(VmError::EmptyAccumulator),
                    };
                    if let Some(terminal) = self.apply(func, arg)? {
                        return Ok(terminal);
                    }
                }
                Instruction::La => {
                    let arg = self.take_acc()?;
                    let func = self
                        .stack
                        .pop(&mut self.pool)
                        .ok_or(VmError::StackUnderflow)?;
                    if let Some(terminal) = self.apply(func, arg)? {
                        return Ok(terminal);
                    }
                }
                Instruction::Sa { skip } => {
                    let v = self.acc_value()?;
                    if v.kind == FnKind::D {
                        self.delay(skip);
                    } else {
                        self.pool.addref_value(v);
                        self.stack.push(v);
                        self.ip += 1;
                    }
                }
                Instruction::Del { skip } => self.delay(skip),
                Instruction::Print { offset } => {
                    self.set_acc(Value::with_index(FnKind::P, offset));
                    self.ip += 1;
                }
                Instruction::Xch => {
                    if self.acc_value()?.kind == FnKind::D {
                        let v1 = self
                            .stack
                            .pop(&mut self.pool)
                            .ok_or(VmError::StackUnderflow)?;
                        let v2 = self
                            .stack
                            .pop(&mut self.pool)
                            .ok_or(VmError::StackUnderflow)?;
                        let cell = self.alloc2(v1, v2)?;
                        self.set_acc(Value::with_index(FnKind::D1S, cell));
                    } else {
                        let v = self.take_acc()?;
                        let old = self
                            .stack
                            .xch(v, &mut self.pool)
                            .ok_or(VmError::StackUnderflow)?;
                        self.acc = Some(old);
                    }
                    self.ip += 1;
                }
                Instruction::Invalid { opcode, .. } => {
                    if self.force {
                        self.ip += 1;
                    } else {
                        return Err(VmError::InvalidOpcode(opcode));
                    }
                }
            }
        }
    }

    /// One application. Returns the terminal value when the function is `e`.
    ///
    /// Reference contract: `func` and `arg` each carry one owned reference,
    /// both consumed here (moved into a cell, the accumulator or the stack,
    /// or released).
    fn apply(&mut self, func: Value, arg: Value) -> Result<Option<Value>, VmError> {
        let mut func = func;
        let mut arg = arg;
        loop {
            match func.kind {
                FnKind::S => {
                    let cell = self.alloc1(arg)?;
                    self.set_acc(Value::with_index(FnKind::S1, cell));
                }
                FnKind::S1 => {
                    let x = self.pool.get1(func.idx);
                    self.pool.addref_value(x);
                    let cell = self.alloc2(x, arg)?;
                    self.release(func);
                    self.set_acc(Value::with_index(FnKind::S2, cell));
                }
                FnKind::S2 => {
                    // `` ``sxy z -> `(`xz)(`yz) ``: run z through the
                    // bootstrap against x and y. No jump stub is needed when
                    // the application site is the bootstrap's own fourth
                    // slot, whose successor already continues correctly.
                    let (x, y) = self.pool.get2(func.idx);
                    self.pool.addref_value(x);
                    self.pool.addref_value(y);
                    self.pool.addref_value(arg);
                    if self.ip == 3 {
                        self.stack.push3(arg, y, x);
                    } else {
                        self.stack.push4(
                            Value::with_index(FnKind::J, self.ip as u32),
                            arg,
                            y,
                            x,
                        );
                    }
                    self.release(func);
                    self.set_acc(arg);
                    self.ip = 0;
                    return Ok(None);
                }
                FnKind::K => {
                    let cell = self.alloc1(arg)?;
                    self.set_acc(Value::with_index(FnKind::K1, cell));
                }
                FnKind::K1 => {
                    let x = self.pool.get1(func.idx);
                    self.pool.addref_value(x);
                    self.release(func);
                    self.release(arg);
                    self.set_acc(x);
                }
                FnKind::I => self.set_acc(arg),
                FnKind::V => {
                    self.release(arg);
                    self.set_acc(Value::new(FnKind::V));
                }
                FnKind::E => {
                    if let Some(old) = self.acc.take() {
                        self.pool.release(old, &mut self.stack);
                    }
                    return Ok(Some(arg));
                }
                FnKind::Out => {
                    self.output.write_all(&[func.ch])?;
                    self.set_acc(arg);
                }
                FnKind::P => {
                    let off = func.idx as usize;
                    let bytes = self.rodata.get(off..).unwrap_or(&[]);
                    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    self.output.write_all(&bytes[..end])?;
                    self.set_acc(arg);
                }
                FnKind::In => {
                    let mut buf = [0u8; 1];
                    self.current_char = match self.input.read(&mut buf) {
                        Ok(0) | Err(_) => None,
                        Ok(_) => Some(buf[0]),
                    };
                    func = arg;
                    arg = Value::new(if self.current_char.is_some() {
                        FnKind::I
                    } else {
                        FnKind::V
                    });
                    continue;
                }
                FnKind::Cmp => {
                    let hit = self.current_char == Some(func.ch);
                    func = arg;
                    arg = Value::new(if hit { FnKind::I } else { FnKind::V });
                    continue;
                }
                FnKind::Pipe => {
                    let delivered = match self.current_char {
                        Some(ch) => Value::with_char(FnKind::Out, ch),
                        None => Value::new(FnKind::V),
                    };
                    func = arg;
                    arg = delivered;
                    continue;
                }
                FnKind::J => {
                    self.set_acc(arg);
                    self.ip = func.idx as usize;
                }
                FnKind::F => {
                    // The forced result sits in the argument; the promise's
                    // own argument was saved below the stub.
                    self.ip = func.idx as usize;
                    let saved = self
                        .stack
                        .pop(&mut self.pool)
                        .ok_or(VmError::StackUnderflow)?;
                    func = arg;
                    arg = saved;
                    continue;
                }
                FnKind::C => {
                    let handle = self.stack.save(&mut self.pool);
                    let cell = self
                        .pool
                        .alloc_cont(handle, self.ip as u32)
                        .ok_or(VmError::PoolExhausted)?;
                    self.release(arg);
                    self.set_acc(Value::with_index(FnKind::C1, cell));
                }
                FnKind::C1 => {
                    let (handle, saved_ip) = if self.pool.refcount(func.idx) == 1 {
                        self.pool.take_cont(func.idx)
                    } else {
                        // Shared continuation: give this invocation a
                        // private copy of the captured head.
                        let (shared, saved_ip) = self.pool.cont(func.idx);
                        (self.stack.dup(shared, &mut self.pool), saved_ip)
                    };
                    self.stack.resume(handle, &mut self.pool);
                    self.ip = saved_ip as usize;
                    self.release(func);
                    self.set_acc(arg);
                }
                FnKind::D => {
                    let cell = self.alloc1(arg)?;
                    self.set_acc(Value::with_index(FnKind::D1C, cell));
                }
                FnKind::D1C => {
                    let x = self.pool.get1(func.idx);
                    self.pool.addref_value(x);
                    self.release(func);
                    func = x;
                    continue;
                }
                FnKind::D1S => {
                    let (x, y) = self.pool.get2(func.idx);
                    self.pool.addref_value(x);
                    self.pool.addref_value(y);
                    self.release(func);
                    self.release(arg);
                    self.stack.push(x);
                    self.set_acc(y);
                    self.ip = 3;
                    return Ok(None);
                }
                FnKind::D1D => {
                    self.stack
                        .push2(arg, Value::with_index(FnKind::F, self.ip as u32));
                    self.ip = func.idx as usize;
                    return Ok(None);
                }
            }
            self.ip += 1;
            return Ok(None);
        }
    }

    /// Stores a promise for the delayed body starting right after this
    /// instruction and jumps past it.
    fn delay(&mut self, skip: u32) {
        let body = (self.ip + 1) as u32;
        self.set_acc(Value::with_index(FnKind::D1D, body));
        self.ip = BOOTSTRAP.len() + skip as usize;
    }

    fn set_acc(&mut self, v: Value) {
        if let Some(old) = self.acc.take() {
            self.pool.release(old, &mut self.stack);
        }
        self.acc = Some(v);
    }

    fn take_acc(&mut self) -> Result<Value, VmError> {
        self.acc.take().ok_or(VmError::EmptyAccumulator)
    }

    fn acc_value(&self) -> Result<Value, VmError> {
        self.acc.ok_or(VmError::EmptyAccumulator)
    }

    #[inline]
    fn release(&mut self, v: Value) {
        self.pool.release(v, &mut self.stack);
    }

    fn alloc1(&mut self, v: Value) -> Result<u32, VmError> {
        self.pool.alloc1(v).ok_or(VmError::PoolExhausted)
    }

    fn alloc2(&mut self, v1: Value, v2: Value) -> Result<u32, VmError> {
        self.pool.alloc2(v1, v2).ok_or(VmError::PoolExhausted)
    }

    /// Releases the accumulator and everything left on the stack. After a
    /// normal halt this returns the machine to the zero-live-cells state.
    pub fn reset(&mut self) {
        if let Some(old) = self.acc.take() {
            self.pool.release(old, &mut self.stack);
        }
        while let Some(v) = self.stack.pop(&mut self.pool) {
            self.pool.release(v, &mut self.stack);
        }
    }

    /// Releases a value previously handed out by [`Runtime::execute`].
    pub fn release_terminal(&mut self, v: Value) {
        self.pool.release(v, &mut self.stack);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::vm::instruction::Instruction as I;
    use crate::vm::pool::Cell;
    use crate::vm::value::Token;
    use crate::{codegen, lexer, parser};

    fn compile(source: &str, optimize: bool) -> Program {
        let tokens = lexer::lex(source.as_bytes()).unwrap();
        let ast = parser::parse(&tokens).unwrap();
        codegen::generate(&ast, optimize)
    }

    fn run_program(program: Program, input: &[u8]) -> String {
        let mut rt = Runtime::new(
            program,
            &RuntimeOptions::default(),
            input,
            Vec::<u8>::new(),
        );
        let terminal = rt.execute().expect("program faulted");
        rt.release_terminal(terminal);
        rt.reset();
        audit(&rt);
        assert_eq!(rt.pool().live(), 0, "leaked pool cells");
        let (_, out) = rt.into_io();
        String::from_utf8(out).unwrap()
    }

    fn run_source(source: &str, optimize: bool, input: &[u8]) -> String {
        run_program(compile(source, optimize), input)
    }

    /// Checks the refcount bookkeeping: every live cell's count equals the
    /// number of places that name it.
    fn audit<R, W>(rt: &Runtime<R, W>) {
        let mut counts: HashMap<u32, u32> = HashMap::new();
        let mut note = |v: Value| {
            if v.kind.holds_ref() {
                *counts.entry(v.idx).or_default() += 1;
            }
        };
        if let Some(acc) = rt.acc {
            note(acc);
        }
        for v in rt.stack.elements() {
            note(v);
        }
        for (_, _, cell) in rt.pool.live_cells() {
            match cell {
                Cell::One(a) => note(a),
                Cell::Two(a, b) => {
                    note(a);
                    note(b);
                }
                Cell::Cont { .. } => {}
            }
        }
        for (idx, refcnt, _) in rt.pool.live_cells() {
            assert_eq!(
                refcnt,
                counts.get(&idx).copied().unwrap_or(0),
                "refcount mismatch for cell {idx}"
            );
        }
    }

    fn app(func: Option<Token>, arg: Option<Token>) -> I {
        I::App { func, arg }
    }

    fn tok(kind: FnKind) -> Option<Token> {
        Some(Token::new(kind))
    }

    fn out(ch: u8) -> Option<Token> {
        Some(Token::with_char(FnKind::Out, ch))
    }

    #[test]
    fn print_one_character() {
        assert_eq!(run_source("`.*i", false, b""), "*");
    }

    #[test]
    fn ski_identity_applied_to_newline_printer() {
        assert_eq!(run_source("```s`kr``si`kii", false, b""), "\n");
    }

    #[test]
    fn continuation_captured_and_discarded() {
        assert_eq!(run_source("``cir", false, b""), "\n");
    }

    #[test]
    fn delayed_print_forced_once() {
        assert_eq!(run_source("``d`rii", false, b""), "\n");
    }

    #[test]
    fn plain_combinators_produce_no_output() {
        assert_eq!(run_source("i", false, b""), "");
        assert_eq!(run_source("`ki", false, b""), "");
        assert_eq!(run_source("``kiv", false, b""), "");
        assert_eq!(run_source("`vi", false, b""), "");
    }

    #[test]
    fn print_chain_with_and_without_peephole() {
        let source = "`.H`.e`.l`.l`.o`.!`.!`.!i";
        // The cascade reduces innermost-first, so the bytes come out
        // reversed relative to the source.
        assert_eq!(run_source(source, false, b""), "!!!olleH");
        assert_eq!(run_source(source, true, b""), "!!!olleH");

        let plain = compile(source, false);
        let folded = compile(source, true);
        let prints = |p: &Program| {
            p.text
                .iter()
                .filter(|i| matches!(i, I::Print { .. }))
                .count()
        };
        let out_apps = |p: &Program| {
            p.text
                .iter()
                .filter(|i| {
                    matches!(i, I::App { func: Some(t), .. } if t.kind == FnKind::Out)
                })
                .count()
        };
        assert_eq!(prints(&plain), 0);
        assert_eq!(out_apps(&plain), 8);
        assert_eq!(prints(&folded), 1);
        assert_eq!(out_apps(&folded), 0);
        assert_eq!(folded.rodata, b"!!!olleH\0");
    }

    #[test]
    fn left_nested_cascade_prints_in_source_order() {
        let source = "````````.H.e.l.l.o.!.!.!i";
        assert_eq!(run_source(source, false, b""), "Hello!!!");
        assert_eq!(run_source(source, true, b""), "Hello!!!");
    }

    #[test]
    fn input_echo_through_pipe() {
        // Reads one byte, then `|` turns it into a print combinator.
        let source = "``@i``|ii";
        assert_eq!(run_source(source, false, b"x"), "x");
        assert_eq!(run_source(source, false, b""), "");
    }

    #[test]
    fn compare_selects_a_branch() {
        // `?a` yields `i` on a match and `v` otherwise; only the match
        // lets the print combinator through to its argument.
        let source = "``@i```?ai.yi";
        assert_eq!(run_source(source, false, b"a"), "y");
        assert_eq!(run_source(source, false, b"b"), "");
    }

    #[test]
    fn input_at_eof_delivers_v() {
        assert_eq!(run_source("``@i``|ii", false, b""), "");
    }

    #[test]
    fn terminal_value_of_identity_program() {
        let mut rt = Runtime::new(
            compile("i", false),
            &RuntimeOptions::default(),
            &b""[..],
            Vec::<u8>::new(),
        );
        let terminal = rt.execute().unwrap();
        assert_eq!(terminal.kind, FnKind::I);
    }

    #[test]
    fn pool_exhaustion_faults() {
        let options = RuntimeOptions {
            pool_size: MIN_POOL_SIZE,
            ..RuntimeOptions::default()
        };
        // Nests k1 cells without ever releasing one.
        let mut text = vec![app(tok(FnKind::K), tok(FnKind::K))];
        for _ in 0..MIN_POOL_SIZE {
            text.push(app(tok(FnKind::K), None));
        }
        text.push(app(tok(FnKind::E), None));
        let program = Program {
            text,
            rodata: Vec::new(),
        };
        let mut rt = Runtime::new(program, &options, &b""[..], Vec::<u8>::new());
        assert!(matches!(rt.execute(), Err(VmError::PoolExhausted)));
    }

    #[test]
    fn stack_underflow_faults() {
        let program = Program {
            text: vec![app(tok(FnKind::I), tok(FnKind::I)), I::La],
            rodata: Vec::new(),
        };
        let mut rt = Runtime::new(
            program,
            &RuntimeOptions::default(),
            &b""[..],
            Vec::<u8>::new(),
        );
        assert!(matches!(rt.execute(), Err(VmError::StackUnderflow)));
    }

    #[test]
    fn invalid_opcode_faults_unless_forced() {
        let text = vec![
            I::Invalid {
                opcode: 0xFF,
                opcode_ex: 0,
            },
            app(tok(FnKind::E), tok(FnKind::I)),
        ];
        let program = Program {
            text: text.clone(),
            rodata: Vec::new(),
        };
        let mut rt = Runtime::new(
            program.clone(),
            &RuntimeOptions::default(),
            &b""[..],
            Vec::<u8>::new(),
        );
        assert!(matches!(rt.execute(), Err(VmError::InvalidOpcode(0xFF))));

        let options = RuntimeOptions {
            force_exec: true,
            ..RuntimeOptions::default()
        };
        let mut rt = Runtime::new(program, &options, &b""[..], Vec::<u8>::new());
        let terminal = rt.execute().unwrap();
        assert_eq!(terminal.kind, FnKind::I);
    }

    // A shared continuation (still referenced from the stack) must be
    // reinstated from a private copy of its captured head.
    #[test]
    fn shared_continuation_is_separated_on_reinstate() {
        let program = Program {
            text: vec![
                app(tok(FnKind::C), tok(FnKind::I)),
                I::Sa { skip: 0 },
                app(None, out(b'x')),
                app(tok(FnKind::E), None),
            ],
            rodata: Vec::new(),
        };
        assert_eq!(run_program(program, b""), "x");
    }

    // Capture, stash on the stack, reinstate via `la`, capture again on the
    // replayed path. Three prints: one from each pass over the `app` at
    // address 3, one from the final `la`.
    #[test]
    fn continuations_replay_the_captured_context() {
        let program = Program {
            text: vec![
                app(tok(FnKind::C), tok(FnKind::I)),
                I::Sa { skip: 0 },
                app(tok(FnKind::C), None),
                app(None, out(b'x')),
                I::La,
                app(tok(FnKind::E), None),
            ],
            rodata: Vec::new(),
        };
        assert_eq!(run_program(program, b""), "xxx");
    }

    #[test]
    fn compiled_print_writes_rodata_string() {
        let program = Program {
            text: vec![
                I::Print { offset: 0 },
                app(None, tok(FnKind::I)),
                app(tok(FnKind::E), None),
            ],
            rodata: b"hello\0".to_vec(),
        };
        assert_eq!(run_program(program, b""), "hello");
    }

    #[test]
    fn deep_s_reductions_balance_the_pool() {
        // ``s``s`ks`kki applied around enough structure to push the stack
        // across segment boundaries with a tiny segment size.
        let options = RuntimeOptions {
            stack_segment_size: MIN_SEGMENT_SIZE,
            ..RuntimeOptions::default()
        };
        let mut rt = Runtime::new(
            compile("```s`kr``si`kii", false),
            &options,
            &b""[..],
            Vec::<u8>::new(),
        );
        let terminal = rt.execute().unwrap();
        rt.release_terminal(terminal);
        rt.reset();
        audit(&rt);
        assert_eq!(rt.pool().live(), 0);
        let (_, out) = rt.into_io();
        assert_eq!(out, b"\n");
    }

    #[test]
    fn audit_holds_before_and_after_execution() {
        let mut rt = Runtime::new(
            compile("``d`rii", false),
            &RuntimeOptions::default(),
            &b""[..],
            Vec::<u8>::new(),
        );
        audit(&rt);
        let terminal = rt.execute().unwrap();
        audit(&rt);
        rt.release_terminal(terminal);
        rt.reset();
        audit(&rt);
    }
}
