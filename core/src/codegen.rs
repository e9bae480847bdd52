//! The code generator.
//!
//! One preorder pass over the AST emits post-order bytecode. Work that must
//! wait for a subtree (the outer half of an application) is parked on a
//! pending-frame stack and flushed each time a bottom application (both
//! operands atomic) is emitted.
//!
//! Shapes of `app(lhs, rhs)`:
//!
//! - both applications: park `sa` (emitted lazily so its skip offset can be
//!   patched once the matching `la` lands)
//! - atomic lhs, rhs application: park `app lhs _`; when the lhs is `d` the
//!   rhs must not be evaluated, so emit `del` over the rhs code instead
//! - lhs application, atomic rhs: park `app _ rhs`
//! - both atomic: emit `app lhs rhs`, then flush pending frames
//!
//! The constant-string peephole collapses a run of at least four parked
//! character prints into one `.rodata` string and a single `lc/print`.

use smallvec::SmallVec;
use tracing::debug;

use crate::bytecode::Program;
use crate::lexer::TokenKind;
use crate::parser::Ast;
use crate::vm::instruction::Instruction;
use crate::vm::value::{FnKind, Token};

/// Runs of fewer characters than this are not worth a `.rodata` string.
const OPTIMIZE_STR_MIN_LEN: usize = 4;

/// Deferred instructions, innermost on top.
#[derive(Clone, Copy, Debug)]
enum Pending {
    /// `sa`, not yet emitted.
    Sa,
    /// `app lhs _` with the argument coming from the accumulator.
    Func(Token),
    /// `app _ rhs` with the function coming from the accumulator.
    Arg(Token),
    /// `la` closing a `del` or `sa` at `patch`, whose skip offset becomes
    /// the address right past this `la`.
    La { patch: usize },
}

fn vm_token(token: crate::lexer::Token) -> Token {
    let kind = match token.kind {
        TokenKind::K => FnKind::K,
        TokenKind::S => FnKind::S,
        TokenKind::I => FnKind::I,
        TokenKind::V => FnKind::V,
        TokenKind::C => FnKind::C,
        TokenKind::D => FnKind::D,
        TokenKind::E => FnKind::E,
        TokenKind::In => FnKind::In,
        TokenKind::Pipe => FnKind::Pipe,
        TokenKind::Out => FnKind::Out,
        TokenKind::Cmp => FnKind::Cmp,
        TokenKind::Apply => unreachable!("applications are not operands"),
    };
    Token::with_char(kind, token.ch)
}

struct Codegen {
    text: Vec<Instruction>,
    rodata: Vec<u8>,
    pending: SmallVec<[Pending; 32]>,
    optimize_const: bool,
}

impl Codegen {
    fn emit(&mut self, ins: Instruction) {
        self.text.push(ins);
    }

    /// Emits a placeholder `del`/`sa` and parks the `la` that will patch it.
    fn emit_skip(&mut self, ins: Instruction) {
        let patch = self.text.len();
        self.emit(ins);
        self.pending.push(Pending::La { patch });
    }

    /// Flushes pending frames after a bottom application, stopping at the
    /// first `sa` (its subtree is emitted next).
    fn flush(&mut self) {
        while let Some(frame) = self.pending.pop() {
            match frame {
                Pending::Sa => {
                    self.emit_skip(Instruction::Sa { skip: 0 });
                    break;
                }
                Pending::Func(t) => self.emit(Instruction::App {
                    func: Some(t),
                    arg: None,
                }),
                Pending::Arg(t) => self.emit(Instruction::App {
                    func: None,
                    arg: Some(t),
                }),
                Pending::La { patch } => {
                    self.emit(Instruction::La);
                    let skip = self.text.len() as u32;
                    match &mut self.text[patch] {
                        Instruction::Sa { skip: slot } | Instruction::Del { skip: slot } => {
                            *slot = skip
                        }
                        _ => unreachable!("skip patch targets sa/del"),
                    }
                }
            }
        }
    }

    /// Bottom application. With optimization on, a chain of parked
    /// character prints ending here collapses into one string print.
    fn emit_bottom(&mut self, lhs: Token, rhs: Token) {
        if self.optimize_const && lhs.kind == FnKind::Out {
            let run = self
                .pending
                .iter()
                .rev()
                .take_while(|f| matches!(f, Pending::Func(t) if t.kind == FnKind::Out))
                .count();
            if 1 + run >= OPTIMIZE_STR_MIN_LEN {
                let offset = self.rodata.len() as u32;
                self.rodata.push(lhs.ch);
                for _ in 0..run {
                    match self.pending.pop() {
                        Some(Pending::Func(t)) => self.rodata.push(t.ch),
                        _ => unreachable!("counted frames are character prints"),
                    }
                }
                self.rodata.push(0);
                self.emit(Instruction::Print { offset });
                self.emit(Instruction::App {
                    func: None,
                    arg: Some(rhs),
                });
                return;
            }
        }
        self.emit(Instruction::App {
            func: Some(lhs),
            arg: Some(rhs),
        });
    }
}

/// Generates bytecode for a parsed program.
pub fn generate(ast: &Ast, optimize_const: bool) -> Program {
    let mut state = Codegen {
        text: Vec::with_capacity(ast.nodes.len()),
        rodata: Vec::new(),
        pending: SmallVec::new(),
        optimize_const,
    };
    for idx in 0..ast.nodes.len() {
        if ast.nodes[idx].token.kind != TokenKind::Apply {
            continue;
        }
        let lhs = ast.left(idx);
        let rhs = ast.right(idx);
        match (
            lhs.token.kind == TokenKind::Apply,
            rhs.token.kind == TokenKind::Apply,
        ) {
            (true, true) => state.pending.push(Pending::Sa),
            (true, false) => state.pending.push(Pending::Arg(vm_token(rhs.token))),
            (false, true) => {
                if lhs.token.kind == TokenKind::D {
                    state.emit_skip(Instruction::Del { skip: 0 });
                } else {
                    state.pending.push(Pending::Func(vm_token(lhs.token)));
                }
            }
            (false, false) => {
                state.emit_bottom(vm_token(lhs.token), vm_token(rhs.token));
                state.flush();
            }
        }
    }
    debug_assert!(state.pending.is_empty(), "unflushed codegen frames");
    debug!(
        "codegen completed, text: {}, rodata: {}",
        state.text.len(),
        state.rodata.len()
    );
    Program {
        text: state.text,
        rodata: state.rodata,
    }
}
