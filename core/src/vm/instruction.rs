//! The bytecode instruction set.
//!
//! # Wire format
//!
//! Every instruction occupies exactly 8 bytes:
//!
//! ```text
//! +--------+-----------+----------+---------------------+
//! | opcode | opcode_ex | reserved |       operand       |
//! | 1 byte |  1 byte   | 2 bytes  |       4 bytes       |
//! +--------+-----------+----------+---------------------+
//! ```
//!
//! The operand is either a big-endian 32-bit offset (opcodes with the
//! `OP_OFFSET` bit) or a pair of function tokens `first.kind, first.ch,
//! second.kind, second.ch` (the `app` opcode). A zero kind byte in an `app`
//! operand means "use the accumulator".
//!
//! Opcode bits classify the instruction:
//!
//! - `OP_APPLY`    - performs an application (`app`, `la`)
//! - `OP_OFFSET`   - operand is an offset (`sa`, `del`, `lc`)
//! - `OP_EXTENDED` - `opcode_ex` selects a sub-opcode (`lc` + `print`)
//! - `OP_INTERNAL` - runtime-synthesized stub (`xch`, part of the bootstrap
//!   prologue, never emitted by the compiler)
//!
//! Offsets in `sa`/`del` operands are relative to the start of the compiled
//! bytecode; the evaluator adds the bootstrap length when jumping. The
//! `lc/print` offset indexes `.rodata`.

use crate::vm::value::{FnKind, Token};

pub const OP_APPLY: u8 = 1 << 4;
pub const OP_OFFSET: u8 = 1 << 5;
pub const OP_EXTENDED: u8 = 1 << 6;
pub const OP_INTERNAL: u8 = 1 << 7;

pub const OP_APP: u8 = OP_APPLY;
pub const OP_LA: u8 = OP_APPLY | 0x01;
pub const OP_SA: u8 = OP_OFFSET;
pub const OP_DEL: u8 = OP_OFFSET | 0x01;
pub const OP_LC: u8 = OP_OFFSET | OP_EXTENDED;
pub const OP_XCH: u8 = OP_INTERNAL;

/// Sub-opcode of `lc`: load a compiled string-print function.
pub const OP_EX_PRINT: u8 = 1 << 4;

/// A decoded instruction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Instruction {
    /// Apply `func` to `arg`; `None` means "use the accumulator". At most
    /// one operand is ever `None` in compiler output.
    App {
        func: Option<Token>,
        arg: Option<Token>,
    },
    /// Pop the stack, apply the popped value to the accumulator.
    La,
    /// Push the accumulator. When the accumulator is `d`, delays instead:
    /// the following instructions up to `skip` are the unevaluated operand.
    Sa { skip: u32 },
    /// Store a promise for the following instructions in the accumulator
    /// and jump to `skip`.
    Del { skip: u32 },
    /// Load a compiled string-print function for `.rodata[offset..]`.
    Print { offset: u32 },
    /// Swap the accumulator with the element below the stack top (or build
    /// a promise from the top two elements when the accumulator is `d`).
    Xch,
    /// Anything unrecognized. Kept so that forced execution can skip it;
    /// fatal otherwise.
    Invalid { opcode: u8, opcode_ex: u8 },
}

impl Instruction {
    /// Encodes to the 8-byte wire form.
    pub fn encode(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        match self {
            Instruction::App { func, arg } => {
                out[0] = OP_APP;
                if let Some(t) = func {
                    out[4] = t.kind as u8;
                    out[5] = t.ch;
                }
                if let Some(t) = arg {
                    out[6] = t.kind as u8;
                    out[7] = t.ch;
                }
            }
            Instruction::La => out[0] = OP_LA,
            Instruction::Sa { skip } => {
                out[0] = OP_SA;
                out[4..8].copy_from_slice(&skip.to_be_bytes());
            }
            Instruction::Del { skip } => {
                out[0] = OP_DEL;
                out[4..8].copy_from_slice(&skip.to_be_bytes());
            }
            Instruction::Print { offset } => {
                out[0] = OP_LC;
                out[1] = OP_EX_PRINT;
                out[4..8].copy_from_slice(&offset.to_be_bytes());
            }
            Instruction::Xch => out[0] = OP_XCH,
            Instruction::Invalid { opcode, opcode_ex } => {
                out[0] = opcode;
                out[1] = opcode_ex;
            }
        }
        out
    }

    /// Decodes the 8-byte wire form. Total: unknown opcodes (and malformed
    /// `app` operands) decode to [`Instruction::Invalid`].
    pub fn decode(bytes: [u8; 8]) -> Instruction {
        let opcode = bytes[0];
        let opcode_ex = bytes[1];
        let offset = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        match opcode {
            OP_APP => {
                let func = match bytes[4] {
                    0 => None,
                    byte => match FnKind::from_wire(byte) {
                        Some(kind) => Some(Token::with_char(kind, bytes[5])),
                        None => return Instruction::Invalid { opcode, opcode_ex },
                    },
                };
                let arg = match bytes[6] {
                    0 => None,
                    byte => match FnKind::from_wire(byte) {
                        Some(kind) => Some(Token::with_char(kind, bytes[7])),
                        None => return Instruction::Invalid { opcode, opcode_ex },
                    },
                };
                if func.is_none() && arg.is_none() {
                    return Instruction::Invalid { opcode, opcode_ex };
                }
                Instruction::App { func, arg }
            }
            OP_LA => Instruction::La,
            OP_SA => Instruction::Sa { skip: offset },
            OP_DEL => Instruction::Del { skip: offset },
            OP_LC if opcode_ex == OP_EX_PRINT => Instruction::Print { offset },
            OP_XCH => Instruction::Xch,
            _ => Instruction::Invalid { opcode, opcode_ex },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn roundtrip() {
        let samples = [
            Instruction::App {
                func: Some(Token::new(FnKind::S)),
                arg: Some(Token::new(FnKind::K)),
            },
            Instruction::App {
                func: Some(Token::with_char(FnKind::Out, b'*')),
                arg: None,
            },
            Instruction::App {
                func: None,
                arg: Some(Token::with_char(FnKind::Cmp, b'a')),
            },
            Instruction::La,
            Instruction::Sa { skip: 0x01020304 },
            Instruction::Del { skip: 7 },
            Instruction::Print { offset: 42 },
            Instruction::Xch,
        ];
        for ins in samples {
            assert_eq!(Instruction::decode(ins.encode()), ins);
        }
    }

    #[test]
    fn offsets_are_big_endian() {
        let bytes = Instruction::Del { skip: 0x0A0B0C0D }.encode();
        assert_eq!(&bytes[4..], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn unknown_opcode_decodes_to_invalid() {
        let ins = Instruction::decode([0xFF, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            ins,
            Instruction::Invalid {
                opcode: 0xFF,
                opcode_ex: 0
            }
        );
    }

    #[test]
    fn unknown_lc_sub_opcode_is_invalid() {
        let ins = Instruction::decode([OP_LC, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            ins,
            Instruction::Invalid {
                opcode: OP_LC,
                opcode_ex: 0x01
            }
        );
    }

    #[test]
    fn bad_app_operand_kind_is_invalid() {
        let ins = Instruction::decode([OP_APP, 0, 0, 0, 0x7F, 0, FnKind::I as u8, 0]);
        assert!(matches!(ins, Instruction::Invalid { .. }));
    }
}
