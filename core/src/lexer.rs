//! The lexer.
//!
//! Unlambda source is a stream of single-byte tokens: the applicator
//! `` ` ``, the combinators `s k i v c d e` (either case), the I/O
//! primitives `@` and `|`, and the two payload-carrying forms `.X` and
//! `?X`, where the payload is the next byte. `r` abbreviates `.` with a
//! newline payload. `#` starts a comment running to end of line, and
//! whitespace separates nothing in particular.

use thiserror::Error;
use tracing::debug;

/// Source-level token kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TokenKind {
    /// `` ` `` - the application prefix.
    Apply,
    K,
    S,
    I,
    V,
    C,
    D,
    E,
    /// `@`
    In,
    /// `|`
    Pipe,
    /// `.X` (and `r` for `.`-newline)
    Out,
    /// `?X`
    Cmp,
}

/// One token; `ch` is meaningful for `Out` and `Cmp` only.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub ch: u8,
}

impl Token {
    pub const fn new(kind: TokenKind) -> Token {
        Token { kind, ch: 0 }
    }

    pub const fn with_char(kind: TokenKind, ch: u8) -> Token {
        Token { kind, ch }
    }
}

/// A byte formatted the way diagnostics quote it: printable characters in
/// quotes, newline escaped, anything else in hex.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Byte(pub u8);

impl std::fmt::Display for Byte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            b'\n' => write!(f, "'\\n'"),
            b if is_printable(b) => write!(f, "'{}'", b as char),
            b => write!(f, "0x{b:02X}"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unrecognizable character {0}")]
    Unrecognized(Byte),
    #[error("unexpected end of file after '{0}'")]
    UnexpectedEof(char),
    #[error("printable character or '\\n' expected, 0x{0:02X} given")]
    Unprintable(u8),
}

#[inline]
fn is_printable(byte: u8) -> bool {
    (0x20..=0x7E).contains(&byte)
}

/// Lexes a whole source buffer.
pub fn lex(source: &[u8]) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut bytes = source.iter().copied();
    while let Some(byte) = bytes.next() {
        let token = match byte {
            b'#' => {
                for b in bytes.by_ref() {
                    if b == b'\n' {
                        break;
                    }
                }
                continue;
            }
            b if b.is_ascii_whitespace() => continue,
            b'`' => Token::new(TokenKind::Apply),
            b's' | b'S' => Token::new(TokenKind::S),
            b'k' | b'K' => Token::new(TokenKind::K),
            b'i' | b'I' => Token::new(TokenKind::I),
            b'v' | b'V' => Token::new(TokenKind::V),
            b'c' | b'C' => Token::new(TokenKind::C),
            b'd' | b'D' => Token::new(TokenKind::D),
            b'e' | b'E' => Token::new(TokenKind::E),
            b'r' | b'R' => Token::with_char(TokenKind::Out, b'\n'),
            b'@' => Token::new(TokenKind::In),
            b'|' => Token::new(TokenKind::Pipe),
            b'.' => Token::with_char(TokenKind::Out, payload(&mut bytes, '.')?),
            b'?' => Token::with_char(TokenKind::Cmp, payload(&mut bytes, '?')?),
            b => return Err(LexError::Unrecognized(Byte(b))),
        };
        tokens.push(token);
    }
    debug!("lex completed, {} tokens total", tokens.len());
    Ok(tokens)
}

fn payload(
    bytes: &mut impl Iterator<Item = u8>,
    after: char,
) -> Result<u8, LexError> {
    match bytes.next() {
        None => Err(LexError::UnexpectedEof(after)),
        Some(b) if is_printable(b) || b == b'\n' => Ok(b),
        Some(b) => Err(LexError::Unprintable(b)),
    }
}
