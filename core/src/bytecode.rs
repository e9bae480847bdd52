//! Bytecode files.
//!
//! On-disk layout, multi-byte integers big-endian:
//!
//! ```text
//! magic            : u8 = 0xDC
//! ver_major        : u8
//! ver_minor        : u8
//! prog_header_size : u8 = 8
//! text_size        : u32    bytes of .text (8 per instruction)
//! rodata_size      : u32    bytes of .rodata
//! .text            : text_size bytes
//! .rodata          : rodata_size bytes, NUL-terminated strings
//! ```
//!
//! Arbitrary bytes may precede the magic byte, so a shebang line can make a
//! bytecode file directly executable; the loader scans forward to the first
//! `0xDC`.

use std::fmt;
use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::vm::instruction::Instruction;

pub const MAGIC: u8 = 0xDC;
pub const VER_MAJOR: u8 = 0;
pub const VER_MINOR: u8 = 0;
pub const PROG_HEADER_SIZE: u8 = 8;

/// Size of one encoded instruction.
pub const INS_SIZE: usize = 8;

/// A loaded (or freshly generated) program: decoded `.text` plus `.rodata`.
#[derive(Clone, PartialEq, Eq)]
pub struct Program {
    pub text: Vec<Instruction>,
    pub rodata: Vec<u8>,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Program {{")?;
        writeln!(f, "  text:")?;
        for (addr, ins) in self.text.iter().enumerate() {
            writeln!(f, "    {addr:4}  {ins:?}")?;
        }
        if !self.rodata.is_empty() {
            writeln!(f, "  rodata: {:?}", String::from_utf8_lossy(&self.rodata))?;
        }
        write!(f, "}}")
    }
}

/// Header facts reported by `u6a -i`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Info {
    pub ver_major: u8,
    pub ver_minor: u8,
    pub prog_header_size: u8,
    /// `(text_size, rodata_size)` in bytes; present when the program header
    /// is large enough to carry them.
    pub sizes: Option<(u32, u32)>,
}

impl Info {
    pub fn version_matches(&self) -> bool {
        self.ver_major == VER_MAJOR && self.ver_minor == VER_MINOR
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not a valid Unlambda bytecode file")]
    InvalidFile,
    #[error("bytecode file version {major}.{minor} is not compatible")]
    BadVersion { major: u8, minor: u8 },
    #[error(transparent)]
    Io(io::Error),
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), LoadError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            LoadError::InvalidFile
        } else {
            LoadError::Io(e)
        }
    })
}

fn scan_magic(r: &mut impl Read) -> Result<(), LoadError> {
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => return Err(LoadError::InvalidFile),
            Ok(_) if byte[0] == MAGIC => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(LoadError::Io(e)),
        }
    }
}

/// Reads the file and program headers, consuming exactly the bytes they
/// occupy so the sections can be read next.
pub fn read_info(r: &mut impl Read) -> Result<Info, LoadError> {
    scan_magic(r)?;
    let mut head = [0u8; 3];
    read_exact(r, &mut head)?;
    let [ver_major, ver_minor, prog_header_size] = head;
    let mut prog = vec![0u8; prog_header_size as usize];
    read_exact(r, &mut prog)?;
    let sizes = if prog_header_size >= PROG_HEADER_SIZE {
        let text = u32::from_be_bytes([prog[0], prog[1], prog[2], prog[3]]);
        let rodata = u32::from_be_bytes([prog[4], prog[5], prog[6], prog[7]]);
        Some((text, rodata))
    } else {
        None
    };
    Ok(Info {
        ver_major,
        ver_minor,
        prog_header_size,
        sizes,
    })
}

/// Loads a program. Exactly the framed bytes are consumed from `r`; when the
/// bytecode arrives on stdin, whatever follows is still available as the
/// program's input.
///
/// `force` tolerates version mismatches and oversized program headers; a
/// missing magic byte is fatal regardless.
pub fn load(r: &mut impl Read, force: bool) -> Result<Program, LoadError> {
    let info = read_info(r)?;
    if !info.version_matches() && !(force && info.prog_header_size == PROG_HEADER_SIZE) {
        return Err(LoadError::BadVersion {
            major: info.ver_major,
            minor: info.ver_minor,
        });
    }
    if info.prog_header_size != PROG_HEADER_SIZE
        && !(force && info.prog_header_size > PROG_HEADER_SIZE)
    {
        return Err(LoadError::InvalidFile);
    }
    let (text_size, rodata_size) = info.sizes.ok_or(LoadError::InvalidFile)?;
    if text_size as usize % INS_SIZE != 0 {
        return Err(LoadError::InvalidFile);
    }

    let mut text = Vec::with_capacity(text_size as usize / INS_SIZE);
    let mut bytes = [0u8; INS_SIZE];
    for _ in 0..text_size as usize / INS_SIZE {
        read_exact(r, &mut bytes)?;
        text.push(Instruction::decode(bytes));
    }
    let mut rodata = vec![0u8; rodata_size as usize];
    read_exact(r, &mut rodata)?;

    debug!(
        "load completed, text: {} instructions, rodata: {} bytes",
        text.len(),
        rodata.len()
    );
    Ok(Program { text, rodata })
}

/// Writes a program in the on-disk format.
pub fn write(w: &mut impl Write, program: &Program) -> io::Result<()> {
    w.write_all(&[MAGIC, VER_MAJOR, VER_MINOR, PROG_HEADER_SIZE])?;
    w.write_all(&((program.text.len() * INS_SIZE) as u32).to_be_bytes())?;
    w.write_all(&(program.rodata.len() as u32).to_be_bytes())?;
    for ins in &program.text {
        w.write_all(&ins.encode())?;
    }
    w.write_all(&program.rodata)?;
    Ok(())
}
