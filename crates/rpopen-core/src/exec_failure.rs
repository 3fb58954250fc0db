//! Wire format of the status channel.
//!
//! A forked child that fails before `exec` replaces its image writes one
//! record to the close-on-exec status pipe and exits. A successful exec
//! closes the pipe, so the parent reads EOF with zero bytes.
//!
//! Layout (big endian):
//!
//! ```text
//! +-------+-------------+----------------+--------------+
//! | stage | errno (i32) | detail_len u32 | detail bytes |
//! +-------+-------------+----------------+--------------+
//! ```
//!
//! The header is built on the stack by [`encode_header`] so the child can
//! report without allocating.

use std::fmt;
use std::io;

pub const HEADER_LEN: usize = 9;

/// Step of child setup that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecStage {
    Redirect = 1,
    SetGroup = 2,
    SetUser = 3,
    Chdir = 4,
    Exec = 5,
}

impl ExecStage {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ExecStage::Redirect),
            2 => Some(ExecStage::SetGroup),
            3 => Some(ExecStage::SetUser),
            4 => Some(ExecStage::Chdir),
            5 => Some(ExecStage::Exec),
            _ => None,
        }
    }
}

impl fmt::Display for ExecStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecStage::Redirect => "redirecting standard streams",
            ExecStage::SetGroup => "setgid",
            ExecStage::SetUser => "setuid",
            ExecStage::Chdir => "chdir",
            ExecStage::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Failure reported by a child that never became the target program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFailure {
    pub stage: ExecStage,
    pub errno: i32,
    pub detail: String,
}

/// The status channel carried bytes that are not a failure record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedRecord {
    pub len: usize,
}

pub fn encode_header(stage: ExecStage, errno: i32, detail_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = stage as u8;
    header[1..5].copy_from_slice(&errno.to_be_bytes());
    header[5..9].copy_from_slice(&detail_len.to_be_bytes());
    header
}

impl ExecFailure {
    pub fn new(stage: ExecStage, errno: i32, detail: impl Into<String>) -> Self {
        Self {
            stage,
            errno,
            detail: detail.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let detail = self.detail.as_bytes();
        let mut out = Vec::with_capacity(HEADER_LEN + detail.len());
        out.extend_from_slice(&encode_header(self.stage, self.errno, detail.len() as u32));
        out.extend_from_slice(detail);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedRecord> {
        let malformed = MalformedRecord { len: bytes.len() };
        if bytes.len() < HEADER_LEN {
            return Err(malformed);
        }
        let stage = ExecStage::from_byte(bytes[0]).ok_or(malformed)?;
        let errno = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let detail_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let detail = &bytes[HEADER_LEN..];
        if detail.len() != detail_len {
            return Err(malformed);
        }
        Ok(Self {
            stage,
            errno,
            detail: String::from_utf8_lossy(detail).into_owned(),
        })
    }

    pub fn os_error(&self) -> io::Error {
        io::Error::from_raw_os_error(self.errno)
    }
}

impl fmt::Display for ExecFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed for `{}`: {}",
            self.stage,
            self.detail,
            self.os_error()
        )
    }
}

impl std::error::Error for ExecFailure {}
