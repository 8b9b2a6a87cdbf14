// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Number of descriptor slots the daemon serves.
pub const SLOT_COUNT: i32 = 6;

/// Upper bound for the process name payload of [`Opcode::ClassifyProcess`].
pub const MAX_PROCESS_NAME_LEN: i32 = 1024;

/// Payload accompanying every released descriptor.
pub const ACK: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    ReleaseDescriptor = 1,
    ClassifyProcess = 2,
}

impl Opcode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Opcode::ReleaseDescriptor),
            2 => Some(Opcode::ClassifyProcess),
            _ => None,
        }
    }

    pub fn as_code(self) -> i32 {
        self as i32
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// Hand over the pre-opened descriptor stored in `slot` (`0..SLOT_COUNT`).
    ReleaseDescriptor { slot: u8 },
    /// Ask whether `process_name` is excluded from injection.
    ClassifyProcess { process_name: String },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::ReleaseDescriptor { .. } => Opcode::ReleaseDescriptor,
            Request::ClassifyProcess { .. } => Opcode::ClassifyProcess,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Verdict {
    Allowed = 0,
    Denied = 1,
}

impl Verdict {
    pub fn from_denied(denied: bool) -> Self {
        if denied { Verdict::Denied } else { Verdict::Allowed }
    }

    pub fn is_denied(self) -> bool {
        self == Verdict::Denied
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        (self as i32).to_le_bytes()
    }
}

/// Reasons a request is rejected. None of these produce a response frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("truncated {field}: expected {expected} bytes, read {read}")]
    Truncated {
        field: &'static str,
        expected: usize,
        read: usize,
    },

    #[error("unknown operation code {0}")]
    UnknownOpcode(i32),

    #[error("descriptor slot {0} out of range")]
    SlotOutOfRange(i32),

    #[error("process name length {0} out of range")]
    NameLengthOutOfRange(i32),

    #[error("empty process name despite reported length {0}")]
    EmptyProcessName(i32),
}

/// Read bytes until `buf` is full or the peer stops sending.
///
/// Returns how many bytes were read, which is less than `buf.len()` only on EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_i32<R>(reader: &mut R, field: &'static str) -> Result<i32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 4];
    let read = read_full(reader, &mut bytes).await?;
    if read != bytes.len() {
        return Err(ProtocolError::Truncated {
            field,
            expected: bytes.len(),
            read,
        });
    }
    Ok(i32::from_le_bytes(bytes))
}

/// Decode one request from `reader`, enforcing every framing rule.
pub async fn read_request<R>(reader: &mut R) -> Result<Request, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let code = read_i32(reader, "opcode").await?;
    match Opcode::from_code(code) {
        Some(Opcode::ReleaseDescriptor) => {
            let slot = read_i32(reader, "slot").await?;
            if !(0..SLOT_COUNT).contains(&slot) {
                return Err(ProtocolError::SlotOutOfRange(slot));
            }
            Ok(Request::ReleaseDescriptor { slot: slot as u8 })
        }
        Some(Opcode::ClassifyProcess) => {
            let len = read_i32(reader, "process name length").await?;
            if !(0..=MAX_PROCESS_NAME_LEN).contains(&len) {
                return Err(ProtocolError::NameLengthOutOfRange(len));
            }

            let mut name = vec![0u8; len as usize];
            let read = read_full(reader, &mut name).await?;
            if read != name.len() {
                return Err(ProtocolError::Truncated {
                    field: "process name",
                    expected: name.len(),
                    read,
                });
            }

            // C clients may include the terminator
            while name.last() == Some(&0) {
                name.pop();
            }
            if name.is_empty() && len > 0 {
                return Err(ProtocolError::EmptyProcessName(len));
            }

            Ok(Request::ClassifyProcess {
                process_name: String::from_utf8_lossy(&name).into_owned(),
            })
        }
        None => Err(ProtocolError::UnknownOpcode(code)),
    }
}

pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&request.opcode().as_code().to_le_bytes());
    match request {
        Request::ReleaseDescriptor { slot } => {
            out.extend_from_slice(&i32::from(*slot).to_le_bytes());
        }
        Request::ClassifyProcess { process_name } => {
            let name = process_name.as_bytes();
            out.extend_from_slice(&(name.len() as i32).to_le_bytes());
            out.extend_from_slice(name);
        }
    }
    out
}
