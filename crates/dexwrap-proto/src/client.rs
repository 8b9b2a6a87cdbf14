// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Blocking client for the dexwrap daemon socket

use crate::fdpass::recv_with_fd;
use crate::messages::{ProtocolError, Request, Verdict, encode_request};
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

pub const DEFAULT_SOCKET_PATH: &str = "/dev/socket/dexwrap";

/// Result of a descriptor release: the descriptor (absent when the daemon
/// never opened that slot) and the acknowledgement that carried it.
#[derive(Debug)]
pub struct ReleasedDescriptor {
    pub fd: Option<OwnedFd>,
    pub ack: i32,
}

#[derive(Clone, Debug)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn with_socket_path(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect(&self, request: &Request) -> Result<UnixStream, ProtocolError> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.write_all(&encode_request(request))?;
        stream.flush()?;
        Ok(stream)
    }

    pub fn release_descriptor(&self, slot: u8) -> Result<ReleasedDescriptor, ProtocolError> {
        let stream = self.connect(&Request::ReleaseDescriptor { slot })?;

        let mut ack = [0u8; 4];
        let (mut read, fd) = recv_with_fd(stream.as_fd(), &mut ack)?;
        if read == 0 {
            return Err(ProtocolError::Truncated {
                field: "ack",
                expected: ack.len(),
                read,
            });
        }
        read += read_remaining(&stream, &mut ack[read..])?;
        if read != ack.len() {
            return Err(ProtocolError::Truncated {
                field: "ack",
                expected: ack.len(),
                read,
            });
        }

        Ok(ReleasedDescriptor {
            fd,
            ack: i32::from_le_bytes(ack),
        })
    }

    /// Returns `true` when the daemon reports `process_name` as denied.
    pub fn classify(&self, process_name: &str) -> Result<bool, ProtocolError> {
        let stream = self.connect(&Request::ClassifyProcess {
            process_name: process_name.to_string(),
        })?;

        let mut verdict = [0u8; 4];
        let read = read_remaining(&stream, &mut verdict)?;
        if read != verdict.len() {
            return Err(ProtocolError::Truncated {
                field: "verdict",
                expected: verdict.len(),
                read,
            });
        }

        Ok(i32::from_le_bytes(verdict) == Verdict::Denied as i32)
    }
}

fn read_remaining(mut stream: &UnixStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
