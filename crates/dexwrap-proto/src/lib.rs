// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! dexwrap wire protocol
//!
//! Clients spawned during compilation talk to the daemon over a local
//! stream socket using fixed-width little-endian integers:
//!
//! ```text
//! request  := i32 opcode, payload
//! op 1     := i32 slot                      -> SCM_RIGHTS fd + i32 ack (= 1)
//! op 2     := i32 len (0..=1024), len bytes -> i32 verdict (1 denied, 0 allowed)
//! ```
//!
//! There is no error frame. A malformed request is answered by closing the
//! connection without writing anything.

pub mod client;
pub mod fdpass;
pub mod messages;

pub use client::{DEFAULT_SOCKET_PATH, DaemonClient, ReleasedDescriptor};
pub use messages::{
    ACK, MAX_PROCESS_NAME_LEN, Opcode, ProtocolError, Request, SLOT_COUNT, Verdict,
    encode_request, read_request,
};
