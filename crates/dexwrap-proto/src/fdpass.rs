// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `SCM_RIGHTS` descriptor passing
//!
//! The descriptor and its payload go out in a single `sendmsg` call so the
//! peer observes both in one receive. Peers read the payload right after
//! taking the descriptor and must not expect anything else on the stream.

use libc::{CMSG_DATA, CMSG_FIRSTHDR, CMSG_LEN, CMSG_SPACE, c_void, cmsghdr, iovec, msghdr};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Send `payload` with `fd` attached as ancillary data.
///
/// With `fd == None` the payload is sent alone. Returns the number of
/// payload bytes written.
pub fn send_with_fd(
    socket: BorrowedFd<'_>,
    fd: Option<BorrowedFd<'_>>,
    payload: &[u8],
) -> io::Result<usize> {
    let mut iov = iovec {
        iov_base: payload.as_ptr() as *mut c_void,
        iov_len: payload.len(),
    };

    let cmsg_space = unsafe { CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(fd) = fd {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cmsg_space as _;

        // SAFETY: msg_control points at a buffer sized with CMSG_SPACE for one fd,
        // so CMSG_FIRSTHDR is non-null and CMSG_DATA has room for one RawFd.
        unsafe {
            let cmsg: *mut cmsghdr = CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::other("failed to get control message header"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            std::ptr::write_unaligned(CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
        }
    }

    // SAFETY: msg references iov and cmsg_buf, both alive for the call.
    let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Receive into `payload`, taking ownership of an attached descriptor if any.
pub fn recv_with_fd(
    socket: BorrowedFd<'_>,
    payload: &mut [u8],
) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = iovec {
        iov_base: payload.as_mut_ptr() as *mut c_void,
        iov_len: payload.len(),
    };

    let cmsg_space = unsafe { CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg is fully initialized with valid iov and cmsg buffers.
    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fd = None;
    // SAFETY: the kernel filled msg_control; CMSG_FIRSTHDR returns null when
    // no control message was delivered.
    unsafe {
        let cmsg: *const cmsghdr = CMSG_FIRSTHDR(&msg);
        if !cmsg.is_null()
            && (*cmsg).cmsg_level == libc::SOL_SOCKET
            && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            && (*cmsg).cmsg_len as usize >= CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize
        {
            let raw = std::ptr::read_unaligned(CMSG_DATA(cmsg) as *const RawFd);
            if raw >= 0 {
                fd = Some(OwnedFd::from_raw_fd(raw));
            }
        }
    }

    Ok((received as usize, fd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn descriptor_and_payload_arrive_together() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        let mut file = tempfile::tempfile().expect("tempfile");
        file.write_all(b"hook").expect("write");

        let sent = send_with_fd(left.as_fd(), Some(file.as_fd()), &1i32.to_le_bytes())
            .expect("send");
        assert_eq!(sent, 4);

        let mut payload = [0u8; 4];
        let (n, fd) = recv_with_fd(right.as_fd(), &mut payload).expect("recv");
        assert_eq!(n, 4);
        assert_eq!(i32::from_le_bytes(payload), 1);

        let mut received = std::fs::File::from(fd.expect("descriptor attached"));
        received.seek(SeekFrom::Start(0)).expect("seek");
        let mut contents = String::new();
        received.read_to_string(&mut contents).expect("read");
        assert_eq!(contents, "hook");
    }

    #[test]
    fn payload_without_descriptor() {
        let (left, right) = UnixStream::pair().expect("socketpair");
        send_with_fd(left.as_fd(), None, &1i32.to_le_bytes()).expect("send");

        let mut payload = [0u8; 4];
        let (n, fd) = recv_with_fd(right.as_fd(), &mut payload).expect("recv");
        assert_eq!(n, 4);
        assert!(fd.is_none());
    }
}
