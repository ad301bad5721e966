//! Listener file-descriptor transfer (`_getsocks`).
//!
//! During a seamless reload the new process retrieves every bound
//! listener socket from the old one over a unix-domain socket, using
//! `SCM_RIGHTS` ancillary data. Descriptors travel in batches; each batch
//! carries a data payload describing the sockets (namespace, interface,
//! listener options) so the receiver can rebind them identically. The
//! receiver acknowledges each batch with one byte; a missing ack aborts
//! the transfer.

use std::convert::TryInto;
use std::io;
use std::os::unix::io::RawFd;

/// At most this many descriptors travel in one `sendmsg` batch.
pub const MAX_SEND_FD: usize = 253;

/// Per-listener description shipped alongside its descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDesc {
    pub namespace: Option<Vec<u8>>,
    pub ifname: Option<Vec<u8>>,
    pub options: u32,
}

/// Renders the payload header for one batch: the total descriptor count
/// first (before the first batch only), then one record per descriptor.
pub fn encode_batch_payload(
    total: Option<u32>,
    descs: &[ListenerDesc],
    out: &mut Vec<u8>,
) {
    if let Some(total) = total {
        out.extend_from_slice(&total.to_ne_bytes());
    }
    for d in descs {
        let ns = d.namespace.as_deref().unwrap_or(&[]);
        out.push(ns.len() as u8);
        out.extend_from_slice(ns);
        let ifname = d.ifname.as_deref().unwrap_or(&[]);
        out.push(ifname.len() as u8);
        out.extend_from_slice(ifname);
        out.extend_from_slice(&d.options.to_ne_bytes());
    }
}

/// Parses one batch payload; `expect_total` is true for the first batch.
pub fn decode_batch_payload(
    mut buf: &[u8],
    expect_total: bool,
    nfds: usize,
) -> io::Result<(Option<u32>, Vec<ListenerDesc>)> {
    let short = || io::Error::new(io::ErrorKind::UnexpectedEof, "short fd payload");
    let total = if expect_total {
        if buf.len() < 4 {
            return Err(short());
        }
        let (head, tail) = buf.split_at(4);
        buf = tail;
        Some(u32::from_ne_bytes(head.try_into().expect("4 bytes")))
    } else {
        None
    };
    let mut descs = Vec::with_capacity(nfds);
    for _ in 0..nfds {
        let ns_len = *buf.first().ok_or_else(short)? as usize;
        buf = &buf[1..];
        if buf.len() < ns_len {
            return Err(short());
        }
        let (ns, tail) = buf.split_at(ns_len);
        buf = tail;
        let if_len = *buf.first().ok_or_else(short)? as usize;
        buf = &buf[1..];
        if buf.len() < if_len {
            return Err(short());
        }
        let (ifname, tail) = buf.split_at(if_len);
        buf = tail;
        if tail.len() < 4 {
            return Err(short());
        }
        let (opt, tail) = buf.split_at(4);
        buf = tail;
        descs.push(ListenerDesc {
            namespace: if ns_len > 0 { Some(ns.to_vec()) } else { None },
            ifname: if if_len > 0 { Some(ifname.to_vec()) } else { None },
            options: u32::from_ne_bytes(opt.try_into().expect("4 bytes")),
        });
    }
    Ok((total, descs))
}

/// Sends one batch of descriptors with its payload over `sock` using
/// `SCM_RIGHTS`.
pub fn send_fd_batch(sock: RawFd, fds: &[RawFd], payload: &[u8]) -> io::Result<()> {
    assert!(fds.len() <= MAX_SEND_FD);
    let fd_bytes = std::mem::size_of_val(fds);
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as usize;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr() as *const u8,
            libc::CMSG_DATA(cmsg),
            fd_bytes,
        );
    }

    loop {
        let rc = unsafe { libc::sendmsg(sock, &msg, 0) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sends every listener descriptor in `MAX_SEND_FD`-sized batches and
/// waits for a one-byte ack after each. An ack failure aborts.
pub fn send_all_listeners(
    sock: RawFd,
    listeners: &[(RawFd, ListenerDesc)],
    wait_ack: &mut dyn FnMut() -> io::Result<()>,
) -> io::Result<()> {
    let mut first = true;
    for batch in listeners.chunks(MAX_SEND_FD) {
        let fds: Vec<RawFd> = batch.iter().map(|(fd, _)| *fd).collect();
        let descs: Vec<ListenerDesc> = batch.iter().map(|(_, d)| d.clone()).collect();
        let mut payload = Vec::new();
        let total = if first {
            Some(listeners.len() as u32)
        } else {
            None
        };
        encode_batch_payload(total, &descs, &mut payload);
        send_fd_batch(sock, &fds, &payload)?;
        wait_ack()?;
        first = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let descs = vec![
            ListenerDesc {
                namespace: None,
                ifname: Some(b"eth0".to_vec()),
                options: 0x5,
            },
            ListenerDesc {
                namespace: Some(b"blue".to_vec()),
                ifname: None,
                options: 0,
            },
        ];
        let mut buf = Vec::new();
        encode_batch_payload(Some(7), &descs, &mut buf);
        let (total, decoded) = decode_batch_payload(&buf, true, 2).unwrap();
        assert_eq!(total, Some(7));
        assert_eq!(decoded, descs);
    }

    #[test]
    fn later_batches_omit_the_total() {
        let descs = vec![ListenerDesc {
            namespace: None,
            ifname: None,
            options: 1,
        }];
        let mut buf = Vec::new();
        encode_batch_payload(None, &descs, &mut buf);
        let (total, decoded) = decode_batch_payload(&buf, false, 1).unwrap();
        assert_eq!(total, None);
        assert_eq!(decoded, descs);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let descs = vec![ListenerDesc {
            namespace: Some(b"ns".to_vec()),
            ifname: None,
            options: 9,
        }];
        let mut buf = Vec::new();
        encode_batch_payload(Some(1), &descs, &mut buf);
        for cut in 0..buf.len() {
            assert!(decode_batch_payload(&buf[..cut], true, 1).is_err());
        }
    }

    #[test]
    fn fd_transfer_over_a_socketpair() {
        use std::io::{Read, Write};
        use std::os::unix::io::{AsRawFd, FromRawFd};
        use std::os::unix::net::UnixStream;

        let (a, b) = UnixStream::pair().unwrap();
        let (r, w) = nix_pipe();
        let desc = ListenerDesc {
            namespace: None,
            ifname: None,
            options: 42,
        };
        let mut payload = Vec::new();
        encode_batch_payload(Some(1), &[desc], &mut payload);
        send_fd_batch(a.as_raw_fd(), &[r], &payload).unwrap();

        // receive on the other end
        let mut data_buf = vec![0u8; payload.len()];
        let mut cmsg_buf = vec![0u8; unsafe { libc::CMSG_SPACE(4) } as usize];
        let mut iov = libc::iovec {
            iov_base: data_buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: data_buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();
        let n = unsafe { libc::recvmsg(b.as_raw_fd(), &mut msg, 0) };
        assert_eq!(n as usize, payload.len());
        let received_fd = unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            assert_eq!((*cmsg).cmsg_type, libc::SCM_RIGHTS);
            let mut fd: RawFd = -1;
            std::ptr::copy_nonoverlapping(libc::CMSG_DATA(cmsg), &mut fd as *mut _ as *mut u8, 4);
            fd
        };
        assert!(received_fd >= 0);

        // prove the descriptor still works: write into the original
        // pipe, read from the received copy
        let mut wfile = unsafe { std::fs::File::from_raw_fd(w) };
        wfile.write_all(b"ok").unwrap();
        drop(wfile);
        let mut rfile = unsafe { std::fs::File::from_raw_fd(received_fd) };
        let mut got = String::new();
        rfile.read_to_string(&mut got).unwrap();
        assert_eq!(got, "ok");
        unsafe { libc::close(r) };
    }

    fn nix_pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }
}
