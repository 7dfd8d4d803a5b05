//! The per-connection state machine: handshake, request decode, dispatch
//! to the [`TierManager`], reply encode, descriptor ancillary send,
//! graceful close.

use crate::{
    error::Error,
    index::PolicyFlags,
    manager::{ManagerError, TierManager},
    protocol::{self, Capabilities, RequestFlags, StatusCode},
    uri::Uri,
};
use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use std::{
    collections::BTreeSet,
    io::{self, BufRead, BufReader, IoSlice, Read},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::UnixStream,
    },
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub max_uri_len: usize,
    pub idle_timeout: Option<Duration>,
    pub server_caps: Capabilities,
    pub max_pipeline: u16,
    pub backend_parallelism: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_uri_len: crate::uri::MAX_URI_LEN,
            idle_timeout: Some(Duration::from_secs(300)),
            server_caps: Capabilities::OOO_REPLIES | Capabilities::PIPELINING,
            max_pipeline: 32,
            backend_parallelism: std::thread::available_parallelism()
                .map(|n| n.get() as u8)
                .unwrap_or(1),
        }
    }
}

/// Drives one accepted connection end to end. Stateless across
/// connections beyond the shared manager reference.
pub struct Engine {
    manager: Arc<TierManager>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(manager: Arc<TierManager>, config: EngineConfig) -> Self {
        Self { manager, config }
    }

    pub fn run(&self, stream: UnixStream) -> io::Result<()> {
        if let Some(timeout) = self.config.idle_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        let raw_fd = stream.as_raw_fd();
        let mut reader = BufReader::new(stream);

        let result = match self.handshake(&mut reader)? {
            Some(hello) => {
                debug!(caps = hello.caps.bits(), max_pipeline = hello.max_pipeline, "v2 handshake");
                self.run_v2(&mut reader, raw_fd, hello)
            }
            None => self.run_v1(&mut reader, raw_fd),
        };
        if let Err(ref e) = result {
            warn!(error = %e, "connection terminated");
        }
        result
    }

    /// Peeks the first 4 bytes without consuming them (`BufReader`'s
    /// internal buffer makes this safe to do before deciding whether to
    /// consume a full HELLO frame or leave the bytes as v1 request data).
    fn handshake(&self, reader: &mut BufReader<UnixStream>) -> io::Result<Option<protocol::Hello>> {
        let peeked = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        if peeked.len() >= 4 && peeked[0..4] == protocol::MAGIC {
            let mut buf = [0u8; 9];
            reader.read_exact(&mut buf)?;
            let hello = protocol::decode_hello(&buf).map_err(to_io_error)?;
            Ok(Some(hello))
        } else {
            Ok(None)
        }
    }

    // ---------------------------------------------------------------
    // v1: strictly ordered, one request in flight at a time.
    // ---------------------------------------------------------------

    fn run_v1(&self, reader: &mut BufReader<UnixStream>, raw_fd: RawFd) -> io::Result<()> {
        loop {
            let mut header = [0u8; 3];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            let (mode, uri_len) = protocol::decode_v1_request_header(&header);
            let mut uri_bytes = vec![0u8; uri_len as usize];
            reader.read_exact(&mut uri_bytes)?;

            let reply = self.dispatch(mode, &uri_bytes);
            self.send_v1_reply(raw_fd, reply)?;
        }
    }

    fn send_v1_reply(&self, raw_fd: RawFd, reply: DispatchReply) -> io::Result<()> {
        let metadata = reply.metadata.clone();
        let header = protocol::encode_v1_response_header(
            reply.status,
            reply.content_len,
            metadata.len() as u16,
        );
        let mut payload = Vec::with_capacity(header.len() + metadata.len());
        payload.extend_from_slice(&header);
        payload.extend_from_slice(&metadata);
        send_payload(raw_fd, &payload, reply.fd)
    }

    // ---------------------------------------------------------------
    // v2: pipelined, optionally out-of-order.
    // ---------------------------------------------------------------

    fn run_v2(
        &self,
        reader: &mut BufReader<UnixStream>,
        raw_fd: RawFd,
        hello: protocol::Hello,
    ) -> io::Result<()> {
        let negotiated_caps = self.config.server_caps & hello.caps;
        let max_pipeline = hello.max_pipeline.min(self.config.max_pipeline).max(1);
        let ooo_active = negotiated_caps.contains(Capabilities::OOO_REPLIES);

        let ack = protocol::HelloAck {
            version: protocol::PROTOCOL_VERSION,
            negotiated_caps,
            max_pipeline,
            backend_parallelism: self.config.backend_parallelism,
        };
        {
            let bytes = protocol::encode_hello_ack(&ack);
            send_payload(raw_fd, &bytes, None)?;
        }

        let write_lock = Arc::new(Mutex::new(()));
        let ordering = Arc::new(Ordering::default());
        let inflight = Arc::new((Mutex::new(0u32), Condvar::new()));
        let manager = self.manager.clone();

        let mut seq: u32 = 0;
        std::thread::scope(|scope| -> io::Result<()> {
            loop {
                let mut type_byte = [0u8; 1];
                match reader.read_exact(&mut type_byte) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e),
                };

                match type_byte[0] {
                    protocol::MSG_REQUEST => {
                        let mut rest = [0u8; 8];
                        reader.read_exact(&mut rest)?;
                        let mut full = [0u8; 9];
                        full[0] = type_byte[0];
                        full[1..].copy_from_slice(&rest);
                        let header = protocol::decode_v2_request_header(&full);

                        let mut uri_bytes = vec![0u8; header.uri_len as usize];
                        reader.read_exact(&mut uri_bytes)?;

                        wait_for_slot(&inflight, max_pipeline as u32);
                        ordering.mark_arrived(seq);
                        let my_seq = seq;
                        seq += 1;

                        let manager = manager.clone();
                        let write_lock = write_lock.clone();
                        let ordering = ordering.clone();
                        let inflight = inflight.clone();
                        let engine_config = self.config;
                        let request_id = header.request_id;
                        let flags = header.flags;
                        let mode = header.mode;

                        scope.spawn(move || {
                            let reply = dispatch_static(&manager, engine_config, mode, flags, &uri_bytes);
                            let ordered = flags.contains(RequestFlags::ORDERED);
                            ordering.wait_until_ready(my_seq, ordered, ooo_active);

                            let metadata = reply.metadata.clone();
                            let header = protocol::encode_v2_response_header(
                                request_id,
                                reply.status,
                                reply.content_len,
                                metadata.len() as u16,
                            );
                            let mut payload = Vec::with_capacity(header.len() + metadata.len());
                            payload.extend_from_slice(&header);
                            payload.extend_from_slice(&metadata);

                            {
                                let _guard = write_lock.lock().unwrap();
                                let _ = send_payload(raw_fd, &payload, reply.fd);
                            }
                            ordering.mark_emitted(my_seq);
                            release_slot(&inflight);
                        });
                    }
                    protocol::MSG_CLOSE => {
                        let mut rest = [0u8; 1];
                        reader.read_exact(&mut rest)?;
                        wait_for_drain(&inflight);
                        let outstanding = 0u32;
                        let bytes = protocol::encode_close_ack(outstanding);
                        let _guard = write_lock.lock().unwrap();
                        send_payload(raw_fd, &bytes, None)?;
                        return Ok(());
                    }
                    other => {
                        return Err(to_io_error(protocol::ProtocolError::UnexpectedMessageType(
                            other,
                        )));
                    }
                }
            }
            wait_for_drain(&inflight);
            Ok(())
        })
    }

    fn dispatch(&self, mode: u8, uri_bytes: &[u8]) -> DispatchReply {
        // v1 has no flags byte on the wire; every v1 PUT is persistent.
        dispatch_static(&self.manager, self.config, mode, RequestFlags::empty(), uri_bytes)
    }
}

/// Free function so it can be called from a spawned thread without
/// borrowing `&Engine` across the thread boundary.
fn dispatch_static(
    manager: &TierManager,
    config: EngineConfig,
    mode: u8,
    flags: RequestFlags,
    uri_bytes: &[u8],
) -> DispatchReply {
    let uri_str = match std::str::from_utf8(uri_bytes) {
        Ok(s) => s,
        Err(_) => return DispatchReply::status(StatusCode::InvalidRequest),
    };

    if uri_bytes.len() > config.max_uri_len {
        return DispatchReply::status(StatusCode::UriTooLong);
    }
    if mode != protocol::MODE_FD_PASS {
        return DispatchReply::status(match mode {
            b'2' | b'3' => StatusCode::UnsupportedOp,
            _ => StatusCode::InvalidMode,
        });
    }
    let uri = match Uri::parse(uri_str) {
        Ok(u) => u,
        Err(_) => return DispatchReply::status(StatusCode::InvalidRequest),
    };

    if let Some(target) = uri.strip_delete_prefix() {
        return match manager.delete(target) {
            Ok(()) => DispatchReply {
                status: StatusCode::Ok,
                content_len: 1,
                metadata: Vec::new(),
                fd: None,
            },
            Err(Error::Manager(ManagerError::NotFound(_))) => DispatchReply::status(StatusCode::NotFound),
            Err(e) => DispatchReply::status(status_for_error(&e)),
        };
    }

    match manager.lookup(uri.as_str()) {
        Ok((_entry, borrow)) => success_reply(borrow),
        Err(Error::Manager(ManagerError::NotFound(_))) => {
            // `EPHEMERAL` selects the ephemeral placement policy for an
            // implicit PUT; nothing else reads this flag.
            let policy = if flags.contains(RequestFlags::EPHEMERAL) {
                PolicyFlags::EPHEMERAL
            } else {
                PolicyFlags::empty()
            };
            match manager.create(uri.as_str(), policy, 0) {
                Ok((_entry, borrow)) => success_reply(borrow),
                Err(e) => DispatchReply::status(status_for_error(&e)),
            }
        }
        Err(e) => DispatchReply::status(status_for_error(&e)),
    }
}

fn success_reply(borrow: crate::dref::BorrowHandle) -> DispatchReply {
    DispatchReply {
        status: StatusCode::Ok,
        content_len: 0,
        metadata: Vec::new(),
        fd: Some(borrow),
    }
}

fn status_for_error(error: &Error) -> StatusCode {
    match error {
        Error::Manager(e) => status_for_manager_error(e),
        Error::Protocol(_) => StatusCode::ProtocolError,
        Error::Tier(crate::tier::TierError::NoSpace(_)) => StatusCode::StorageError,
        Error::Tier(crate::tier::TierError::NotFound(_)) => StatusCode::NotFound,
        Error::Tier(crate::tier::TierError::Io(_)) => StatusCode::StorageError,
        Error::Config(_) => StatusCode::InternalError,
        Error::Io(_) => StatusCode::InternalError,
    }
}

fn status_for_manager_error(error: &ManagerError) -> StatusCode {
    match error {
        ManagerError::NotFound(_) => StatusCode::NotFound,
        ManagerError::Uri(_) => StatusCode::InvalidRequest,
        ManagerError::Index(_) => StatusCode::InternalError,
        ManagerError::Tier(crate::tier::TierError::NoSpace(_)) => StatusCode::StorageError,
        ManagerError::Tier(crate::tier::TierError::NotFound(_)) => StatusCode::NotFound,
        ManagerError::Tier(crate::tier::TierError::Io(_)) => StatusCode::StorageError,
        ManagerError::DRef(_) => StatusCode::InternalError,
        ManagerError::EphemeralPolicyViolation => StatusCode::InvalidRequest,
        ManagerError::AllTiersExhausted => StatusCode::StorageError,
        ManagerError::DescriptorBudgetExceeded => StatusCode::InternalError,
    }
}

struct DispatchReply {
    status: StatusCode,
    content_len: u64,
    metadata: Vec<u8>,
    fd: Option<crate::dref::BorrowHandle>,
}

impl DispatchReply {
    fn status(status: StatusCode) -> Self {
        Self {
            status,
            content_len: 1,
            metadata: Vec::new(),
            fd: None,
        }
    }
}

fn send_payload(raw_fd: RawFd, payload: &[u8], fd: Option<crate::dref::BorrowHandle>) -> io::Result<()> {
    match fd {
        Some(handle) => {
            let iov = [IoSlice::new(payload)];
            let fds = [handle.as_raw_fd()];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(raw_fd, &iov, &cmsg, MsgFlags::empty(), None).map_err(nix_to_io)?;
            // the borrow is dropped here, after the send syscall returns,
            // releasing it back to the DRef regardless of outcome above.
            Ok(())
        }
        None => write_all_raw(raw_fd, payload),
    }
}

/// Writes the full buffer to a borrowed raw fd without taking ownership
/// of it (the `UnixStream` living in the engine keeps owning the fd).
fn write_all_raw(raw_fd: RawFd, mut payload: &[u8]) -> io::Result<()> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(raw_fd) };
    while !payload.is_empty() {
        let n = nix::unistd::write(borrowed, payload).map_err(nix_to_io)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
        }
        payload = &payload[n..];
    }
    Ok(())
}

fn nix_to_io(errno: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

fn wait_for_slot(inflight: &(Mutex<u32>, Condvar), max: u32) {
    let (lock, cv) = inflight;
    let mut count = lock.lock().unwrap();
    while *count >= max {
        count = cv.wait(count).unwrap();
    }
    *count += 1;
}

fn release_slot(inflight: &(Mutex<u32>, Condvar)) {
    let (lock, cv) = inflight;
    let mut count = lock.lock().unwrap();
    *count = count.saturating_sub(1);
    cv.notify_all();
}

fn wait_for_drain(inflight: &(Mutex<u32>, Condvar)) {
    let (lock, cv) = inflight;
    let mut count = lock.lock().unwrap();
    while *count > 0 {
        count = cv.wait(count).unwrap();
    }
}

/// Tracks which pipelined replies (by arrival sequence) have not yet been
/// written to the client, so an `ORDERED` reply can wait for everything
/// that arrived before it without serializing replies that don't ask for it.
#[derive(Default)]
struct Ordering {
    unacked: Mutex<BTreeSet<u32>>,
    cv: Condvar,
}

impl Ordering {
    fn mark_arrived(&self, seq: u32) {
        self.unacked.lock().unwrap().insert(seq);
    }

    fn wait_until_ready(&self, seq: u32, ordered: bool, ooo_active: bool) {
        if !ordered && ooo_active {
            return;
        }
        let mut guard = self.unacked.lock().unwrap();
        while guard.iter().next().is_some_and(|&min| min < seq) {
            guard = self.cv.wait(guard).unwrap();
        }
    }

    fn mark_emitted(&self, seq: u32) {
        let mut guard = self.unacked.lock().unwrap();
        guard.remove(&seq);
        self.cv.notify_all();
    }
}

fn to_io_error(e: protocol::ProtocolError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
