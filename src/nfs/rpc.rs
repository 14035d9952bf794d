//! ONC-RPC v2 client (RFC 5531) over TCP.
//!
//! The engine needs exactly one shape of RPC: fire a COMPOUND at the server
//! and get the reply body delivered to a callback. Calls are written on the
//! caller's thread under a stream lock; a per-connection service thread
//! reads record-marked replies and demultiplexes them by xid. Callbacks
//! therefore run on the service thread, which is also where slot release
//! happens.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::nfs::xdr::{Decoder, Encoder, XdrError};

pub const NFS4_PROGRAM: u32 = 100003;
pub const NFS_V4: u32 = 4;
pub const NFSPROC4_NULL: u32 = 0;
pub const NFSPROC4_COMPOUND: u32 = 1;

const RPC_VERS: u32 = 2;
const CALL: u32 = 0;
const AUTH_NONE: u32 = 0;
const AUTH_SYS: u32 = 1;
const LAST_FRAGMENT: u32 = 0x8000_0000;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rpc decode error: {0}")]
    Xdr(#[from] XdrError),
    #[error("rpc call denied by server (reply_stat {0})")]
    Denied(u32),
    #[error("rpc call not accepted (accept_stat {0})")]
    NotAccepted(u32),
    #[error("rpc connection is down")]
    Disconnected,
}

pub type RpcResult = Result<Vec<u8>, RpcError>;
pub type RpcCallback = Box<dyn FnOnce(RpcResult) + Send>;

/// The transport contract the NFS engine issues compounds through.
pub trait NfsRpc: Send + Sync {
    /// Send one COMPOUND. The callback fires exactly once, from the service
    /// context, with the procedure results; transport failures arrive
    /// through it as well.
    fn compound(&self, body: Vec<u8>, cb: RpcCallback);
}

pub struct RpcClient {
    writer: Mutex<TcpStream>,
    pending: Arc<Mutex<HashMap<u32, RpcCallback>>>,
    next_xid: AtomicU32,
    shutdown: Arc<AtomicBool>,
    service: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    /// Establish the TCP connection, start the reply service thread and
    /// verify the server answers the NULL procedure.
    pub fn connect<A: ToSocketAddrs>(addr: A, read_timeout: Option<Duration>) -> Result<RpcClient, RpcError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(read_timeout)?;

        let pending: Arc<Mutex<HashMap<u32, RpcCallback>>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = stream.try_clone()?;
        let service = std::thread::Builder::new()
            .name("dpfs-nfs-rpc".into())
            .spawn({
                let pending = pending.clone();
                let shutdown = shutdown.clone();
                move || service_loop(reader, pending, shutdown)
            })
            .map_err(RpcError::Io)?;

        let client = RpcClient {
            writer: Mutex::new(stream),
            pending,
            next_xid: AtomicU32::new(1),
            shutdown,
            service: Mutex::new(Some(service)),
        };
        client.call_sync(NFSPROC4_NULL, Vec::new())?;
        Ok(client)
    }

    fn encode_call(&self, xid: u32, proc_num: u32, body: &[u8]) -> Vec<u8> {
        let mut msg = Encoder::new();
        msg.u32(xid)
            .u32(CALL)
            .u32(RPC_VERS)
            .u32(NFS4_PROGRAM)
            .u32(NFS_V4)
            .u32(proc_num);
        // AUTH_SYS credential: requests act as root, like the original
        // engine pinning uid/gid 0 on its NFS context
        let mut cred = Encoder::new();
        cred.u32(0) // stamp
            .string("dpfs")
            .u32(0) // uid
            .u32(0) // gid
            .u32(0); // no auxiliary gids
        msg.u32(AUTH_SYS).opaque(cred.as_bytes());
        // verifier: AUTH_NONE
        msg.u32(AUTH_NONE).opaque(&[]);
        let mut out = msg.into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Issue a call. `cb` fires exactly once: from the service thread on a
    /// reply, or inline when the connection is already down.
    pub fn call(&self, proc_num: u32, body: Vec<u8>, cb: RpcCallback) {
        if self.shutdown.load(Ordering::Acquire) {
            cb(Err(RpcError::Disconnected));
            return;
        }
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(xid, cb);

        let msg = self.encode_call(xid, proc_num, &body);
        let mut frame = Vec::with_capacity(4 + msg.len());
        frame.extend_from_slice(&(LAST_FRAGMENT | msg.len() as u32).to_be_bytes());
        frame.extend_from_slice(&msg);

        let res = self.writer.lock().write_all(&frame);
        // On a write error, or when the service thread tore down between the
        // shutdown check and the insert, the callback is still ours to fail.
        if res.is_err() || self.shutdown.load(Ordering::Acquire) {
            if let Some(cb) = self.pending.lock().remove(&xid) {
                cb(Err(RpcError::Disconnected));
            }
        }
    }

    /// Blocking call, used by the sequential connection bring-up.
    pub fn call_sync(&self, proc_num: u32, body: Vec<u8>) -> RpcResult {
        let (tx, rx) = mpsc::channel();
        self.call(
            proc_num,
            body,
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        rx.recv().map_err(|_| RpcError::Disconnected)?
    }

    pub fn is_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl NfsRpc for RpcClient {
    fn compound(&self, body: Vec<u8>, cb: RpcCallback) {
        self.call(NFSPROC4_COMPOUND, body, cb);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.writer.lock().shutdown(Shutdown::Both);
        if let Some(handle) = self.service.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending", &self.pending.lock().len())
            .field("down", &self.is_down())
            .finish()
    }
}

fn read_record(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut record = Vec::new();
    loop {
        let mut mark = [0u8; 4];
        stream.read_exact(&mut mark)?;
        let mark = u32::from_be_bytes(mark);
        let len = (mark & !LAST_FRAGMENT) as usize;
        let start = record.len();
        record.resize(start + len, 0);
        stream.read_exact(&mut record[start..])?;
        if mark & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

/// Strip the RPC reply envelope, leaving the procedure results.
fn parse_reply(record: &[u8]) -> Result<(u32, RpcResult), RpcError> {
    let mut dec = Decoder::new(record);
    let xid = dec.u32()?;
    let _mtype = dec.u32()?;
    let reply_stat = dec.u32()?;
    if reply_stat != 0 {
        return Ok((xid, Err(RpcError::Denied(reply_stat))));
    }
    // verifier
    let _flavor = dec.u32()?;
    dec.skip_opaque()?;
    let accept_stat = dec.u32()?;
    if accept_stat != 0 {
        return Ok((xid, Err(RpcError::NotAccepted(accept_stat))));
    }
    Ok((xid, Ok(record[record.len() - dec.remaining()..].to_vec())))
}

fn service_loop(
    mut stream: TcpStream,
    pending: Arc<Mutex<HashMap<u32, RpcCallback>>>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let record = match read_record(&mut stream) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            Err(e) => {
                if !shutdown.load(Ordering::Acquire) {
                    error!("rpc service thread: connection lost: {e}");
                }
                break;
            }
        };
        match parse_reply(&record) {
            Ok((xid, result)) => match pending.lock().remove(&xid) {
                Some(cb) => cb(result),
                None => warn!("rpc reply for unknown xid {xid}"),
            },
            Err(e) => {
                error!("undecodable rpc reply: {e}");
                break;
            }
        }
    }
    shutdown.store(true, Ordering::Release);
    // Everything still outstanding will never be answered
    let mut pending = pending.lock();
    if !pending.is_empty() {
        debug!("failing {} outstanding rpc calls", pending.len());
    }
    for (_, cb) in pending.drain() {
        cb(Err(RpcError::Disconnected));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    /// Minimal accepted-SUCCESS reply for `xid` carrying `body`.
    fn encode_reply(xid: u32, body: &[u8]) -> Vec<u8> {
        let mut msg = Encoder::new();
        msg.u32(xid)
            .u32(1) // REPLY
            .u32(0) // MSG_ACCEPTED
            .u32(AUTH_NONE)
            .opaque(&[])
            .u32(0); // SUCCESS
        let mut msg = msg.into_bytes();
        msg.extend_from_slice(body);
        let mut frame = Vec::new();
        frame.extend_from_slice(&(LAST_FRAGMENT | msg.len() as u32).to_be_bytes());
        frame.extend_from_slice(&msg);
        frame
    }

    fn spawn_fake_server(replies: usize) -> (std::net::SocketAddr, JoinHandle<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut bodies = Vec::new();
            for _ in 0..replies {
                let record = read_record(&mut stream).unwrap();
                let mut dec = Decoder::new(&record);
                let xid = dec.u32().unwrap();
                bodies.push(record.clone());
                stream
                    .write_all(&encode_reply(xid, b"\x00\x00\x00\x2a"))
                    .unwrap();
            }
            bodies
        });
        (addr, handle)
    }

    #[test]
    fn null_call_and_compound_roundtrip() {
        let (addr, server) = spawn_fake_server(2);
        let client = RpcClient::connect(addr, Some(Duration::from_millis(50))).unwrap();
        let body = client.call_sync(NFSPROC4_COMPOUND, vec![1, 2, 3]).unwrap();
        assert_eq!(body, b"\x00\x00\x00\x2a");
        drop(client);
        let calls = server.join().unwrap();
        assert_eq!(calls.len(), 2);
        // second call carries our compound payload at the tail
        assert!(calls[1].ends_with(&[1, 2, 3]));
    }

    #[test]
    fn call_header_is_wellformed() {
        let (addr, server) = spawn_fake_server(1);
        let client = RpcClient::connect(addr, Some(Duration::from_millis(50))).unwrap();
        drop(client);
        let calls = server.join().unwrap();
        let mut dec = Decoder::new(&calls[0]);
        let _xid = dec.u32().unwrap();
        assert_eq!(dec.u32().unwrap(), CALL);
        assert_eq!(dec.u32().unwrap(), RPC_VERS);
        assert_eq!(dec.u32().unwrap(), NFS4_PROGRAM);
        assert_eq!(dec.u32().unwrap(), NFS_V4);
        assert_eq!(dec.u32().unwrap(), NFSPROC4_NULL);
        assert_eq!(dec.u32().unwrap(), AUTH_SYS);
    }

    #[test]
    fn disconnect_fails_outstanding_calls() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            // answer only the NULL probe, then hang up
            let record = read_record(&mut stream).unwrap();
            let xid = Decoder::new(&record).u32().unwrap();
            stream.write_all(&encode_reply(xid, &[])).unwrap();
        });
        let client = RpcClient::connect(addr, Some(Duration::from_millis(50))).unwrap();
        server.join().unwrap();
        let res = client.call_sync(NFSPROC4_COMPOUND, vec![0]);
        assert!(matches!(
            res,
            Err(RpcError::Disconnected) | Err(RpcError::Io(_))
        ));
    }
}
