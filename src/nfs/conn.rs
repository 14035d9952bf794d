//! NFSv4.1 connection bring-up and slot tables.
//!
//! Every polling thread owns one TCP connection trunked onto the clientid
//! the first connection established. Bring-up runs sequentially on the main
//! thread:
//!
//! EXCHANGE_ID (trunking check for all but the first), CREATE_SESSION,
//! then on the first connection LOOKUP of the true root filehandle and
//! RECLAIM_COMPLETE.
//!
//! A failed step parks the connection in `ShouldClose`; requests routed to
//! it fail with `EREMOTEIO`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::hal;
use crate::ll::fuse_abi::FUSE_MAX_OPCODE;
use crate::nfs::proto::{
    self, ChannelAttrs, Compound, CompoundReply, ExchangeIdResult, OpResult, SessionId,
};
use crate::nfs::rpc::{NfsRpc, RpcError};
use crate::nfs::xdr::XdrError;

static EXCHANGE_ID_VERIFIER: [u8; 8] = *b"01234567";
const EXCHANGE_ID_OWNER: &str = "dpfs-nfs";

#[derive(Debug, thiserror::Error)]
pub enum NfsError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("undecodable reply: {0}")]
    Xdr(#[from] XdrError),
    #[error("server returned NFS error {0}")]
    Server(u32),
    #[error("missing {0} result in compound reply")]
    MissingOp(&'static str),
    #[error("connection was not allowed to trunk onto the existing clientid")]
    TrunkingDenied,
    #[error("connection is not established")]
    NotEstablished,
    #[error("{0}")]
    Config(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Uninit,
    Established,
    Closed,
    ShouldClose,
}

#[derive(Debug)]
struct Slot {
    in_use: AtomicBool,
    // monotonically increasing, starts at 1 on first use
    seqid: AtomicU32,
}

/// Claimed slot parameters for one OP_SEQUENCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotClaim {
    pub slotid: u32,
    pub seqid: u32,
    pub highest_slotid: u32,
}

/// The per-session slot table. Claims come only from the owning polling
/// thread (single producer); releases happen in the reply path on the RPC
/// service thread.
#[derive(Debug)]
pub struct SlotTable {
    slots: Box<[Slot]>,
}

impl SlotTable {
    pub fn new(nslots: u32) -> SlotTable {
        let slots = (0..nslots.max(1))
            .map(|_| Slot {
                in_use: AtomicBool::new(false),
                seqid: AtomicU32::new(0),
            })
            .collect();
        SlotTable { slots }
    }

    pub fn nslots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn in_use(&self) -> u32 {
        self.slots
            .iter()
            .filter(|s| s.in_use.load(Ordering::Acquire))
            .count() as u32
    }

    /// Claim the first free slot. When every slot is busy the caller (the
    /// virtio poller) is suspended briefly and retries; sustained contention
    /// means max_background and the queue depth are mistuned relative to the
    /// session's slot count.
    pub fn claim(&self) -> SlotClaim {
        let slotid = 'scan: loop {
            for (i, slot) in self.slots.iter().enumerate() {
                if slot
                    .in_use
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break 'scan i as u32;
                }
            }
            warn!(
                "all {} slots are in use, suspending the poller; tune max_background / queue_depth",
                self.slots.len()
            );
            std::thread::sleep(Duration::from_micros(10));
        };
        let seqid = self.slots[slotid as usize].seqid.fetch_add(1, Ordering::AcqRel) + 1;
        SlotClaim {
            slotid,
            seqid,
            highest_slotid: self.highest_in_use(),
        }
    }

    pub fn release(&self, slotid: u32) {
        if let Some(slot) = self.slots.get(slotid as usize) {
            slot.in_use.store(false, Ordering::Release);
        }
    }

    /// The maximum currently-in-use slot index.
    pub fn highest_in_use(&self) -> u32 {
        self.slots
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| s.in_use.load(Ordering::Acquire))
            .map(|(i, _)| i as u32)
            .unwrap_or(0)
    }
}

/// Negotiated session state, fixed once CREATE_SESSION succeeded.
#[derive(Debug)]
pub struct NfsSession {
    pub sessionid: SessionId,
    pub attrs: ChannelAttrs,
    pub slots: SlotTable,
}

/// One trunked connection, dedicated to one polling thread.
pub struct VnfsConn {
    pub id: u32,
    pub rpc: Arc<dyn NfsRpc>,
    state: Mutex<ConnState>,
    session: OnceLock<NfsSession>,
    /// Per-opcode completed-call counters, merged across connections at
    /// DESTROY.
    pub op_calls: Box<[AtomicU64]>,
}

impl VnfsConn {
    pub fn new(id: u32, rpc: Arc<dyn NfsRpc>) -> VnfsConn {
        VnfsConn {
            id,
            rpc,
            state: Mutex::new(ConnState::Uninit),
            session: OnceLock::new(),
            op_calls: (0..=FUSE_MAX_OPCODE).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    pub fn mark(&self, state: ConnState) {
        *self.state.lock() = state;
    }

    pub fn session(&self) -> Result<&NfsSession, NfsError> {
        self.session.get().ok_or(NfsError::NotEstablished)
    }

    pub fn count_op(&self, opcode: u32) {
        if let Some(c) = self.op_calls.get(opcode as usize) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Claim a slot and emit the OP_SEQUENCE that must start the compound.
    pub fn begin_sequence(&self, comp: &mut Compound, cachethis: bool) -> Result<u32, NfsError> {
        let session = self.session()?;
        let claim = session.slots.claim();
        comp.op_sequence(
            &session.sessionid,
            claim.slotid,
            claim.seqid,
            claim.highest_slotid,
            cachethis,
        );
        Ok(claim.slotid)
    }

    pub fn release_slot(&self, slotid: u32) {
        if let Some(session) = self.session.get() {
            session.slots.release(slotid);
        }
    }

    /// Blocking compound used by the sequential bring-up path.
    fn compound_sync(&self, comp: Compound) -> Result<CompoundReply, NfsError> {
        let (tx, rx) = mpsc::channel();
        self.rpc.compound(
            comp.finish(),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        );
        let body = rx.recv().map_err(|_| RpcError::Disconnected)??;
        Ok(proto::decode_compound(&body)?)
    }

    /// EXCHANGE_ID and, for trunked connections, the eligibility check
    /// against the first connection's reply.
    pub fn exchange_id(
        &self,
        first: Option<&ExchangeIdResult>,
    ) -> Result<ExchangeIdResult, NfsError> {
        let mut comp = Compound::new();
        comp.op_exchange_id(&EXCHANGE_ID_VERIFIER, EXCHANGE_ID_OWNER);
        let reply = self.compound_sync(comp)?;
        if reply.status != proto::NFS4_OK {
            return Err(NfsError::Server(reply.status));
        }
        let res = reply
            .find(|r| match r {
                OpResult::ExchangeId(res) => Some(res.clone()),
                _ => None,
            })
            .ok_or(NfsError::MissingOp("EXCHANGE_ID"))?;
        if let Some(first) = first {
            if !proto::trunking_allowed(first, &res) {
                return Err(NfsError::TrunkingDenied);
            }
        }
        Ok(res)
    }

    pub fn create_session(&self, eir: &ExchangeIdResult) -> Result<(), NfsError> {
        let desired = ChannelAttrs {
            headerpadsize: 0,
            maxrequestsize: 2 * 1024 * 1024,
            maxresponsesize: 2 * 1024 * 1024,
            maxresponsesize_cached: 4096,
            maxoperations: proto::NFS4_MAX_OPS as u32,
            maxrequests: hal::QUEUE_DEPTH,
        };
        let mut comp = Compound::new();
        comp.op_create_session(eir.clientid, eir.sequenceid, &desired);
        let reply = self.compound_sync(comp)?;
        if reply.status != proto::NFS4_OK {
            return Err(NfsError::Server(reply.status));
        }
        let (sessionid, attrs) = reply
            .find(|r| match r {
                OpResult::CreateSession {
                    sessionid, attrs, ..
                } => Some((*sessionid, *attrs)),
                _ => None,
            })
            .ok_or(NfsError::MissingOp("CREATE_SESSION"))?;

        if attrs.maxoperations < proto::NFS4_MAX_OPS as u32 {
            warn!(
                "server only supports {} operations per compound, wanted {}; \
                 write performance for large block sizes will suffer",
                attrs.maxoperations,
                proto::NFS4_MAX_OPS
            );
        }
        let slots = SlotTable::new(attrs.maxrequests);
        let _ = self.session.set(NfsSession {
            sessionid,
            attrs,
            slots,
        });
        Ok(())
    }

    /// Resolve the export path to its filehandle: PUTROOTFH, LOOKUP of each
    /// component, GETFH.
    pub fn lookup_true_rootfh(&self, export: &str) -> Result<Vec<u8>, NfsError> {
        let mut comp = Compound::new();
        let slotid = self.begin_sequence(&mut comp, false)?;
        comp.op_putrootfh();
        for component in export.split('/').filter(|c| !c.is_empty()) {
            comp.op_lookup(component.as_bytes());
        }
        comp.op_getfh();

        let result = self.compound_sync(comp);
        self.release_slot(slotid);
        let reply = result?;
        if reply.status != proto::NFS4_OK {
            return Err(NfsError::Server(reply.status));
        }
        reply
            .find(|r| match r {
                OpResult::GetFh(fh) => Some(fh.clone()),
                _ => None,
            })
            .ok_or(NfsError::MissingOp("GETFH"))
    }

    /// RECLAIM_COMPLETE; an old lingering connection answering
    /// NFS4ERR_COMPLETE_ALREADY only means a partial handshake was needed.
    pub fn reclaim_complete(&self) -> Result<(), NfsError> {
        let mut comp = Compound::new();
        let slotid = self.begin_sequence(&mut comp, false)?;
        comp.op_reclaim_complete();
        let result = self.compound_sync(comp);
        self.release_slot(slotid);
        let reply = result?;
        match reply.status {
            proto::NFS4_OK => Ok(()),
            proto::NFS4ERR_COMPLETE_ALREADY => {
                info!("server reported a lingering old connection (COMPLETE_ALREADY)");
                Ok(())
            }
            status => Err(NfsError::Server(status)),
        }
    }
}

impl std::fmt::Debug for VnfsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VnfsConn")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
