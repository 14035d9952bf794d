//! NFSv4.1 compound construction and reply parsing (RFC 8881 subset).
//!
//! Only the operations the dataplane issues are implemented. Attribute
//! lists are decoded by hand in ascending attribute-number order, which is
//! how XDR lays them out on the wire.

use crate::ll::fuse_abi::fuse_attr;
use crate::ll::fuse_abi::fuse_kstatfs;
use crate::nfs::xdr::{Decoder, Encoder, XdrError};

pub const NFS4DOT1_MINOR: u32 = 1;

/// Attribute block size reported for NFS files; the protocol carries
/// `space_used`, not block counts.
pub const NFS_BLKSIZE: u32 = 4096;

/// Per-compound operation ceiling this engine hopes to negotiate. Older
/// Linux servers cap `ca_maxoperations` lower, which throttles the WRITE
/// fanout for large block sizes.
pub const NFS4_MAX_OPS: usize = 16;

// Operation numbers
pub const OP_CLOSE: u32 = 4;
pub const OP_COMMIT: u32 = 5;
pub const OP_GETATTR: u32 = 9;
pub const OP_GETFH: u32 = 10;
pub const OP_LOOKUP: u32 = 15;
pub const OP_OPEN: u32 = 18;
pub const OP_PUTFH: u32 = 22;
pub const OP_PUTROOTFH: u32 = 24;
pub const OP_READ: u32 = 25;
pub const OP_SETATTR: u32 = 34;
pub const OP_WRITE: u32 = 38;
pub const OP_EXCHANGE_ID: u32 = 42;
pub const OP_CREATE_SESSION: u32 = 43;
pub const OP_SEQUENCE: u32 = 53;
pub const OP_RECLAIM_COMPLETE: u32 = 58;

// Status codes
pub const NFS4_OK: u32 = 0;
pub const NFS4ERR_MLINK: u32 = 31;
pub const NFS4ERR_COMPLETE_ALREADY: u32 = 10054;

// Attribute numbers
const FATTR4_TYPE: u32 = 1;
const FATTR4_SIZE: u32 = 4;
const FATTR4_FILEID: u32 = 20;
const FATTR4_FILES_FREE: u32 = 22;
const FATTR4_FILES_TOTAL: u32 = 23;
const FATTR4_MAXNAME: u32 = 29;
const FATTR4_MODE: u32 = 33;
const FATTR4_NUMLINKS: u32 = 35;
const FATTR4_OWNER: u32 = 36;
const FATTR4_OWNER_GROUP: u32 = 37;
const FATTR4_SPACE_AVAIL: u32 = 42;
const FATTR4_SPACE_FREE: u32 = 43;
const FATTR4_SPACE_TOTAL: u32 = 44;
const FATTR4_SPACE_USED: u32 = 45;
const FATTR4_TIME_ACCESS: u32 = 47;
const FATTR4_TIME_METADATA: u32 = 52;
const FATTR4_TIME_MODIFY: u32 = 53;

// File types
const NF4REG: u32 = 1;
const NF4DIR: u32 = 2;
const NF4BLK: u32 = 3;
const NF4CHR: u32 = 4;
const NF4LNK: u32 = 5;
const NF4SOCK: u32 = 6;
const NF4FIFO: u32 = 7;

// OPEN arguments
pub const OPEN4_SHARE_ACCESS_BOTH: u32 = 3;
/// 4.1 want flag: never hand us a delegation, we would only return it.
pub const OPEN4_SHARE_ACCESS_WANT_NO_DELEG: u32 = 0x2_0000;
pub const OPEN4_SHARE_DENY_NONE: u32 = 0;
pub const OPEN4_NOCREATE: u32 = 0;
pub const OPEN4_CREATE: u32 = 1;
pub const UNCHECKED4: u32 = 0;
pub const CLAIM_NULL: u32 = 0;
pub const CLAIM_FH: u32 = 4;
pub const OPEN4_RESULT_CONFIRM: u32 = 2;
pub const OPEN_DELEGATE_NONE: u32 = 0;
pub const UNSTABLE4: u32 = 0;

const SP4_NONE: u32 = 0;

/// `(1 << TYPE) | (1 << SIZE) | (1 << FILEID)` plus the word-1 metadata
/// attributes: the set every LOOKUP/GETATTR requests.
pub fn standard_attr_bitmap() -> [u32; 2] {
    [
        1 << FATTR4_TYPE | 1 << FATTR4_SIZE | 1 << FATTR4_FILEID,
        1 << (FATTR4_MODE - 32)
            | 1 << (FATTR4_NUMLINKS - 32)
            | 1 << (FATTR4_OWNER - 32)
            | 1 << (FATTR4_OWNER_GROUP - 32)
            | 1 << (FATTR4_SPACE_USED - 32)
            | 1 << (FATTR4_TIME_ACCESS - 32)
            | 1 << (FATTR4_TIME_METADATA - 32)
            | 1 << (FATTR4_TIME_MODIFY - 32),
    ]
}

/// The attribute set STATFS requests.
pub fn statfs_attr_bitmap() -> [u32; 2] {
    [
        1 << FATTR4_FILES_FREE | 1 << FATTR4_FILES_TOTAL | 1 << FATTR4_MAXNAME,
        1 << (FATTR4_SPACE_AVAIL - 32)
            | 1 << (FATTR4_SPACE_FREE - 32)
            | 1 << (FATTR4_SPACE_TOTAL - 32),
    ]
}

pub type SessionId = [u8; 16];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stateid {
    pub seqid: u32,
    pub other: [u8; 12],
}

impl Stateid {
    fn encode(&self, enc: &mut Encoder) {
        enc.u32(self.seqid).opaque_fixed(&self.other);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Stateid, XdrError> {
        let seqid = dec.u32()?;
        let other = dec.opaque_fixed(12)?;
        Ok(Stateid {
            seqid,
            other: other.try_into().unwrap(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAttrs {
    pub headerpadsize: u32,
    pub maxrequestsize: u32,
    pub maxresponsesize: u32,
    pub maxresponsesize_cached: u32,
    pub maxoperations: u32,
    pub maxrequests: u32,
}

impl ChannelAttrs {
    fn encode(&self, enc: &mut Encoder) {
        enc.u32(self.headerpadsize)
            .u32(self.maxrequestsize)
            .u32(self.maxresponsesize)
            .u32(self.maxresponsesize_cached)
            .u32(self.maxoperations)
            .u32(self.maxrequests)
            .u32(0); // no rdma_ird
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<ChannelAttrs, XdrError> {
        let attrs = ChannelAttrs {
            headerpadsize: dec.u32()?,
            maxrequestsize: dec.u32()?,
            maxresponsesize: dec.u32()?,
            maxresponsesize_cached: dec.u32()?,
            maxoperations: dec.u32()?,
            maxrequests: dec.u32()?,
        };
        let rdma_ird_len = dec.u32()?;
        for _ in 0..rdma_ird_len {
            dec.u32()?;
        }
        Ok(attrs)
    }
}

/// What EXCHANGE_ID established, kept for the trunking-eligibility check of
/// later connections.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExchangeIdResult {
    pub clientid: u64,
    pub sequenceid: u32,
    pub flags: u32,
    pub server_owner_minor: u64,
    /// Owned copies; the reply buffer they came from is long gone by the
    /// time another connection compares against them.
    pub server_owner_major: Vec<u8>,
    pub server_scope: Vec<u8>,
}

/// RFC 8881 §2.10.5: session-trunking a new connection onto an existing
/// clientid requires the same server owner (major) and server scope.
pub fn trunking_allowed(first: &ExchangeIdResult, other: &ExchangeIdResult) -> bool {
    first.clientid == other.clientid
        && first.server_owner_major == other.server_owner_major
        && first.server_scope == other.server_scope
}

/// A settable attribute list (bitmap + packed values).
#[derive(Debug, Default, Clone)]
pub struct Fattr4 {
    pub bitmap: [u32; 2],
    pub attrlist: Vec<u8>,
}

impl Fattr4 {
    fn encode(&self, enc: &mut Encoder) {
        // trim trailing zero bitmap words like servers expect
        let words: &[u32] = if self.bitmap[1] == 0 {
            &self.bitmap[..1]
        } else {
            &self.bitmap
        };
        enc.u32(words.len() as u32);
        for w in words {
            enc.u32(*w);
        }
        enc.opaque(&self.attrlist);
    }
}

/// Attributes for OPEN4_CREATE: mode, owner and owner_group from the
/// FUSE request credentials.
pub fn create_attrs(mode: u32, uid: u32, gid: u32) -> Fattr4 {
    let mut attrlist = Encoder::new();
    // ascending attribute order: MODE(33), OWNER(36), OWNER_GROUP(37)
    attrlist.u32(mode & 0o7777);
    attrlist.string(&uid.to_string());
    attrlist.string(&gid.to_string());
    Fattr4 {
        bitmap: [
            0,
            1 << (FATTR4_MODE - 32) | 1 << (FATTR4_OWNER - 32) | 1 << (FATTR4_OWNER_GROUP - 32),
        ],
        attrlist: attrlist.into_bytes(),
    }
}

/// SETATTR attribute list from the FUSE `valid` mask. Only MODE and SIZE
/// are mapped; OWNER/GROUP mapping is intentionally omitted.
pub fn setattr_attrs(set_mode: Option<u32>, set_size: Option<u64>) -> Fattr4 {
    let mut bitmap = [0u32; 2];
    let mut attrlist = Encoder::new();
    // ascending attribute order: SIZE(4) precedes MODE(33)
    if let Some(size) = set_size {
        bitmap[0] |= 1 << FATTR4_SIZE;
        attrlist.u64(size);
    }
    if let Some(mode) = set_mode {
        bitmap[1] |= 1 << (FATTR4_MODE - 32);
        attrlist.u32(mode & 0o7777);
    }
    Fattr4 {
        bitmap,
        attrlist: attrlist.into_bytes(),
    }
}

/// Builder for one COMPOUND4args procedure body.
#[derive(Debug)]
pub struct Compound {
    ops: Encoder,
    numops: u32,
}

impl Compound {
    pub fn new() -> Compound {
        Compound {
            ops: Encoder::new(),
            numops: 0,
        }
    }

    pub fn numops(&self) -> u32 {
        self.numops
    }

    pub fn finish(self) -> Vec<u8> {
        let mut body = Encoder::new();
        body.opaque(&[]); // tag
        body.u32(NFS4DOT1_MINOR);
        body.u32(self.numops);
        let mut bytes = body.into_bytes();
        bytes.extend_from_slice(self.ops.as_bytes());
        bytes
    }

    fn begin(&mut self, op: u32) -> &mut Encoder {
        self.numops += 1;
        self.ops.u32(op)
    }

    pub fn op_sequence(
        &mut self,
        sessionid: &SessionId,
        slotid: u32,
        sequenceid: u32,
        highest_slotid: u32,
        cachethis: bool,
    ) {
        self.begin(OP_SEQUENCE)
            .opaque_fixed(sessionid)
            .u32(sequenceid)
            .u32(slotid)
            .u32(highest_slotid)
            .bool(cachethis);
    }

    pub fn op_putfh(&mut self, fh: &[u8]) {
        self.begin(OP_PUTFH).opaque(fh);
    }

    pub fn op_putrootfh(&mut self) {
        self.begin(OP_PUTROOTFH);
    }

    pub fn op_getfh(&mut self) {
        self.begin(OP_GETFH);
    }

    pub fn op_lookup(&mut self, name: &[u8]) {
        self.begin(OP_LOOKUP).opaque(name);
    }

    pub fn op_getattr(&mut self, bitmap: &[u32; 2]) {
        self.begin(OP_GETATTR).u32(2).u32(bitmap[0]).u32(bitmap[1]);
    }

    fn op_open_common(&mut self, owner_clientid: u64, owner: u32, share_access: u32) -> &mut Encoder {
        let enc = self.begin(OP_OPEN);
        enc.u32(0) // seqid, unused under 4.1 sessions
            .u32(share_access)
            .u32(OPEN4_SHARE_DENY_NONE)
            .u64(owner_clientid)
            .opaque(&owner.to_ne_bytes());
        enc
    }

    /// OPEN an existing file: the current filehandle designates the file
    /// itself (CLAIM_FH).
    pub fn op_open_nocreate(&mut self, owner_clientid: u64, owner: u32) {
        let enc = self.op_open_common(
            owner_clientid,
            owner,
            OPEN4_SHARE_ACCESS_BOTH | OPEN4_SHARE_ACCESS_WANT_NO_DELEG,
        );
        enc.u32(OPEN4_NOCREATE);
        enc.u32(CLAIM_FH);
    }

    /// OPEN with creation: the current filehandle is the parent directory
    /// and the claim carries the new component (CLAIM_NULL).
    pub fn op_open_create(
        &mut self,
        owner_clientid: u64,
        owner: u32,
        name: &[u8],
        attrs: &Fattr4,
    ) {
        let enc = self.op_open_common(
            owner_clientid,
            owner,
            OPEN4_SHARE_ACCESS_BOTH | OPEN4_SHARE_ACCESS_WANT_NO_DELEG,
        );
        enc.u32(OPEN4_CREATE).u32(UNCHECKED4);
        attrs.encode(enc);
        enc.u32(CLAIM_NULL).opaque(name);
    }

    pub fn op_read(&mut self, stateid: &Stateid, offset: u64, count: u32) {
        let enc = self.begin(OP_READ);
        stateid.encode(enc);
        enc.u64(offset).u32(count);
    }

    pub fn op_write(&mut self, stateid: &Stateid, offset: u64, data: &[u8]) {
        let enc = self.begin(OP_WRITE);
        stateid.encode(enc);
        enc.u64(offset).u32(UNSTABLE4).opaque(data);
    }

    pub fn op_commit(&mut self, offset: u64, count: u32) {
        self.begin(OP_COMMIT).u64(offset).u32(count);
    }

    pub fn op_close(&mut self, stateid: &Stateid) {
        let enc = self.begin(OP_CLOSE);
        enc.u32(0); // seqid, unused under 4.1 sessions
        stateid.encode(enc);
    }

    pub fn op_setattr(&mut self, stateid: &Stateid, attrs: &Fattr4) {
        let enc = self.begin(OP_SETATTR);
        stateid.encode(enc);
        attrs.encode(enc);
    }

    pub fn op_exchange_id(&mut self, verifier: &[u8; 8], owner: &str) {
        self.begin(OP_EXCHANGE_ID)
            .opaque_fixed(verifier)
            .string(owner)
            .u32(0) // flags
            .u32(SP4_NONE)
            .u32(0); // no client impl id
    }

    pub fn op_create_session(&mut self, clientid: u64, sequenceid: u32, attrs: &ChannelAttrs) {
        let enc = self.begin(OP_CREATE_SESSION);
        enc.u64(clientid).u32(sequenceid).u32(0); // flags
        attrs.encode(enc); // fore channel
        attrs.encode(enc); // back channel
        enc.u32(0x4000_0000); // callback program, never used
        // one AUTH_NONE callback security parameter
        enc.u32(1).u32(0);
    }

    pub fn op_reclaim_complete(&mut self) {
        self.begin(OP_RECLAIM_COMPLETE).bool(false); // rca_one_fs
    }
}

impl Default for Compound {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRes {
    pub sessionid: SessionId,
    pub sequenceid: u32,
    pub slotid: u32,
    pub highest_slotid: u32,
    pub target_highest_slotid: u32,
    pub status_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Sequence(SequenceRes),
    PutFh,
    PutRootFh,
    GetFh(Vec<u8>),
    Lookup,
    Getattr(Vec<u8>),
    Open { stateid: Stateid, rflags: u32 },
    Read { eof: bool, data: Vec<u8> },
    Write { count: u32 },
    Commit,
    Close(Stateid),
    Setattr,
    ExchangeId(ExchangeIdResult),
    CreateSession { sessionid: SessionId, sequenceid: u32, attrs: ChannelAttrs },
    ReclaimComplete,
    Unknown(u32),
}

#[derive(Debug, Clone)]
pub struct CompoundReply {
    /// Status of the compound: the status of the last processed op.
    pub status: u32,
    /// Results of the ops the server processed, in order. On failure the
    /// last entry is the failing op (with no decoded body).
    pub results: Vec<OpResult>,
}

impl CompoundReply {
    /// First result of the given shape, e.g. the GETFH of a LOOKUP chain.
    pub fn find<'a, T, F: Fn(&'a OpResult) -> Option<T>>(&'a self, f: F) -> Option<T> {
        self.results.iter().find_map(f)
    }
}

fn decode_exchange_id(dec: &mut Decoder<'_>) -> Result<ExchangeIdResult, XdrError> {
    let clientid = dec.u64()?;
    let sequenceid = dec.u32()?;
    let flags = dec.u32()?;
    let state_protect = dec.u32()?;
    if state_protect != SP4_NONE {
        // SP4_MACH_CRED / SP4_SSV carry bodies we never negotiate
        return Err(XdrError::BadLength(state_protect));
    }
    let server_owner_minor = dec.u64()?;
    let server_owner_major = dec.opaque()?.to_vec();
    let server_scope = dec.opaque()?.to_vec();
    let impl_ids = dec.u32()?;
    for _ in 0..impl_ids {
        dec.skip_opaque()?; // domain
        dec.skip_opaque()?; // name
        dec.u64()?; // build date seconds
        dec.u32()?; // build date nseconds
    }
    Ok(ExchangeIdResult {
        clientid,
        sequenceid,
        flags,
        server_owner_minor,
        server_owner_major,
        server_scope,
    })
}

fn decode_open(dec: &mut Decoder<'_>) -> Result<OpResult, XdrError> {
    let stateid = Stateid::decode(dec)?;
    // change_info4
    dec.bool()?;
    dec.u64()?;
    dec.u64()?;
    let rflags = dec.u32()?;
    let bitmap_len = dec.u32()?;
    for _ in 0..bitmap_len {
        dec.u32()?;
    }
    let delegation = dec.u32()?;
    if delegation != OPEN_DELEGATE_NONE {
        // we ask for WANT_NO_DELEG; a delegation reply is unparsed
        return Err(XdrError::BadLength(delegation));
    }
    Ok(OpResult::Open { stateid, rflags })
}

fn decode_one(resop: u32, status: u32, dec: &mut Decoder<'_>) -> Result<OpResult, XdrError> {
    // SETATTR carries its attrsset bitmap in both arms
    if resop == OP_SETATTR {
        let len = dec.u32()?;
        for _ in 0..len {
            dec.u32()?;
        }
        return Ok(OpResult::Setattr);
    }
    if status != NFS4_OK {
        return Ok(OpResult::Unknown(resop));
    }
    Ok(match resop {
        OP_SEQUENCE => {
            let sessionid = dec.opaque_fixed(16)?.try_into().unwrap();
            OpResult::Sequence(SequenceRes {
                sessionid,
                sequenceid: dec.u32()?,
                slotid: dec.u32()?,
                highest_slotid: dec.u32()?,
                target_highest_slotid: dec.u32()?,
                status_flags: dec.u32()?,
            })
        }
        OP_PUTFH => OpResult::PutFh,
        OP_PUTROOTFH => OpResult::PutRootFh,
        OP_GETFH => OpResult::GetFh(dec.opaque()?.to_vec()),
        OP_LOOKUP => OpResult::Lookup,
        OP_GETATTR => {
            let bitmap_len = dec.u32()?;
            for _ in 0..bitmap_len {
                dec.u32()?;
            }
            OpResult::Getattr(dec.opaque()?.to_vec())
        }
        OP_OPEN => decode_open(dec)?,
        OP_READ => {
            let eof = dec.bool()?;
            OpResult::Read {
                eof,
                data: dec.opaque()?.to_vec(),
            }
        }
        OP_WRITE => {
            let count = dec.u32()?;
            dec.u32()?; // committed
            dec.opaque_fixed(8)?; // write verifier
            OpResult::Write { count }
        }
        OP_COMMIT => {
            dec.opaque_fixed(8)?; // write verifier
            OpResult::Commit
        }
        OP_CLOSE => OpResult::Close(Stateid::decode(dec)?),
        OP_EXCHANGE_ID => OpResult::ExchangeId(decode_exchange_id(dec)?),
        OP_CREATE_SESSION => {
            let sessionid = dec.opaque_fixed(16)?.try_into().unwrap();
            let sequenceid = dec.u32()?;
            let _flags = dec.u32()?;
            let attrs = ChannelAttrs::decode(dec)?;
            let _back = ChannelAttrs::decode(dec)?;
            OpResult::CreateSession {
                sessionid,
                sequenceid,
                attrs,
            }
        }
        OP_RECLAIM_COMPLETE => OpResult::ReclaimComplete,
        other => OpResult::Unknown(other),
    })
}

/// Decode a COMPOUND4res procedure body.
pub fn decode_compound(body: &[u8]) -> Result<CompoundReply, XdrError> {
    let mut dec = Decoder::new(body);
    let status = dec.u32()?;
    dec.skip_opaque()?; // tag
    let count = dec.u32()?;
    let mut results = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let resop = dec.u32()?;
        let op_status = dec.u32()?;
        results.push(decode_one(resop, op_status, &mut dec)?);
    }
    Ok(CompoundReply { status, results })
}

fn parse_ugid(bytes: &[u8]) -> u32 {
    // Owners come as decimal strings when idmapping is off; anything else
    // maps to nobody.
    match std::str::from_utf8(bytes).ok().and_then(|s| s.parse().ok()) {
        Some(id) => id,
        None => 65534,
    }
}

fn decode_nfstime(dec: &mut Decoder<'_>) -> Result<(i64, u32), XdrError> {
    let seconds = dec.u64()? as i64;
    let nseconds = dec.u32()?;
    Ok((seconds, nseconds))
}

/// Parse the standard attribute set (see [`standard_attr_bitmap`]) into the
/// FUSE wire attr. The attrlist packs values in ascending attribute order.
pub fn parse_standard_attrs(attrlist: &[u8]) -> Result<fuse_attr, XdrError> {
    let mut dec = Decoder::new(attrlist);
    let mut attr = fuse_attr::default();

    let ftype = dec.u32()?;
    attr.size = dec.u64()?;
    attr.ino = dec.u64()?;
    attr.mode = dec.u32()?;
    attr.mode |= match ftype {
        NF4REG => libc::S_IFREG,
        NF4DIR => libc::S_IFDIR,
        NF4BLK => libc::S_IFBLK,
        NF4CHR => libc::S_IFCHR,
        NF4LNK => libc::S_IFLNK,
        NF4SOCK => libc::S_IFSOCK,
        NF4FIFO => libc::S_IFIFO,
        _ => 0,
    };
    attr.nlink = dec.u32()?;
    attr.uid = parse_ugid(dec.opaque()?);
    attr.gid = parse_ugid(dec.opaque()?);
    let space_used = dec.u64()?;
    (attr.atime, attr.atimensec) = decode_nfstime(&mut dec)?;
    (attr.ctime, attr.ctimensec) = decode_nfstime(&mut dec)?;
    (attr.mtime, attr.mtimensec) = decode_nfstime(&mut dec)?;

    attr.blksize = NFS_BLKSIZE;
    attr.blocks = space_used.div_ceil(NFS_BLKSIZE as u64);
    // no information for this field
    attr.rdev = 0;
    Ok(attr)
}

/// Parse the statfs attribute set (see [`statfs_attr_bitmap`]).
pub fn parse_statfs_attrs(attrlist: &[u8]) -> Result<fuse_kstatfs, XdrError> {
    let mut dec = Decoder::new(attrlist);
    let files_free = dec.u64()?;
    let files_total = dec.u64()?;
    let maxname = dec.u32()?;
    let space_avail = dec.u64()?;
    let space_free = dec.u64()?;
    let space_total = dec.u64()?;

    let bs = NFS_BLKSIZE as u64;
    Ok(fuse_kstatfs {
        blocks: space_total / bs,
        bfree: space_free / bs,
        bavail: space_avail / bs,
        files: files_total,
        ffree: files_free,
        bsize: NFS_BLKSIZE,
        namelen: maxname,
        frsize: NFS_BLKSIZE,
        padding: 0,
        spare: [0; 6],
    })
}

/// NFS4ERR_* to POSIX errno. The protocol error numbers coincide with errno
/// up through NFS4ERR_MLINK; everything past that has no direct translation.
pub fn nfs_error_to_errno(status: u32) -> i32 {
    if status <= NFS4ERR_MLINK {
        status as i32
    } else {
        libc::ENOSYS
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compound_header_layout() {
        let mut c = Compound::new();
        c.op_putrootfh();
        c.op_getfh();
        assert_eq!(c.numops(), 2);
        let body = c.finish();
        let mut dec = Decoder::new(&body);
        assert_eq!(dec.opaque().unwrap(), b""); // tag
        assert_eq!(dec.u32().unwrap(), NFS4DOT1_MINOR);
        assert_eq!(dec.u32().unwrap(), 2);
        assert_eq!(dec.u32().unwrap(), OP_PUTROOTFH);
        assert_eq!(dec.u32().unwrap(), OP_GETFH);
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn sequence_op_layout() {
        let mut c = Compound::new();
        c.op_sequence(&[7u8; 16], 3, 9, 5, false);
        let body = c.finish();
        let mut dec = Decoder::new(&body);
        dec.skip_opaque().unwrap();
        dec.u32().unwrap();
        dec.u32().unwrap();
        assert_eq!(dec.u32().unwrap(), OP_SEQUENCE);
        assert_eq!(dec.opaque_fixed(16).unwrap(), &[7u8; 16]);
        assert_eq!(dec.u32().unwrap(), 9); // sequenceid
        assert_eq!(dec.u32().unwrap(), 3); // slotid
        assert_eq!(dec.u32().unwrap(), 5); // highest slotid
        assert_eq!(dec.u32().unwrap(), 0); // cachethis
    }

    fn encode_reply(status: u32, ops: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u32(status).opaque(&[]).u32(ops.len() as u32);
        let mut out = enc.into_bytes();
        for (resop, op_status, body) in ops {
            let mut op = Encoder::new();
            op.u32(*resop).u32(*op_status);
            out.extend_from_slice(op.as_bytes());
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn decode_lookup_chain_reply() {
        let seq = {
            let mut e = Encoder::new();
            e.opaque_fixed(&[1u8; 16]).u32(4).u32(0).u32(0).u32(0).u32(0);
            e.into_bytes()
        };
        let getattr = {
            let mut e = Encoder::new();
            e.u32(2).u32(0).u32(0).opaque(b"attrs");
            e.into_bytes()
        };
        let getfh = {
            let mut e = Encoder::new();
            e.opaque(b"fh-bytes");
            e.into_bytes()
        };
        let body = encode_reply(
            NFS4_OK,
            &[
                (OP_SEQUENCE, NFS4_OK, seq),
                (OP_PUTFH, NFS4_OK, vec![]),
                (OP_LOOKUP, NFS4_OK, vec![]),
                (OP_GETATTR, NFS4_OK, getattr),
                (OP_GETFH, NFS4_OK, getfh),
            ],
        );
        let reply = decode_compound(&body).unwrap();
        assert_eq!(reply.status, NFS4_OK);
        assert_eq!(reply.results.len(), 5);
        let attrs = reply
            .find(|r| match r {
                OpResult::Getattr(a) => Some(a.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(attrs, b"attrs");
        let fh = reply
            .find(|r| match r {
                OpResult::GetFh(fh) => Some(fh.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(fh, b"fh-bytes");
    }

    #[test]
    fn decode_failed_compound_stops_at_failure() {
        let body = encode_reply(
            2, // NFS4ERR_NOENT
            &[
                (OP_SEQUENCE, NFS4_OK, {
                    let mut e = Encoder::new();
                    e.opaque_fixed(&[0u8; 16]).u32(1).u32(0).u32(0).u32(0).u32(0);
                    e.into_bytes()
                }),
                (OP_PUTFH, NFS4_OK, vec![]),
                (OP_LOOKUP, 2, vec![]),
            ],
        );
        let reply = decode_compound(&body).unwrap();
        assert_eq!(reply.status, 2);
        assert_eq!(reply.results.len(), 3);
        assert_eq!(reply.results[2], OpResult::Unknown(OP_LOOKUP));
    }

    #[test]
    fn standard_attr_roundtrip() {
        let mut e = Encoder::new();
        e.u32(NF4REG)
            .u64(13)
            .u64(42424242)
            .u32(0o644)
            .u32(2)
            .opaque(b"1000")
            .opaque(b"100")
            .u64(8192)
            .u64(111).u32(1)
            .u64(222).u32(2)
            .u64(333).u32(3);
        let attr = parse_standard_attrs(e.as_bytes()).unwrap();
        assert_eq!(attr.size, 13);
        assert_eq!(attr.ino, 42424242);
        assert_eq!(attr.mode, libc::S_IFREG | 0o644);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.gid, 100);
        assert_eq!(attr.blocks, 2);
        assert_eq!((attr.atime, attr.atimensec), (111, 1));
        assert_eq!((attr.ctime, attr.ctimensec), (222, 2));
        assert_eq!((attr.mtime, attr.mtimensec), (333, 3));
    }

    #[test]
    fn non_numeric_owner_maps_to_nobody() {
        assert_eq!(parse_ugid(b"alice@example.com"), 65534);
        assert_eq!(parse_ugid(b"0"), 0);
    }

    #[test]
    fn statfs_attr_mapping() {
        let mut e = Encoder::new();
        e.u64(10) // files_free
            .u64(20) // files_total
            .u32(255)
            .u64(4096 * 3) // space_avail
            .u64(4096 * 5) // space_free
            .u64(4096 * 100); // space_total
        let st = parse_statfs_attrs(e.as_bytes()).unwrap();
        assert_eq!(st.ffree, 10);
        assert_eq!(st.files, 20);
        assert_eq!(st.namelen, 255);
        assert_eq!(st.bavail, 3);
        assert_eq!(st.bfree, 5);
        assert_eq!(st.blocks, 100);
        assert_eq!(st.bsize, NFS_BLKSIZE);
    }

    #[test]
    fn error_map_is_monotonic_then_enosys() {
        assert_eq!(nfs_error_to_errno(NFS4_OK), 0);
        assert_eq!(nfs_error_to_errno(2), libc::ENOENT);
        assert_eq!(nfs_error_to_errno(13), libc::EACCES);
        assert_eq!(nfs_error_to_errno(NFS4ERR_MLINK), libc::EMLINK);
        assert_eq!(nfs_error_to_errno(10054), libc::ENOSYS);
        assert_eq!(nfs_error_to_errno(99999), libc::ENOSYS);
    }

    #[test]
    fn trunking_check() {
        let first = ExchangeIdResult {
            clientid: 7,
            sequenceid: 1,
            flags: 0,
            server_owner_minor: 0,
            server_owner_major: b"owner".to_vec(),
            server_scope: b"scope".to_vec(),
        };
        let mut other = first.clone();
        other.sequenceid = 9;
        assert!(trunking_allowed(&first, &other));
        other.server_owner_major = b"other".to_vec();
        assert!(!trunking_allowed(&first, &other));
    }
}
