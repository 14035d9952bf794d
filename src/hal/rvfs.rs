//! RPC-tunnel frame codec.
//!
//! The software transport moves one FUSE request per RPC between the DPU
//! gateway and a remote engine. A request frame carries the input segments
//! by value and the output segments by length only:
//!
//! ```text
//! u32 in_iovcnt
//! for each in-iov:  u64 iov_len, u8[iov_len] iov_data
//! u32 out_iovcnt
//! for each out-iov: u64 iov_len
//! ```
//!
//! The reply is the concatenation of the reply bytes in the declared
//! out-iov order, resized to `fuse_out_header.len` (or empty for reply-less
//! requests such as FORGET). Peers are assumed to share endianness, so
//! fields are encoded native-endian.

use crate::hal::SgBuf;
use crate::ll::reply::load_out_header;

/// Maximum framed request/response size: the 1 MiB max block size worth of
/// 4k pages plus 4 pages of per-request overhead, doubled for headroom.
pub fn max_frame_size() -> usize {
    2 * 1024 * 1024 + 4 * page_size::get()
}

/// Upper bound on segments per direction (256 descriptors of a 1 MiB
/// request plus header overhead).
pub const MAX_IOVCNT: usize = 256 + 4;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("frame larger than the negotiated maximum")]
    TooLarge,
    #[error("iovec count out of range")]
    BadIovCount,
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

struct FrameReader<'a> {
    data: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.data.len() < n {
            return Err(FrameError::Truncated);
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Frame a request for transmission.
pub fn encode_request(bufs: &SgBuf) -> Result<Vec<u8>, FrameError> {
    if bufs.in_iov.len() > MAX_IOVCNT || bufs.out_iov.len() > MAX_IOVCNT {
        return Err(FrameError::BadIovCount);
    }
    let mut frame = Vec::new();
    put_u32(&mut frame, bufs.in_iov.len() as u32);
    for seg in &bufs.in_iov {
        put_u64(&mut frame, seg.len() as u64);
        frame.extend_from_slice(seg);
    }
    put_u32(&mut frame, bufs.out_iov.len() as u32);
    for seg in &bufs.out_iov {
        put_u64(&mut frame, seg.len() as u64);
    }
    if frame.len() > max_frame_size() {
        return Err(FrameError::TooLarge);
    }
    Ok(frame)
}

/// Reconstruct a request from a received frame, allocating the output
/// segments at their declared lengths.
pub fn decode_request(frame: &[u8]) -> Result<SgBuf, FrameError> {
    if frame.len() > max_frame_size() {
        return Err(FrameError::TooLarge);
    }
    let mut r = FrameReader { data: frame };

    let in_iovcnt = r.u32()? as usize;
    if in_iovcnt > MAX_IOVCNT {
        return Err(FrameError::BadIovCount);
    }
    let mut in_iov = Vec::with_capacity(in_iovcnt);
    for _ in 0..in_iovcnt {
        let len = r.u64()? as usize;
        in_iov.push(r.take(len)?.to_vec());
    }

    let out_iovcnt = r.u32()? as usize;
    if out_iovcnt > MAX_IOVCNT {
        return Err(FrameError::BadIovCount);
    }
    let mut out_iov = Vec::with_capacity(out_iovcnt);
    let mut out_total = 0usize;
    for _ in 0..out_iovcnt {
        let len = r.u64()? as usize;
        out_total = out_total.saturating_add(len);
        if out_total > max_frame_size() {
            return Err(FrameError::TooLarge);
        }
        out_iov.push(vec![0u8; len]);
    }

    Ok(SgBuf { in_iov, out_iov })
}

/// Frame the reply of a completed request: reply bytes in declared out-iov
/// order, resized to what the engine accounted in the output header.
pub fn encode_reply(bufs: &SgBuf) -> Vec<u8> {
    // Reply-less requests still produce an (empty) RPC response so the
    // gateway can register the completion.
    if bufs.out_iov.is_empty() {
        return Vec::new();
    }
    let len = load_out_header(&bufs.out_iov[0]).len as usize;
    let mut reply = Vec::with_capacity(len);
    for seg in &bufs.out_iov {
        if reply.len() >= len {
            break;
        }
        let take = seg.len().min(len - reply.len());
        reply.extend_from_slice(&seg[..take]);
    }
    reply
}

/// Scatter a received reply back into the gateway-side output segments.
pub fn decode_reply(reply: &[u8], bufs: &mut SgBuf) {
    let mut rem = reply;
    for seg in bufs.out_iov.iter_mut() {
        if rem.is_empty() {
            break;
        }
        let take = rem.len().min(seg.len());
        seg[..take].copy_from_slice(&rem[..take]);
        rem = &rem[take..];
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ll::reply::{add_out_len, init_out_header};

    #[test]
    fn request_roundtrip() {
        let bufs = SgBuf {
            in_iov: vec![vec![1, 2, 3], vec![], vec![4]],
            out_iov: vec![vec![0; 16], vec![0; 4096]],
        };
        let frame = encode_request(&bufs).unwrap();
        let decoded = decode_request(&frame).unwrap();
        assert_eq!(decoded.in_iov, bufs.in_iov);
        assert_eq!(decoded.out_iov.len(), 2);
        assert_eq!(decoded.out_iov[0].len(), 16);
        assert_eq!(decoded.out_iov[1].len(), 4096);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bufs = SgBuf {
            in_iov: vec![vec![9; 32]],
            out_iov: vec![vec![0; 8]],
        };
        let frame = encode_request(&bufs).unwrap();
        for cut in [0, 3, 11, frame.len() - 1] {
            assert_eq!(decode_request(&frame[..cut]), Err(FrameError::Truncated));
        }
    }

    #[test]
    fn reply_is_truncated_to_header_len() {
        let mut bufs = SgBuf {
            in_iov: vec![],
            out_iov: vec![vec![0; 16], vec![0xab; 64]],
        };
        init_out_header(&mut bufs.out_iov[0], 1);
        add_out_len(&mut bufs.out_iov[0], 8);
        let reply = encode_reply(&bufs);
        assert_eq!(reply.len(), 16 + 8);

        let mut gw = SgBuf {
            in_iov: vec![],
            out_iov: vec![vec![0; 16], vec![0; 64]],
        };
        decode_reply(&reply, &mut gw);
        assert_eq!(&gw.out_iov[1][..8], &[0xab; 8]);
        assert_eq!(&gw.out_iov[1][8..], &[0; 56]);
    }

    #[test]
    fn replyless_request_has_empty_reply() {
        let bufs = SgBuf {
            in_iov: vec![vec![1]],
            out_iov: vec![],
        };
        assert!(encode_reply(&bufs).is_empty());
    }
}
