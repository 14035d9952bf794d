//! Low-level FUSE protocol pieces: wire structures, request argument
//! decomposition, scatter-gather output and reply framing.

pub mod fuse_abi;
pub(crate) mod argument;
pub mod iov;
pub mod reply;
