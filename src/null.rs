//! Null backend.
//!
//! Accepts the INIT handshake and answers every other operation with
//! `-ENOSYS`. The smallest possible implementation of the backend contract,
//! useful for probing emulated functions and as a dispatch-layer test
//! double.

use crate::dispatch::FuseOps;
use crate::ll::fuse_abi as abi;
use crate::session::{ConnInfo, Session};

#[derive(Debug, Default)]
pub struct NullFs;

impl FuseOps for NullFs {
    fn init(
        &self,
        se: &Session,
        _conn: &mut ConnInfo,
        _hdr: &abi::fuse_in_header,
        _arg: &abi::fuse_init_in,
    ) -> Result<(), i32> {
        se.set_init_done();
        Ok(())
    }
}
