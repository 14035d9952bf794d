//! DPFS: a virtio-fs device-emulation dataplane.
//!
//! Presents one or more virtio-fs functions to a host, translates the FUSE
//! low-level requests arriving over their queues and routes them to a
//! pluggable storage backend: a local directory mirrored through io_uring
//! ([`passthrough`]), a remote NFSv4.1 server with session trunking
//! ([`nfs`]), an in-memory key-value store ([`kv`]), or nothing at all
//! ([`null`]).
//!
//! The layering mirrors the deployment: [`hal`] owns devices and polling
//! threads and speaks to a transport, [`dispatch`] turns scatter-gather
//! buffers into typed backend calls, and the backends implement
//! [`dispatch::FuseOps`]. Backends reply in place or suspend the request and
//! finish it later from their own completion thread through
//! [`hal::async_complete`].

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod dispatch;
pub mod hal;
pub mod inode;
pub mod kv;
pub mod ll;
pub mod mpool;
pub mod nfs;
pub mod null;
pub mod passthrough;
pub mod session;

pub use crate::dispatch::{FuseDispatcher, FuseOps};
pub use crate::hal::config::Config;
pub use crate::hal::{async_complete, CompletionStatus, Hal};
pub use crate::session::Session;
