//! # Overview
//!
//! parsync is the synchronization substrate of a parallel discrete-event simulation. The simulated system is split
//! across OS processes ("ranks") and worker threads within them; simulated time only stays correct if activities that
//! cross a rank boundary are exchanged at well-defined synchronization points. parsync supplies the pieces that make
//! those exchanges happen:
//!
//! * [`RankAddress`] names the (rank, thread) pair an endpoint lives on.
//! * The [`serialization`] framework turns simulation objects, including boxed trait objects, into bytes and back with
//!   a single traversal per type that runs in SIZE, PACK, and UNPACK modes.
//! * The [`transport`] module frames serialized values for point-to-point messages, broadcasts, and gathers on top of
//!   any backend implementing [`Transport`], and ships an in-process [`MemoryTransport`].
//! * An [`IpcTunnel`](tunnel::IpcTunnel) carries messages between processes on one host through named shared memory.
//! * The [`activity`] module defines what gets exchanged and the queues it lands in.
//! * A [`SyncEngine`] ties it together: once per interval, behind a pair of thread barriers, one thread per rank
//!   trades every outbound activity with every peer rank and delivers what arrives.
//!
//! The discrete-event scheduler itself is not part of parsync. It consumes the [`ActivityQueue`] contract and nothing
//! else.
//!
//! # Errors
//!
//! Every fallible operation returns [`Error`]. None of the errors are meant to be recovered from mid-run: a lost or
//! mangled cross-rank message invalidates simulated time, so the embedding program should report the error and stop.
//! Failures are also logged through [`tracing`] at the point they are detected, with the rank and operation attached;
//! install a subscriber to see them.
//!
//! # Example
//!
//! Two ranks, simulated as two threads over a [`MemoryTransport`], each register the same cross-rank link. Rank 0
//! sends one activity and rank 1 finds it in its delivery queue after the interval.
//!
//! ```
//! use parsync::activity::{shared, Activity, ActivityQueue, ActivityRegistry, Link, TimeOrderedQueue};
//! use parsync::serialization::{Serializable, Serialize, Serializer};
//! use parsync::transport::{MemoryTransport, MemoryTransportConfig};
//! use parsync::{RankAddress, SyncConfig, SyncEngine, Transport};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Default)]
//! struct Credit {
//!     time: u64,
//! }
//!
//! impl Serialize for Credit {
//!     fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> parsync::Result {
//!         self.time.serialize_order(ser)
//!     }
//! }
//! impl Serializable for Credit {}
//! impl Activity for Credit {
//!     fn delivery_time(&self) -> u64 {
//!         self.time
//!     }
//!     fn link_id(&self) -> u64 {
//!         1
//!     }
//! }
//!
//! let mut registry = ActivityRegistry::new();
//! registry.register::<Credit>(|| Box::new(Credit::default())).unwrap();
//! let registry = Arc::new(registry);
//!
//! let transports = MemoryTransport::fabric(MemoryTransportConfig::default());
//! std::thread::scope(|scope| {
//!     for transport in transports {
//!         let registry = registry.clone();
//!         scope.spawn(move || {
//!             let rank = transport.rank();
//!             let engine = SyncEngine::new(transport, registry, SyncConfig::default());
//!             let inbox = shared(TimeOrderedQueue::new());
//!             let outbound = engine
//!                 .register_link(
//!                     RankAddress::new(1 - rank, 0),
//!                     RankAddress::new(rank, 0),
//!                     1,
//!                     Link::with_delivery_queue(1, inbox.clone()),
//!                 )
//!                 .unwrap();
//!             engine.finalize_link_configurations().unwrap();
//!
//!             if rank == 0 {
//!                 outbound.lock().unwrap().insert(Box::new(Credit { time: 5 }));
//!             }
//!             engine.participants()[0].execute().unwrap();
//!
//!             let expected = if rank == 1 { 1 } else { 0 };
//!             assert_eq!(expected, inbox.lock().unwrap().len());
//!         });
//!     }
//! });
//! ```

pub mod activity;
mod error;
pub mod interfaces;
pub mod params;
pub mod rank;
pub mod serialization;
pub mod sync;
pub mod transport;
#[cfg(unix)]
pub mod tunnel;

pub use activity::{ActivityQueue, SharedQueue, SimTime};
pub use error::{Error, Result};
pub use rank::RankAddress;
pub use sync::{SyncConfig, SyncEngine, SyncParticipant, SyncPhase, SyncRole, SyncStats};
pub use transport::{MemoryTransport, Transport};
