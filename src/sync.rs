//! Barrier-synchronized exchange of activities between ranks.
//!
//! A [`SyncEngine`] owns one rank's side of every cross-rank link. Simulated components insert activities bound for
//! another rank into the outbound queue that [`register_link()`] handed them. Once per synchronization interval every
//! local thread calls [`SyncParticipant::execute()`]: all threads meet at a barrier, the single [`SyncRole::Exchanger`]
//! drains the outbound queues, trades bytes with each peer rank, and delivers what arrived into the local links'
//! queues, and then a second barrier releases everyone. No thread leaves an interval before every inbound activity of
//! that interval has been delivered.
//!
//! An engine moves through its [`SyncPhase`]s in one direction only. Links are registered while
//! [`Configuring`](SyncPhase::Configuring); initialization data may then be traded with
//! [`exchange_link_init_data()`]; [`finalize_link_configurations()`] freezes the link table and enables
//! [`execute()`](SyncParticipant::execute); [`terminate()`] ends the run. Calling an operation in a phase that does not
//! allow it returns [`Error::WrongPhase`].
//!
//! [`register_link()`]: SyncEngine::register_link
//! [`exchange_link_init_data()`]: SyncEngine::exchange_link_init_data
//! [`finalize_link_configurations()`]: SyncEngine::finalize_link_configurations
//! [`terminate()`]: SyncEngine::terminate

mod comm_pair;
mod sync_queue;

pub use sync_queue::SyncQueue;

use crate::activity::{ActivityRegistry, Link, LinkId, SharedQueue};
use crate::rank::RankAddress;
use crate::transport::{self, Tag, Transport, LENGTH_PREFIX};
use crate::Error;
use comm_pair::CommPair;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Formatter;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

const SIZE_TAG: Tag = 1;
const DATA_TAG: Tag = 2;

/// Lifecycle of a [`SyncEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncPhase {
    /// Links may be registered.
    Configuring,
    /// Initialization data is being traded; the set of links is fixed.
    ExchangingInitData,
    /// The link table is frozen and intervals may be executed.
    SteadyStateSync,
    /// The run is over.
    Terminated,
}

/// What a local thread does during [`SyncParticipant::execute()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    /// Performs all transport I/O for the rank.
    Exchanger,
    /// Waits at the barriers while the exchanger works.
    Follower,
}

/// Settings for a [`SyncEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Local threads that take part in every interval. Defaults to 1.
    pub threads: usize,
    /// Bytes preallocated for each peer's send and receive buffers. Defaults to 4096.
    pub initial_buffer_size: usize,
}

impl SyncConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_initial_buffer_size(mut self, initial_buffer_size: usize) -> Self {
        self.initial_buffer_size = initial_buffer_size;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            initial_buffer_size: 4096,
        }
    }
}

/// Running totals kept by the exchanging thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Steady-state intervals completed.
    pub intervals: u64,
    /// Initialization rounds completed.
    pub init_rounds: u64,
    pub activities_sent: u64,
    pub activities_delivered: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Time spent waiting on the transport.
    pub transport_time: Duration,
    /// Time spent unpacking and delivering inbound activities.
    pub deserialize_time: Duration,
}

/// The link table: open for registration, then frozen into a sorted, read-only form.
#[derive(Debug)]
enum LinkTable {
    Open(HashMap<LinkId, Link>),
    Frozen(Box<[(LinkId, Link)]>),
}

impl LinkTable {
    fn get(&self, link_id: LinkId) -> Option<&Link> {
        match self {
            LinkTable::Open(links) => links.get(&link_id),
            LinkTable::Frozen(links) => links
                .binary_search_by_key(&link_id, |(id, _)| *id)
                .ok()
                .map(|index| &links[index].1),
        }
    }

    fn len(&self) -> usize {
        match self {
            LinkTable::Open(links) => links.len(),
            LinkTable::Frozen(links) => links.len(),
        }
    }
}

#[derive(Debug)]
struct EngineState {
    phase: SyncPhase,
    links: LinkTable,
    peers: BTreeMap<u32, CommPair>,
    stats: SyncStats,
}

impl EngineState {
    fn require(&self, operation: &'static str, allowed: &[SyncPhase]) -> crate::Result {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(Error::WrongPhase {
                operation,
                phase: self.phase,
            })
        }
    }
}

/// One rank's synchronization engine.
///
/// The engine is generic over its [`Transport`]; all inter-rank traffic goes through it, and only ever from one
/// thread at a time. Every rank of a run must register the same activity types, in the same order, in the
/// [`ActivityRegistry`] it passes in.
pub struct SyncEngine<T>
where
    T: Transport,
{
    transport: T,
    registry: Arc<ActivityRegistry>,
    config: SyncConfig,
    barrier: Barrier,
    state: Mutex<EngineState>,
    failure: Mutex<Option<String>>,
}

impl<T> SyncEngine<T>
where
    T: Transport,
{
    /// Construct an engine in [`SyncPhase::Configuring`] with no links.
    pub fn new(transport: T, registry: Arc<ActivityRegistry>, config: SyncConfig) -> Self {
        let threads = config.threads.max(1);
        Self {
            transport,
            registry,
            config: SyncConfig { threads, ..config },
            barrier: Barrier::new(threads),
            state: Mutex::new(EngineState {
                phase: SyncPhase::Configuring,
                links: LinkTable::Open(HashMap::new()),
                peers: BTreeMap::new(),
                stats: SyncStats::default(),
            }),
            failure: Mutex::new(None),
        }
    }

    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .expect("sync engine state mutex should not have been poisoned")
    }

    pub fn rank(&self) -> u32 {
        self.transport.rank()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn phase(&self) -> SyncPhase {
        self.state().phase
    }

    /// Snapshot of the running totals.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn stats(&self) -> SyncStats {
        self.state().stats.clone()
    }

    /// Remote ranks this engine exchanges with, ascending.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn peers(&self) -> Vec<u32> {
        self.state().peers.keys().copied().collect()
    }

    /// Number of registered links.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    /// Bytes currently held by the per-peer send and receive buffers.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn data_size(&self) -> usize {
        self.state().peers.values().map(CommPair::data_size).sum()
    }

    /// Register the local end of a cross-rank link.
    ///
    /// Activities arriving from `to_rank`'s rank tagged with `link_id` are delivered into `link`. The returned queue is
    /// where activities bound for `to_rank`'s rank must be inserted; it is shared by every link to that rank.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPhase`] outside [`SyncPhase::Configuring`], [`Error::DuplicateLink`] if `link_id` is
    /// already registered, and [`Error::InvalidLink`] if either address is unassigned, `from_rank` is not this rank,
    /// or `to_rank` is this rank or outside the run.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn register_link(
        &self,
        to_rank: RankAddress,
        from_rank: RankAddress,
        link_id: LinkId,
        link: Link,
    ) -> crate::Result<SharedQueue> {
        let mut guard = self.state();
        let state = &mut *guard;
        state.require("register_link", &[SyncPhase::Configuring])?;

        let invalid = |reason| Error::InvalidLink {
            link_id,
            from: from_rank,
            to: to_rank,
            reason,
        };
        if !to_rank.is_assigned() || !from_rank.is_assigned() {
            return Err(invalid("both ends must be assigned to a rank"));
        }
        if from_rank.rank != self.rank() {
            return Err(invalid("the source is not on this rank"));
        }
        if to_rank.rank == self.rank() {
            return Err(invalid("the destination is on this rank"));
        }
        if to_rank.rank >= self.transport.size() {
            return Err(invalid("the destination rank is not part of the run"));
        }

        let LinkTable::Open(links) = &mut state.links else {
            return Err(Error::WrongPhase {
                operation: "register_link",
                phase: state.phase,
            });
        };
        if links.contains_key(&link_id) {
            return Err(Error::DuplicateLink { link_id });
        }
        links.insert(link_id, link);

        let initial_buffer_size = self.config.initial_buffer_size;
        let pair = state
            .peers
            .entry(to_rank.rank)
            .or_insert_with(|| CommPair::new(initial_buffer_size));
        trace!(rank = self.rank(), peer = to_rank.rank, link_id, "registered link");
        Ok(pair.outbound().clone())
    }

    /// Trade initialization data for up to `rounds` rounds and return how many activities were delivered across
    /// all ranks. Every rank must call this collectively with the same `rounds`, and every rank gets the same
    /// answer; stopping early on a round in which nothing moved anywhere, so a return of zero means no data flowed.
    ///
    /// Registration is closed once this has been called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPhase`] after [`finalize_link_configurations()`], and any transport, serialization, or
    /// delivery error from the exchange.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    ///
    /// [`finalize_link_configurations()`]: SyncEngine::finalize_link_configurations
    pub fn exchange_link_init_data(&self, rounds: usize) -> crate::Result<usize> {
        let mut state = self.state();
        state.require(
            "exchange_link_init_data",
            &[SyncPhase::Configuring, SyncPhase::ExchangingInitData],
        )?;
        state.phase = SyncPhase::ExchangingInitData;

        let mut total = 0u64;
        for round in 0..rounds {
            let delivered = self
                .exchange(&mut state)
                .map_err(|err| self.report("exchange_link_init_data", err))?;
            state.stats.init_rounds += 1;

            let mut local = delivered as u64;
            let global: u64 = transport::all_gather(&self.transport, &mut local)
                .map_err(|err| self.report("exchange_link_init_data", err))?
                .iter()
                .sum();
            debug!(rank = self.rank(), round, delivered, global, "init data round complete");
            total += global;
            if global == 0 {
                break;
            }
        }
        Ok(total as usize)
    }

    /// Freeze the link table. Allowed exactly once, before the first interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPhase`] if the table is already frozen or the engine was terminated.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn finalize_link_configurations(&self) -> crate::Result {
        let mut guard = self.state();
        let state = &mut *guard;
        state.require(
            "finalize_link_configurations",
            &[SyncPhase::Configuring, SyncPhase::ExchangingInitData],
        )?;

        if let LinkTable::Open(links) = &mut state.links {
            let mut frozen: Vec<_> = links.drain().collect();
            frozen.sort_unstable_by_key(|(id, _)| *id);
            state.links = LinkTable::Frozen(frozen.into_boxed_slice());
        }
        state.phase = SyncPhase::SteadyStateSync;
        debug!(rank = self.rank(), links = state.links.len(), peers = state.peers.len(), "link configuration final");
        Ok(())
    }

    /// End the run. Later calls of any phase-checked operation fail.
    ///
    /// # Panics
    ///
    /// Panics if the engine state's [`Mutex`] has been poisoned.
    pub fn terminate(&self) {
        let mut state = self.state();
        debug!(rank = self.rank(), from = ?state.phase, "sync engine terminated");
        state.phase = SyncPhase::Terminated;
    }

    /// Handles for the local threads, one per configured thread. The first handle is the
    /// [`Exchanger`](SyncRole::Exchanger).
    pub fn participants(&self) -> Vec<SyncParticipant<'_, T>> {
        (0..self.config.threads)
            .map(|thread| SyncParticipant {
                engine: self,
                thread: thread as u32,
                role: if thread == 0 {
                    SyncRole::Exchanger
                } else {
                    SyncRole::Follower
                },
            })
            .collect()
    }

    fn report(&self, operation: &'static str, err: Error) -> Error {
        error!(rank = self.rank(), operation, %err, "synchronization failed");
        err
    }

    /// Trade every peer's outbound activities and deliver what arrives. Returns the number delivered locally.
    fn exchange(&self, state: &mut EngineState) -> crate::Result<usize> {
        let EngineState {
            links, peers, stats, ..
        } = state;
        let rank = self.rank();
        let mut delivered = 0;

        for (&peer, pair) in peers.iter_mut() {
            let sent = pair.pack(&self.registry)?;

            let transport_started = Instant::now();
            self.transport
                .send_bytes(peer, SIZE_TAG, &(pair.local_size as u64).to_le_bytes())?;
            let mut prefix = [0; LENGTH_PREFIX];
            self.transport.recv_bytes(peer, SIZE_TAG, &mut prefix)?;
            let remote_size = usize::try_from(u64::from_le_bytes(prefix)).map_err(|_| Error::Transport {
                rank,
                message: format!("peer {peer} announced an impossible size"),
            })?;

            if pair.local_size > 0 {
                transport::send_fragments(&self.transport, peer, DATA_TAG, pair.packed())?;
            }
            let inbound = pair.receive_space(remote_size);
            if remote_size > 0 {
                transport::recv_fragments(&self.transport, peer, DATA_TAG, inbound)?;
            }
            stats.transport_time += transport_started.elapsed();

            let deserialize_started = Instant::now();
            let activities = pair.unpack(&self.registry)?;
            let received = activities.len();
            for activity in activities {
                let link_id = activity.link_id();
                let link = links.get(link_id).ok_or(Error::UnknownLink { link_id, peer })?;
                link.deliver(activity);
            }
            stats.deserialize_time += deserialize_started.elapsed();

            trace!(
                rank,
                peer,
                sent,
                received,
                bytes_out = pair.local_size,
                bytes_in = remote_size,
                "exchanged with peer"
            );
            stats.activities_sent += sent as u64;
            stats.activities_delivered += received as u64;
            stats.bytes_sent += pair.local_size as u64;
            stats.bytes_received += remote_size as u64;
            delivered += received;
        }
        Ok(delivered)
    }

    fn run_interval(&self, thread: u32) -> crate::Result {
        let mut state = self.state();
        let result = self.exchange(&mut state);
        match &result {
            Ok(delivered) => {
                state.stats.intervals += 1;
                debug!(rank = self.rank(), thread, delivered, interval = state.stats.intervals, "interval exchanged");
            },
            Err(err) => {
                error!(rank = self.rank(), thread, operation = "execute", %err, "interval exchange failed");
            },
        }
        result.map(|_| ())
    }
}

impl<T> std::fmt::Debug for SyncEngine<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("rank", &self.rank())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// One local thread's handle on a [`SyncEngine`].
pub struct SyncParticipant<'a, T>
where
    T: Transport,
{
    engine: &'a SyncEngine<T>,
    thread: u32,
    role: SyncRole,
}

impl<T> SyncParticipant<'_, T>
where
    T: Transport,
{
    pub fn thread(&self) -> u32 {
        self.thread
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    /// Take part in one synchronization interval. Every participant of the engine must call this once per interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPhase`] outside [`SyncPhase::SteadyStateSync`]. The exchanger returns whatever error
    /// ended its exchange; every follower of the same interval then receives [`Error::PeerExchangeFailed`] carrying
    /// its description.
    ///
    /// # Panics
    ///
    /// Panics if one of the engine's [`Mutex`]es has been poisoned.
    pub fn execute(&self) -> crate::Result {
        let engine = self.engine;
        engine.state().require("execute", &[SyncPhase::SteadyStateSync])?;

        engine.barrier.wait();
        let result = match self.role {
            SyncRole::Exchanger => {
                let result = engine.run_interval(self.thread);
                *engine
                    .failure
                    .lock()
                    .expect("failure slot mutex should not have been poisoned") =
                    result.as_ref().err().map(ToString::to_string);
                result
            },
            SyncRole::Follower => Ok(()),
        };
        engine.barrier.wait();

        match self.role {
            SyncRole::Exchanger => result,
            SyncRole::Follower => match &*engine
                .failure
                .lock()
                .expect("failure slot mutex should not have been poisoned")
            {
                Some(message) => Err(Error::PeerExchangeFailed {
                    rank: engine.rank(),
                    message: message.clone(),
                }),
                None => Ok(()),
            },
        }
    }
}

impl<T> std::fmt::Debug for SyncParticipant<'_, T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("SyncParticipant")
            .field("rank", &self.engine.rank())
            .field("thread", &self.thread)
            .field("role", &self.role)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::{tick, Tick};
    use crate::activity::{shared, TimeOrderedQueue};
    use crate::transport::{MemoryTransport, MemoryTransportConfig};
    use std::thread;

    fn registry() -> Arc<ActivityRegistry> {
        let mut registry = ActivityRegistry::new();
        registry.register::<Tick>(|| Box::new(Tick::default())).unwrap();
        Arc::new(registry)
    }

    fn engines(ranks: u32, threads: usize) -> Vec<SyncEngine<MemoryTransport>> {
        let registry = registry();
        MemoryTransport::fabric(MemoryTransportConfig::default().with_participants(ranks))
            .into_iter()
            .map(|transport| {
                SyncEngine::new(
                    transport,
                    registry.clone(),
                    SyncConfig::default().with_threads(threads),
                )
            })
            .collect()
    }

    #[test]
    fn registration_rejects_bad_links() {
        let engines = engines(2, 1);
        let engine = &engines[0];
        let here = RankAddress::new(0, 0);
        let there = RankAddress::new(1, 0);

        engine.register_link(there, here, 1, Link::new(1)).unwrap();
        assert_eq!(
            Err(Error::DuplicateLink { link_id: 1 }),
            engine.register_link(there, here, 1, Link::new(1)).map(|_| ())
        );
        assert!(matches!(
            engine.register_link(RankAddress::new(0, 1), here, 2, Link::new(2)),
            Err(Error::InvalidLink { link_id: 2, .. })
        ));
        assert!(matches!(
            engine.register_link(RankAddress::unassigned(), here, 3, Link::new(3)),
            Err(Error::InvalidLink { link_id: 3, .. })
        ));
        assert!(matches!(
            engine.register_link(RankAddress::new(5, 0), here, 4, Link::new(4)),
            Err(Error::InvalidLink { link_id: 4, .. })
        ));
        assert_eq!(1, engine.link_count());
        assert_eq!(vec![1], engine.peers());
    }

    #[test]
    fn links_to_one_peer_share_an_outbound_queue() {
        let engines = engines(2, 1);
        let here = RankAddress::new(0, 0);
        let first = engines[0]
            .register_link(RankAddress::new(1, 0), here, 1, Link::new(1))
            .unwrap();
        let second = engines[0]
            .register_link(RankAddress::new(1, 3), here, 2, Link::new(2))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn phases_only_move_forward() {
        let engines = engines(1, 1);
        let engine = &engines[0];
        assert_eq!(
            Err(Error::WrongPhase {
                operation: "execute",
                phase: SyncPhase::Configuring
            }),
            engine.participants()[0].execute()
        );

        engine.finalize_link_configurations().unwrap();
        assert_eq!(SyncPhase::SteadyStateSync, engine.phase());
        assert!(matches!(
            engine.finalize_link_configurations(),
            Err(Error::WrongPhase { .. })
        ));
        assert!(matches!(
            engine.register_link(RankAddress::new(0, 0), RankAddress::new(0, 0), 1, Link::new(1)),
            Err(Error::WrongPhase { .. })
        ));

        engine.terminate();
        assert!(matches!(engine.participants()[0].execute(), Err(Error::WrongPhase { .. })));
    }

    #[test]
    fn unknown_link_fails_every_participant() {
        let engines = engines(2, 2);
        let outbound = engines[0]
            .register_link(RankAddress::new(1, 0), RankAddress::new(0, 0), 1, Link::new(1))
            .unwrap();
        engines[1]
            .register_link(RankAddress::new(0, 0), RankAddress::new(1, 0), 2, Link::new(2))
            .unwrap();
        for engine in &engines {
            engine.finalize_link_configurations().unwrap();
        }
        outbound.lock().unwrap().insert(tick(1, 5, 0));

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = engines
                .iter()
                .flat_map(|engine| engine.participants())
                .map(|participant| scope.spawn(move || (participant.engine.rank(), participant.execute())))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        for (rank, result) in results {
            match rank {
                0 => assert_eq!(Ok(()), result),
                _ => assert!(
                    matches!(
                        result,
                        Err(Error::UnknownLink { link_id: 1, peer: 0 }) | Err(Error::PeerExchangeFailed { rank: 1, .. })
                    ),
                    "unexpected result {result:?}"
                ),
            }
        }
    }

    #[test]
    fn init_data_rounds_stop_at_a_fixed_point() {
        let engines = engines(2, 1);
        let delivery = shared(TimeOrderedQueue::new());
        let outbound = engines[0]
            .register_link(RankAddress::new(1, 0), RankAddress::new(0, 0), 7, Link::new(7))
            .unwrap();
        engines[1]
            .register_link(
                RankAddress::new(0, 0),
                RankAddress::new(1, 0),
                7,
                Link::with_delivery_queue(7, delivery.clone()),
            )
            .unwrap();
        outbound.lock().unwrap().insert(tick(7, 0, 1));
        outbound.lock().unwrap().insert(tick(7, 0, 2));

        let totals: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = engines
                .iter()
                .map(|engine| scope.spawn(move || engine.exchange_link_init_data(5).unwrap()))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(vec![2, 2], totals);
        assert_eq!(2, delivery.lock().unwrap().len());
        assert_eq!(2, engines[1].stats().init_rounds, "second round should have found nothing and stopped");
        assert_eq!(SyncPhase::ExchangingInitData, engines[0].phase());
    }
}
