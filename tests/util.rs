#![allow(dead_code)]

use parsync::activity::{Activity, ActivityRegistry, LinkId, SimTime};
use parsync::serialization::{Serializable, Serialize, Serializer};
use parsync::transport::{MemoryTransport, MemoryTransportConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Check that a sequence of activities never goes back in time.
#[macro_export]
macro_rules! assert_non_decreasing_times {
    ($activities:expr, $msg:expr) => {{
        let times: Vec<u64> = $activities.iter().map(|activity| activity.delivery_time()).collect();
        assert!(times.windows(2).all(|pair| pair[0] <= pair[1]), "{}: {:?}", $msg, times);
    }};
}

/// Route log output through the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Activity carrying an opaque payload, used to move bytes between ranks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Packet {
    pub link_id: LinkId,
    pub delivery_time: SimTime,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn boxed(link_id: LinkId, delivery_time: SimTime, sequence: u32) -> Box<dyn Activity> {
        Box::new(Packet {
            link_id,
            delivery_time,
            sequence,
            payload: vec![sequence as u8; sequence as usize % 7],
        })
    }
}

impl Serialize for Packet {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> parsync::Result {
        self.link_id.serialize_order(ser)?;
        self.delivery_time.serialize_order(ser)?;
        self.sequence.serialize_order(ser)?;
        self.payload.serialize_order(ser)
    }
}

impl Serializable for Packet {}

impl Activity for Packet {
    fn delivery_time(&self) -> SimTime {
        self.delivery_time
    }

    fn link_id(&self) -> LinkId {
        self.link_id
    }
}

/// Second activity type, so that streams mix concrete types.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Credit {
    pub link_id: LinkId,
    pub delivery_time: SimTime,
    pub amount: i64,
    pub note: Option<String>,
}

impl Serialize for Credit {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> parsync::Result {
        self.link_id.serialize_order(ser)?;
        self.delivery_time.serialize_order(ser)?;
        self.amount.serialize_order(ser)?;
        self.note.serialize_order(ser)
    }
}

impl Serializable for Credit {}

impl Activity for Credit {
    fn delivery_time(&self) -> SimTime {
        self.delivery_time
    }

    fn link_id(&self) -> LinkId {
        self.link_id
    }
}

/// Registry that knows both test activity types. Every rank must build it the same way.
pub fn registry() -> Arc<ActivityRegistry> {
    let mut registry = ActivityRegistry::new();
    registry.register::<Packet>(|| Box::new(Packet::default())).unwrap();
    registry.register::<Credit>(|| Box::new(Credit::default())).unwrap();
    Arc::new(registry)
}

/// Run `body` once per rank of a fresh in-memory fabric, each on its own thread, and return the results by rank.
pub fn run_ranks<F, R>(config: MemoryTransportConfig, body: F) -> Vec<R>
where
    F: Fn(MemoryTransport) -> R + Sync,
    R: Send,
{
    let body = &body;
    thread::scope(|scope| {
        let handles: Vec<_> = MemoryTransport::fabric(config)
            .into_iter()
            .map(|transport| scope.spawn(move || body(transport)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("rank thread panicked"))
            .collect()
    })
}

/// A shared-memory region name no other test in this run will use.
pub fn unique_region_name(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "parsync-{prefix}-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
