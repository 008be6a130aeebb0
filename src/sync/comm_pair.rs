use crate::activity::{shared, Activity, ActivityRegistry, SharedQueue};
use crate::serialization;
use crate::sync::SyncQueue;

/// Everything the exchanging thread keeps about one remote rank.
///
/// Both buffers are reused from interval to interval and only ever grow.
#[derive(Debug)]
pub(crate) struct CommPair {
    outbound: SharedQueue,
    send_buffer: Vec<u8>,
    recv_buffer: Vec<u8>,
    pub(crate) local_size: usize,
    pub(crate) remote_size: usize,
}

impl CommPair {
    pub(crate) fn new(initial_buffer_size: usize) -> Self {
        Self {
            outbound: shared(SyncQueue::new()),
            send_buffer: Vec::with_capacity(initial_buffer_size),
            recv_buffer: vec![0; initial_buffer_size],
            local_size: 0,
            remote_size: 0,
        }
    }

    pub(crate) fn outbound(&self) -> &SharedQueue {
        &self.outbound
    }

    /// Drain the outbound queue into the send buffer. Returns how many activities were packed; when there are none
    /// the local size is zero and nothing needs to be sent.
    ///
    /// # Panics
    ///
    /// Panics if the outbound queue's [`Mutex`] has been poisoned.
    ///
    /// [`Mutex`]: std::sync::Mutex
    pub(crate) fn pack(&mut self, registry: &ActivityRegistry) -> crate::Result<usize> {
        let mut activities: Vec<Box<dyn Activity>> = {
            let mut outbound = self
                .outbound
                .lock()
                .expect("outbound queue mutex should not have been poisoned");
            let drained = std::iter::from_fn(|| outbound.pop()).collect();
            drained
        };

        self.local_size = if activities.is_empty() {
            self.send_buffer.clear();
            0
        } else {
            serialization::pack_with(&mut self.send_buffer, |ser| registry.apply_seq(&mut activities, ser))?
        };
        Ok(activities.len())
    }

    pub(crate) fn packed(&self) -> &[u8] {
        &self.send_buffer[..self.local_size]
    }

    /// Make room for `remote_size` inbound bytes and return the slice to receive them into.
    pub(crate) fn receive_space(&mut self, remote_size: usize) -> &mut [u8] {
        self.remote_size = remote_size;
        if remote_size > self.recv_buffer.len() {
            self.recv_buffer.resize(remote_size, 0);
        }
        &mut self.recv_buffer[..remote_size]
    }

    /// Rebuild the activities received this interval.
    pub(crate) fn unpack(&self, registry: &ActivityRegistry) -> crate::Result<Vec<Box<dyn Activity>>> {
        let mut activities = Vec::new();
        if self.remote_size > 0 {
            serialization::unpack_with(&self.recv_buffer[..self.remote_size], |ser| {
                registry.apply_seq(&mut activities, ser)
            })?;
        }
        Ok(activities)
    }

    /// Bytes held by both buffers.
    pub(crate) fn data_size(&self) -> usize {
        self.send_buffer.capacity() + self.recv_buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::{tick, Tick};

    fn registry() -> ActivityRegistry {
        let mut registry = ActivityRegistry::new();
        registry.register::<Tick>(|| Box::new(Tick::default())).unwrap();
        registry
    }

    #[test]
    fn empty_outbound_packs_nothing() {
        let mut pair = CommPair::new(16);
        assert_eq!(0, pair.pack(&registry()).unwrap());
        assert_eq!(0, pair.local_size);
        assert!(pair.packed().is_empty());
    }

    #[test]
    fn packed_activities_unpack_on_the_other_side() {
        let registry = registry();
        let mut sender = CommPair::new(0);
        {
            let mut outbound = sender.outbound().lock().unwrap();
            outbound.insert(tick(4, 1, 10));
            outbound.insert(tick(4, 2, 20));
        }
        assert_eq!(2, sender.pack(&registry).unwrap());
        assert!(sender.outbound().lock().unwrap().is_empty(), "outbound queue was not drained");

        let mut receiver = CommPair::new(0);
        let bytes = sender.packed().to_vec();
        receiver.receive_space(bytes.len()).copy_from_slice(&bytes);
        let times: Vec<_> = receiver
            .unpack(&registry)
            .unwrap()
            .iter()
            .map(|activity| activity.delivery_time())
            .collect();
        assert_eq!(vec![1, 2], times);
    }

    #[test]
    fn receive_buffer_grows_but_never_shrinks() {
        let mut pair = CommPair::new(8);
        assert_eq!(100, pair.receive_space(100).len());
        assert_eq!(4, pair.receive_space(4).len());
        assert_eq!(100, pair.data_size() - pair.send_buffer.capacity());
    }
}
