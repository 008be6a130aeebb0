//! Timestamped units of simulated work and the queues that hold them.
//!
//! The scheduler that ultimately consumes activities lives outside this crate; all the synchronization engine needs
//! from it is the [`ActivityQueue`] contract. Queues are shared between the thread that delivers inbound activities
//! and the threads that consume them, so they are handed around as a [`SharedQueue`], which supplies the mutual
//! exclusion the contract itself does not.

mod time_ordered_queue;
mod uninitialized_queue;

pub use time_ordered_queue::TimeOrderedQueue;
pub use uninitialized_queue::UninitializedQueue;

use crate::serialization::{Serializable, TypeRegistry};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Simulated time, in the kernel's base time unit.
pub type SimTime = u64;

/// Identifier of a configured link. Unique across the whole simulation.
pub type LinkId = u64;

/// A timestamped unit of simulated work that can cross a rank boundary.
///
/// Activities are polymorphic: the concrete type is defined by simulation code and travels through a
/// [`TypeRegistry`] when it is exchanged between ranks. Besides being [`Serializable`], an activity only has to report
/// when it should be delivered and over which link.
pub trait Activity: Serializable {
    /// Simulated time at which the activity should be delivered to its destination.
    fn delivery_time(&self) -> SimTime;

    /// Link over which the activity travels. Decides the destination queue on the receiving rank.
    fn link_id(&self) -> LinkId;
}

/// Registry used to exchange boxed activities between ranks.
pub type ActivityRegistry = TypeRegistry<dyn Activity>;

/// Ordered container of pending activities.
///
/// This is the whole of the contract the synchronization engine relies on. Implementations decide their own ordering;
/// [`TimeOrderedQueue`] orders by delivery time, and the outbound queues inside the engine keep plain FIFO order.
pub trait ActivityQueue: Debug + Send {
    fn insert(&mut self, activity: Box<dyn Activity>);

    /// Remove and return the next activity, if any.
    fn pop(&mut self) -> Option<Box<dyn Activity>>;

    /// Peek at the next activity without removing it.
    fn front(&self) -> Option<&dyn Activity>;

    fn is_empty(&self) -> bool;

    fn len(&self) -> usize;
}

/// A queue shared between the delivering thread and its consumers.
pub type SharedQueue = Arc<Mutex<dyn ActivityQueue>>;

/// Wrap `queue` so it can be shared across threads as a [`SharedQueue`].
pub fn shared<Queue>(queue: Queue) -> SharedQueue
where
    Queue: ActivityQueue + 'static,
{
    Arc::new(Mutex::new(queue))
}

/// The receiving end of a configured link on this rank.
///
/// A link starts out wired to an [`UninitializedQueue`], which aborts loudly if anything is delivered before the real
/// delivery queue has been set. Cloning a link shares its queue.
#[derive(Debug, Clone)]
pub struct Link {
    id: LinkId,
    delivery_queue: SharedQueue,
}

impl Link {
    /// Create a link whose delivery queue has not been wired yet.
    pub fn new(id: LinkId) -> Self {
        let message = format!("link {id} received an activity before its delivery queue was set");
        Self {
            id,
            delivery_queue: shared(UninitializedQueue::new(message)),
        }
    }

    /// Create a link that delivers into `queue`.
    pub fn with_delivery_queue(id: LinkId, queue: SharedQueue) -> Self {
        Self {
            id,
            delivery_queue: queue,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn set_delivery_queue(&mut self, queue: SharedQueue) {
        self.delivery_queue = queue;
    }

    pub fn delivery_queue(&self) -> &SharedQueue {
        &self.delivery_queue
    }

    /// Insert `activity` into this link's delivery queue.
    ///
    /// # Panics
    ///
    /// Panics if the delivery queue's [`Mutex`] has been poisoned, or if the link was never wired to a real queue.
    pub fn deliver(&self, activity: Box<dyn Activity>) {
        self.delivery_queue
            .lock()
            .expect("delivery queue mutex should not have been poisoned")
            .insert(activity);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::serialization::{Serialize, Serializer};

    /// Minimal activity used by unit tests across the crate.
    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    pub(crate) struct Tick {
        pub link_id: LinkId,
        pub delivery_time: SimTime,
        pub value: u32,
    }

    impl Serialize for Tick {
        fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
            self.link_id.serialize_order(ser)?;
            self.delivery_time.serialize_order(ser)?;
            self.value.serialize_order(ser)
        }
    }
    impl Serializable for Tick {}
    impl Activity for Tick {
        fn delivery_time(&self) -> SimTime {
            self.delivery_time
        }
        fn link_id(&self) -> LinkId {
            self.link_id
        }
    }

    pub(crate) fn tick(link_id: LinkId, delivery_time: SimTime, value: u32) -> Box<dyn Activity> {
        Box::new(Tick {
            link_id,
            delivery_time,
            value,
        })
    }

    #[test]
    fn link_delivers_into_its_queue() {
        let queue = shared(TimeOrderedQueue::new());
        let link = Link::with_delivery_queue(3, queue.clone());
        link.deliver(tick(3, 10, 1));
        assert_eq!(1, queue.lock().unwrap().len());
    }

    #[test]
    #[should_panic(expected = "before its delivery queue was set")]
    fn unwired_link_aborts_on_delivery() {
        let link = Link::new(8);
        link.deliver(tick(8, 0, 0));
    }
}
