use super::{Activity, ActivityQueue, SimTime};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt::Formatter;

/// Helper struct for the queue. Holds a [`Box`] to the activity alongside the data necessary to sort it within the
/// priority queue, namely the delivery time and a record of the activity's insertion sequence.
///
/// The implementation of [`Ord`] cares first about the delivery time, comparing insertion sequences only to break ties.
struct QueuedActivity {
    delivery_time: SimTime,
    activity: Box<dyn Activity>,
    insertion_sequence: usize,
}

impl PartialEq<Self> for QueuedActivity {
    fn eq(&self, other: &Self) -> bool {
        self.insertion_sequence == other.insertion_sequence && self.delivery_time == other.delivery_time
    }
}

impl Eq for QueuedActivity {}

impl PartialOrd<Self> for QueuedActivity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedActivity {
    fn cmp(&self, other: &Self) -> Ordering {
        let comparison = self.delivery_time.cmp(&other.delivery_time);
        match comparison {
            Ordering::Equal => self.insertion_sequence.cmp(&other.insertion_sequence),
            _ => comparison,
        }
    }
}

impl std::fmt::Debug for QueuedActivity {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("QueuedActivity")
            .field("activity", &self.activity)
            .field("delivery_time", &self.delivery_time)
            .field("insertion_sequence", &self.insertion_sequence)
            .finish()
    }
}

/// Priority queue of activities awaiting delivery.
///
/// Activities pop in ascending order of delivery time, with ties broken by the order in which they were inserted. The
/// tiebreaker is what preserves a single source's send order when several activities from one sync interval share a
/// delivery time.
#[derive(Debug, Default)]
pub struct TimeOrderedQueue {
    activities: BinaryHeap<Reverse<QueuedActivity>>,
    activities_added: usize,
}

impl TimeOrderedQueue {
    /// Construct an empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityQueue for TimeOrderedQueue {
    fn insert(&mut self, activity: Box<dyn Activity>) {
        let insertion_sequence = self.activities_added;
        self.activities_added += 1;
        self.activities.push(Reverse(QueuedActivity {
            delivery_time: activity.delivery_time(),
            activity,
            insertion_sequence,
        }));
    }

    fn pop(&mut self) -> Option<Box<dyn Activity>> {
        self.activities.pop().map(|Reverse(queued)| queued.activity)
    }

    fn front(&self) -> Option<&dyn Activity> {
        self.activities.peek().map(|queued| &*queued.0.activity)
    }

    fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    fn len(&self) -> usize {
        self.activities.len()
    }
}

impl std::fmt::Display for TimeOrderedQueue {
    fn fmt(&self, formatter: &mut Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "TimeOrderedQueue with {} pending activities",
            self.activities.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::tick;
    use crate::activity::LinkId;

    fn drain_values(queue: &mut TimeOrderedQueue) -> Vec<(SimTime, LinkId)> {
        std::iter::from_fn(|| queue.pop())
            .map(|activity| (activity.delivery_time(), activity.link_id()))
            .collect()
    }

    #[test]
    fn delivery_time_ascends() {
        let mut queue = TimeOrderedQueue::new();
        queue.insert(tick(1, 1, 0));
        queue.insert(tick(2, 3, 0));
        queue.insert(tick(3, 2, 0));

        let expected = vec![(1, 1), (2, 3), (3, 2)];
        assert_eq!(expected, drain_values(&mut queue), "activities popped in wrong order");
    }

    #[test]
    fn insertion_sequence_breaks_ties_in_delivery_time() {
        const NUM_ACTIVITIES: u64 = 10;
        let mut queue = TimeOrderedQueue::new();
        for link in 0..NUM_ACTIVITIES {
            queue.insert(tick(link, 1, 0));
        }

        let expected: Vec<_> = (0..NUM_ACTIVITIES).map(|link| (1, link)).collect();
        assert_eq!(expected, drain_values(&mut queue), "activities popped out of insertion sequence");
    }

    #[test]
    fn front_shows_the_next_activity_without_removing_it() {
        let mut queue = TimeOrderedQueue::new();
        queue.insert(tick(0, 9, 0));
        queue.insert(tick(1, 7, 0));
        assert_eq!(Some(7), queue.front().map(|a| a.delivery_time()));
        assert_eq!(2, queue.len(), "front should not remove anything");
        queue.pop().unwrap();
        assert_eq!(Some(9), queue.front().map(|a| a.delivery_time()));
        queue.pop().unwrap();
        assert!(queue.front().is_none());
    }
}
