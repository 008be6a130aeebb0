use crate::activity::{Activity, ActivityQueue};
use std::collections::VecDeque;

/// Outbound queue of activities bound for one remote rank.
///
/// Unlike a delivery queue, this keeps plain insertion order: it only holds activities until the next exchange, and
/// sending them in the order they were produced is what lets the receiving side see one source's activities in send
/// order.
#[derive(Debug, Default)]
pub struct SyncQueue {
    activities: VecDeque<Box<dyn Activity>>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ActivityQueue for SyncQueue {
    fn insert(&mut self, activity: Box<dyn Activity>) {
        self.activities.push_back(activity);
    }

    fn pop(&mut self) -> Option<Box<dyn Activity>> {
        self.activities.pop_front()
    }

    fn front(&self) -> Option<&dyn Activity> {
        self.activities.front().map(|activity| &**activity)
    }

    fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    fn len(&self) -> usize {
        self.activities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::tick;

    #[test]
    fn keeps_insertion_order_regardless_of_time() {
        let mut queue = SyncQueue::new();
        queue.insert(tick(1, 30, 0));
        queue.insert(tick(1, 10, 1));
        queue.insert(tick(1, 20, 2));

        let times: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|activity| activity.delivery_time())
            .collect();
        assert_eq!(vec![30, 10, 20], times);
        assert!(queue.is_empty());
    }
}
