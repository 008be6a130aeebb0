use super::{Activity, ActivityQueue};
use tracing::error;

/// A queue that must never be used.
///
/// Links are wired to one of these until their real delivery queue is known, so that an activity sent down a link that
/// was never configured fails immediately instead of vanishing. Every operation logs the configured message at error
/// level and then panics with it.
#[derive(Debug, Clone)]
pub struct UninitializedQueue {
    message: String,
}

impl UninitializedQueue {
    /// Create a guard queue that reports `message` when touched.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn misuse(&self, operation: &'static str) -> ! {
        error!(operation, message = %self.message, "uninitialized activity queue used");
        panic!("{} (UninitializedQueue::{})", self.message, operation);
    }
}

impl ActivityQueue for UninitializedQueue {
    fn insert(&mut self, _: Box<dyn Activity>) {
        self.misuse("insert")
    }

    fn pop(&mut self) -> Option<Box<dyn Activity>> {
        self.misuse("pop")
    }

    fn front(&self) -> Option<&dyn Activity> {
        self.misuse("front")
    }

    fn is_empty(&self) -> bool {
        self.misuse("is_empty")
    }

    fn len(&self) -> usize {
        self.misuse("len")
    }
}
