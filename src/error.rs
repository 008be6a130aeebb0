use crate::rank::RankAddress;
use crate::sync::SyncPhase;

/// Errors that may be encountered while configuring or running the synchronization substrate.
///
/// None of these are recoverable in the middle of a run. Losing or corrupting a single cross-rank message means
/// simulated time can no longer be trusted, so every operation that fails returns one of these variants and the
/// embedding program is expected to shut the run down with the diagnostic.
///
/// The variants fall into a handful of groups:
///
/// * configuration mistakes made while wiring links: [`DuplicateLink`], [`InvalidLink`], [`WrongPhase`],
///   [`UnknownLink`];
/// * shared-memory resources: [`RegionTooSmall`], [`RegionLayout`], [`MessageTooLarge`], [`QueueIndex`], [`Os`];
/// * transport failures: [`Transport`], [`CollectiveMismatch`], [`PeerExchangeFailed`];
/// * serialization faults: [`SizeMismatch`], [`Truncated`], [`TrailingBytes`], [`UnknownTypeTag`],
///   [`UnregisteredType`], [`FactoryMismatch`], [`InvalidEncoding`].
///
/// [`DuplicateLink`]: Error::DuplicateLink
/// [`InvalidLink`]: Error::InvalidLink
/// [`WrongPhase`]: Error::WrongPhase
/// [`UnknownLink`]: Error::UnknownLink
/// [`RegionTooSmall`]: Error::RegionTooSmall
/// [`RegionLayout`]: Error::RegionLayout
/// [`MessageTooLarge`]: Error::MessageTooLarge
/// [`QueueIndex`]: Error::QueueIndex
/// [`Os`]: Error::Os
/// [`Transport`]: Error::Transport
/// [`CollectiveMismatch`]: Error::CollectiveMismatch
/// [`PeerExchangeFailed`]: Error::PeerExchangeFailed
/// [`SizeMismatch`]: Error::SizeMismatch
/// [`Truncated`]: Error::Truncated
/// [`TrailingBytes`]: Error::TrailingBytes
/// [`UnknownTypeTag`]: Error::UnknownTypeTag
/// [`UnregisteredType`]: Error::UnregisteredType
/// [`FactoryMismatch`]: Error::FactoryMismatch
/// [`InvalidEncoding`]: Error::InvalidEncoding
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A link identifier was registered more than once.
    #[error("link {link_id} is already registered")]
    DuplicateLink {
        /// The offending link identifier.
        link_id: u64,
    },

    /// A link registration named ranks that cannot be exchanged with.
    #[error("link {link_id} from {from} to {to} is invalid: {reason}")]
    InvalidLink {
        link_id: u64,
        from: RankAddress,
        to: RankAddress,
        reason: &'static str,
    },

    /// An engine operation was invoked in a phase that does not permit it.
    #[error("{operation} is not allowed while the engine is {phase:?}")]
    WrongPhase {
        operation: &'static str,
        phase: SyncPhase,
    },

    /// An inbound activity named a link that was never registered.
    #[error("received activity for unknown link {link_id} from rank {peer}")]
    UnknownLink { link_id: u64, peer: u32 },

    /// The computed region layout does not fit in the mapped segment.
    #[error("shared-memory region needs {required} bytes but only {available} were reserved")]
    RegionTooSmall { required: usize, available: usize },

    /// An existing region does not carry the layout this process expects.
    #[error("shared-memory region {name} has an incompatible layout: {reason}")]
    RegionLayout { name: String, reason: String },

    /// A serialized message does not fit in one tunnel slot.
    #[error("message of {size} bytes does not fit in a {slot_size}-byte slot")]
    MessageTooLarge { size: usize, slot_size: usize },

    /// A tunnel queue index is out of range.
    #[error("queue index {index} out of range for {count} queues")]
    QueueIndex { index: usize, count: usize },

    /// An operating-system call failed.
    #[error("{operation} failed: {message}")]
    Os { operation: &'static str, message: String },

    /// The transport layer failed to move bytes.
    #[error("transport failure on rank {rank}: {message}")]
    Transport { rank: u32, message: String },

    /// Participants of a collective operation disagree about which collective is running.
    #[error("rank {rank} expected {expected} but peer {peer} issued {found}")]
    CollectiveMismatch {
        rank: u32,
        peer: u32,
        expected: &'static str,
        found: &'static str,
    },

    /// The exchanging thread of this rank failed during the current interval.
    #[error("exchange failed on rank {rank}: {message}")]
    PeerExchangeFailed { rank: u32, message: String },

    /// The SIZE pass disagreed with the byte count produced by PACK.
    #[error("size pass computed {computed} bytes but pack produced {packed}")]
    SizeMismatch { computed: usize, packed: usize },

    /// UNPACK ran past the end of its input.
    #[error("needed {needed} more bytes at offset {offset} but only {available} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// UNPACK finished with input left over.
    #[error("{remaining} unconsumed bytes after unpacking")]
    TrailingBytes { remaining: usize },

    /// A polymorphic stream carried a tag no registered type owns.
    #[error("unknown type tag {tag}")]
    UnknownTypeTag { tag: u32 },

    /// A polymorphic value's concrete type was never registered.
    #[error("type {type_name} is not registered")]
    UnregisteredType { type_name: &'static str },

    /// A type was registered with a factory that builds a different type.
    #[error("factory registered for {registered} builds {constructed}")]
    FactoryMismatch {
        registered: &'static str,
        constructed: &'static str,
    },

    /// Bytes were read that do not decode to a valid value.
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

impl Error {
    pub(crate) fn os(operation: &'static str) -> Self {
        Self::Os {
            operation,
            message: std::io::Error::last_os_error().to_string(),
        }
    }
}

/// [`std::result::Result`]`<T, `[`parsync::Error`]`>`
///
/// A type alias that simplifies the signatures of fallible functions in parsync. Operations that produce nothing on
/// success use the default `()`.
///
/// [`parsync::Error`]: Error
pub type Result<T = ()> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failing_operation() {
        let err = Error::WrongPhase {
            operation: "register_link",
            phase: SyncPhase::SteadyStateSync,
        };
        assert_eq!(
            "register_link is not allowed while the engine is SteadyStateSync",
            err.to_string(),
            "unexpected diagnostic"
        );
    }

    #[test]
    fn size_mismatch_reports_both_counts() {
        let err = Error::SizeMismatch { computed: 8, packed: 12 };
        assert!(err.to_string().contains("8"), "computed size missing from message");
        assert!(err.to_string().contains("12"), "packed size missing from message");
    }
}
