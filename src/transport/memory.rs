use super::{Tag, Transport, MAX_FRAGMENT};
use crate::Error;
use std::fmt::Formatter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{error, trace};

/// Settings for an in-process [`MemoryTransport`] fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTransportConfig {
    /// Number of participants, each of which gets its own handle. Defaults to 2.
    pub participants: u32,
    /// Largest payload carried by one message. Defaults to [`MAX_FRAGMENT`]; tests lower it to exercise
    /// fragmentation without allocating gigabytes.
    pub max_fragment: usize,
}

impl MemoryTransportConfig {
    pub fn with_participants(mut self, participants: u32) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_max_fragment(mut self, max_fragment: usize) -> Self {
        self.max_fragment = max_fragment;
        self
    }
}

impl Default for MemoryTransportConfig {
    fn default() -> Self {
        Self {
            participants: 2,
            max_fragment: MAX_FRAGMENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    Broadcast,
    AllGather,
}

impl Collective {
    fn name(self) -> &'static str {
        match self {
            Collective::Broadcast => "broadcast",
            Collective::AllGather => "all_gather",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Point(Tag),
    Collective { sequence: u64, kind: Collective },
}

#[derive(Debug)]
struct Envelope {
    source: u32,
    channel: Channel,
    bytes: Vec<u8>,
}

/// Inbound messages of one participant, in arrival order.
#[derive(Debug, Default)]
struct Mailbox {
    pending: Mutex<Vec<Envelope>>,
    arrived: Condvar,
}

impl Mailbox {
    fn post(&self, envelope: Envelope) {
        self.pending
            .lock()
            .expect("mailbox mutex should not have been poisoned")
            .push(envelope);
        self.arrived.notify_all();
    }

    /// Block until the oldest envelope accepted by `matches` arrives and remove it.
    fn take<F>(&self, mut matches: F) -> Envelope
    where
        F: FnMut(&Envelope) -> bool,
    {
        let mut pending = self.pending.lock().expect("mailbox mutex should not have been poisoned");
        loop {
            if let Some(position) = pending.iter().position(&mut matches) {
                return pending.remove(position);
            }
            pending = self
                .arrived
                .wait(pending)
                .expect("mailbox mutex should not have been poisoned");
        }
    }
}

#[derive(Debug)]
struct Fabric {
    mailboxes: Vec<Mailbox>,
    max_fragment: usize,
}

/// One participant's handle onto an in-process message fabric.
///
/// Every participant owns a mailbox; sending appends to the destination's mailbox and never blocks, receiving waits
/// on the caller's own mailbox for the oldest message matching the requested source and channel. Collectives are
/// built from the same envelopes, stamped with a per-participant sequence number and the kind of collective, so a
/// participant that enters a different collective than its peers gets [`Error::CollectiveMismatch`] instead of
/// silently consuming the wrong bytes.
///
/// Handles are created together by [`fabric()`] and are typically moved onto one thread each.
///
/// [`fabric()`]: MemoryTransport::fabric
pub struct MemoryTransport {
    rank: u32,
    fabric: Arc<Fabric>,
    collectives_entered: AtomicU64,
}

impl MemoryTransport {
    /// Create the handles of a new fabric, indexed by rank.
    pub fn fabric(config: MemoryTransportConfig) -> Vec<MemoryTransport> {
        let fabric = Arc::new(Fabric {
            mailboxes: (0..config.participants).map(|_| Mailbox::default()).collect(),
            max_fragment: config.max_fragment.max(1),
        });
        (0..config.participants)
            .map(|rank| MemoryTransport {
                rank,
                fabric: fabric.clone(),
                collectives_entered: AtomicU64::new(0),
            })
            .collect()
    }

    fn failure(&self, message: impl Into<String>) -> Error {
        let message = message.into();
        error!(rank = self.rank, %message, "memory transport failure");
        Error::Transport {
            rank: self.rank,
            message,
        }
    }

    fn check_participant(&self, peer: u32) -> crate::Result {
        if peer < self.size() {
            Ok(())
        } else {
            Err(self.failure(format!("participant {peer} does not exist in a fabric of {}", self.size())))
        }
    }

    fn own_mailbox(&self) -> &Mailbox {
        &self.fabric.mailboxes[self.rank as usize]
    }

    fn post(&self, destination: u32, channel: Channel, bytes: Vec<u8>) {
        self.fabric.mailboxes[destination as usize].post(Envelope {
            source: self.rank,
            channel,
            bytes,
        });
    }

    fn next_sequence(&self) -> u64 {
        self.collectives_entered.fetch_add(1, Ordering::Relaxed)
    }

    /// Wait for `source`'s contribution to collective number `sequence` and check it is the expected kind.
    fn take_collective(&self, source: u32, sequence: u64, expected: Collective) -> crate::Result<Vec<u8>> {
        let envelope = self.own_mailbox().take(|envelope| {
            envelope.source == source
                && matches!(envelope.channel, Channel::Collective { sequence: s, .. } if s == sequence)
        });
        match envelope.channel {
            Channel::Collective { kind, .. } if kind == expected => Ok(envelope.bytes),
            Channel::Collective { kind, .. } => {
                error!(rank = self.rank, peer = source, sequence, "participants entered different collectives");
                Err(Error::CollectiveMismatch {
                    rank: self.rank,
                    peer: source,
                    expected: expected.name(),
                    found: kind.name(),
                })
            },
            Channel::Point(_) => Err(self.failure("point-to-point message matched a collective")),
        }
    }

    fn copy_exact(&self, peer: u32, bytes: &[u8], buffer: &mut [u8]) -> crate::Result {
        if bytes.len() != buffer.len() {
            return Err(self.failure(format!(
                "message from {peer} has {} bytes but {} were expected",
                bytes.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(bytes);
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.fabric.mailboxes.len() as u32
    }

    fn max_fragment(&self) -> usize {
        self.fabric.max_fragment
    }

    fn send_bytes(&self, destination: u32, tag: Tag, bytes: &[u8]) -> crate::Result {
        self.check_participant(destination)?;
        trace!(rank = self.rank, peer = destination, tag, bytes = bytes.len(), "posting message");
        self.post(destination, Channel::Point(tag), bytes.to_vec());
        Ok(())
    }

    fn recv_bytes(&self, source: u32, tag: Tag, buffer: &mut [u8]) -> crate::Result {
        self.check_participant(source)?;
        let envelope = self
            .own_mailbox()
            .take(|envelope| envelope.source == source && envelope.channel == Channel::Point(tag));
        trace!(rank = self.rank, peer = source, tag, bytes = envelope.bytes.len(), "took message");
        self.copy_exact(source, &envelope.bytes, buffer)
    }

    fn broadcast_bytes(&self, root: u32, buffer: &mut [u8]) -> crate::Result {
        self.check_participant(root)?;
        let sequence = self.next_sequence();
        let channel = Channel::Collective {
            sequence,
            kind: Collective::Broadcast,
        };
        if self.rank == root {
            for destination in (0..self.size()).filter(|&peer| peer != root) {
                self.post(destination, channel, buffer.to_vec());
            }
            Ok(())
        } else {
            let bytes = self.take_collective(root, sequence, Collective::Broadcast)?;
            self.copy_exact(root, &bytes, buffer)
        }
    }

    fn all_gather_bytes(&self, local: &[u8], counts: &[usize], output: &mut [u8]) -> crate::Result {
        let participants = self.size() as usize;
        if counts.len() != participants {
            return Err(self.failure(format!("{} counts given for {participants} participants", counts.len())));
        }
        if counts.iter().sum::<usize>() != output.len() {
            return Err(self.failure("gather output does not match the sum of the counts"));
        }

        let sequence = self.next_sequence();
        let channel = Channel::Collective {
            sequence,
            kind: Collective::AllGather,
        };
        for destination in (0..self.size()).filter(|&peer| peer != self.rank) {
            self.post(destination, channel, local.to_vec());
        }

        let mut offset = 0;
        for (source, &count) in counts.iter().enumerate() {
            let segment = &mut output[offset..offset + count];
            let source = source as u32;
            if source == self.rank {
                self.copy_exact(source, local, segment)?;
            } else {
                let bytes = self.take_collective(source, sequence, Collective::AllGather)?;
                self.copy_exact(source, &bytes, segment)?;
            }
            offset += count;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("rank", &self.rank)
            .field("size", &self.size())
            .field("max_fragment", &self.fabric.max_fragment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn messages_between_a_pair_keep_their_order() {
        let transports = MemoryTransport::fabric(MemoryTransportConfig::default());
        for value in 0..5u8 {
            transports[0].send_bytes(1, 3, &[value]).unwrap();
        }
        for value in 0..5u8 {
            let mut buffer = [0];
            transports[1].recv_bytes(0, 3, &mut buffer).unwrap();
            assert_eq!([value], buffer, "messages arrived out of order");
        }
    }

    #[test]
    fn tags_are_matched_independently() {
        let transports = MemoryTransport::fabric(MemoryTransportConfig::default());
        transports[0].send_bytes(1, 1, &[1]).unwrap();
        transports[0].send_bytes(1, 2, &[2]).unwrap();

        let mut buffer = [0];
        transports[1].recv_bytes(0, 2, &mut buffer).unwrap();
        assert_eq!([2], buffer);
        transports[1].recv_bytes(0, 1, &mut buffer).unwrap();
        assert_eq!([1], buffer);
    }

    #[test]
    fn unknown_participant_is_a_transport_error() {
        let transports = MemoryTransport::fabric(MemoryTransportConfig::default());
        let result = transports[0].send_bytes(5, 0, &[]);
        assert!(matches!(result, Err(Error::Transport { rank: 0, .. })), "unexpected result {result:?}");
    }

    #[test]
    fn length_disagreement_is_a_transport_error() {
        let transports = MemoryTransport::fabric(MemoryTransportConfig::default());
        transports[0].send_bytes(1, 0, &[1, 2, 3]).unwrap();
        let mut buffer = [0; 2];
        assert!(matches!(
            transports[1].recv_bytes(0, 0, &mut buffer),
            Err(Error::Transport { rank: 1, .. })
        ));
    }

    #[test]
    fn mismatched_collectives_are_detected() {
        let transports = MemoryTransport::fabric(MemoryTransportConfig::default());
        let results: Vec<_> = thread::scope(|scope| {
            let root = scope.spawn(|| transports[0].broadcast_bytes(0, &mut [1, 2]));
            let other = scope.spawn(|| {
                let mut output = [0; 2];
                transports[1].all_gather_bytes(&[9], &[1, 1], &mut output)
            });
            vec![root.join().unwrap(), other.join().unwrap()]
        });

        assert_eq!(Ok(()), results[0]);
        assert_eq!(
            Err(Error::CollectiveMismatch {
                rank: 1,
                peer: 0,
                expected: "all_gather",
                found: "broadcast"
            }),
            results[1]
        );
    }
}
