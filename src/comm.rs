//! Message passing between ranks.
//!
//! The engine only needs point-to-point messages identified by a tag, plus an all-gather for
//! reductions, which the [`Communicator`] trait provides on top of `send` and `recv`. Payloads
//! are encoded as CBOR.
use crate::error::HaloExchangeError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::trace;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A group of ranks that exchange tagged messages.
pub trait Communicator: Send + Sync {
    /// The rank of this process within the group.
    fn rank(&self) -> usize;

    /// The number of ranks in the group.
    fn size(&self) -> usize;

    /// Send a message to a peer. Must return without waiting for a matching receive.
    fn send(&self, rank: usize, tag: u64, message: Vec<u8>) -> Result<(), HaloExchangeError>;

    /// Receive the message with the given tag from a peer, blocking until it arrives or
    /// `timeout` has passed. Messages that arrive out of order are kept until they are asked
    /// for.
    fn recv(&self, rank: usize, tag: u64, timeout: Duration) -> Result<Vec<u8>, HaloExchangeError>;

    /// Exchange one message with every rank. Returns the messages of all ranks, ordered by
    /// rank (including this rank's own).
    fn all_gather(&self, tag: u64, message: Vec<u8>, timeout: Duration) -> Result<Vec<Vec<u8>>, HaloExchangeError> {
        let rank = self.rank();
        for peer in (0..self.size()).filter(|&peer| peer != rank) {
            self.send(peer, tag, message.clone())?;
        }
        let mut gathered = Vec::with_capacity(self.size());
        for peer in 0..self.size() {
            if peer == rank {
                gathered.push(message.clone());
            } else {
                gathered.push(self.recv(peer, tag, timeout)?);
            }
        }
        Ok(gathered)
    }
}

/// The trivial group consisting of a single rank.
#[derive(Debug, Default, Copy, Clone)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, rank: usize, _tag: u64, _message: Vec<u8>) -> Result<(), HaloExchangeError> {
        Err(HaloExchangeError::UnknownRank { peer: rank, size: 1 })
    }

    fn recv(&self, rank: usize, _tag: u64, _timeout: Duration) -> Result<Vec<u8>, HaloExchangeError> {
        Err(HaloExchangeError::UnknownRank { peer: rank, size: 1 })
    }
}

#[derive(Debug)]
struct Envelope {
    source: usize,
    tag: u64,
    data: Vec<u8>,
}

/// In-process ranks connected by channels, typically one rank per thread.
pub struct ChannelCommunicator {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    mailbox: Mutex<FxHashMap<(usize, u64), VecDeque<Vec<u8>>>>,
}

impl ChannelCommunicator {
    /// Create a fully connected group of `size` ranks.
    pub fn group(size: usize) -> Vec<ChannelCommunicator> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelCommunicator {
                rank,
                peers: senders.clone(),
                inbox,
                mailbox: Mutex::new(FxHashMap::default()),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<(), HaloExchangeError> {
        if rank < self.peers.len() {
            Ok(())
        } else {
            Err(HaloExchangeError::UnknownRank {
                peer: rank,
                size: self.peers.len(),
            })
        }
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: u64, message: Vec<u8>) -> Result<(), HaloExchangeError> {
        self.check_rank(rank)?;
        let envelope = Envelope {
            source: self.rank,
            tag,
            data: message,
        };
        self.peers[rank]
            .send(envelope)
            .map_err(|_| HaloExchangeError::Disconnected { peer: rank })
    }

    fn recv(&self, rank: usize, tag: u64, timeout: Duration) -> Result<Vec<u8>, HaloExchangeError> {
        self.check_rank(rank)?;
        let mut mailbox = self.mailbox.lock();
        if let Some(message) = mailbox.get_mut(&(rank, tag)).and_then(VecDeque::pop_front) {
            return Ok(message);
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            let received = match deadline {
                Some(deadline) => self.inbox.recv_deadline(deadline),
                None => self.inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(envelope) if envelope.source == rank && envelope.tag == tag => return Ok(envelope.data),
                Ok(envelope) => {
                    trace!(
                        "Rank {} buffering message from rank {} with tag {}",
                        self.rank,
                        envelope.source,
                        envelope.tag
                    );
                    mailbox
                        .entry((envelope.source, envelope.tag))
                        .or_default()
                        .push_back(envelope.data);
                }
                Err(RecvTimeoutError::Timeout) => return Err(HaloExchangeError::Timeout { peer: rank }),
                Err(RecvTimeoutError::Disconnected) => return Err(HaloExchangeError::Disconnected { peer: rank }),
            }
        }
    }
}

pub(crate) fn encode<T: ?Sized + Serialize>(values: &T) -> Result<Vec<u8>, HaloExchangeError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(values, &mut bytes).map_err(|err| HaloExchangeError::Encode {
        reason: err.to_string(),
    })?;
    Ok(bytes)
}

pub(crate) fn decode<T: DeserializeOwned>(peer: usize, bytes: &[u8]) -> Result<T, HaloExchangeError> {
    ciborium::de::from_reader(bytes).map_err(|err| HaloExchangeError::Decode {
        peer,
        reason: err.to_string(),
    })
}
