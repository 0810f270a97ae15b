//! Halo exchange.
//!
//! Owned values of a dat are sent to every neighbor listed in the halo of the dat's set, and
//! the halo values are overwritten with what the owners send back. Sends never block, so an
//! exchange is started before the core iterations of a loop and completed, with a single
//! [`PendingExchange::wait`], before the iterations that read halo data.
use crate::codegen::DatStorage;
use crate::comm::{decode, encode, Communicator};
use crate::dat::Dat;
use crate::error::HaloExchangeError;
use crate::set::Set;
use crate::Value;
use log::debug;
use std::time::Duration;

/// An exchange of one dat whose sends have been issued.
#[derive(Debug)]
struct PostedExchange {
    storage: usize,
    set: Set,
    dim: usize,
    tag: u64,
}

/// Halo exchanges in flight.
pub(crate) struct PendingExchange<'c> {
    comm: &'c dyn Communicator,
    timeout: Duration,
    posted: Vec<PostedExchange>,
}

impl<'c> PendingExchange<'c> {
    /// Exchanges whose receives fail after waiting `timeout` for a neighbor.
    pub(crate) fn new(comm: &'c dyn Communicator, timeout: Duration) -> Self {
        Self {
            comm,
            timeout,
            posted: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.posted.is_empty()
    }

    /// Send the owned values of a dat to all neighbors.
    ///
    /// # Safety
    ///
    /// No thread may write to the owned values of the dat while the sends are issued.
    pub(crate) unsafe fn start<T: Value>(
        &mut self,
        dat: &Dat<T>,
        storage_index: usize,
        storage: &DatStorage<'_, T>,
        tag: u64,
    ) -> Result<(), HaloExchangeError> {
        let set = dat.set();
        let dim = dat.dim();
        let neighbors = set.halo().map(|halo| halo.neighbors()).unwrap_or_default();
        for neighbor in neighbors {
            let mut values = Vec::with_capacity(dim * neighbor.send.len());
            for &entity in &neighbor.send {
                values.extend_from_slice(storage.read(dim * entity..dim * (entity + 1)));
            }
            self.comm.send(neighbor.rank, tag, encode(&values)?)?;
        }
        debug!(
            "Rank {} started halo exchange of '{}' with {} neighbor(s), tag {}",
            self.comm.rank(),
            dat.name(),
            neighbors.len(),
            tag
        );
        self.posted.push(PostedExchange {
            storage: storage_index,
            set: set.clone(),
            dim,
            tag,
        });
        Ok(())
    }

    /// Receive all posted exchanges and write the received values into the halos.
    ///
    /// Returns the storage indices of the dats whose halos are now up to date.
    ///
    /// # Safety
    ///
    /// No other thread may access the halo values of the exchanged dats.
    pub(crate) unsafe fn wait<T: Value>(self, dats: &[DatStorage<'_, T>]) -> Result<Vec<usize>, HaloExchangeError> {
        let mut completed = Vec::with_capacity(self.posted.len());
        for posted in &self.posted {
            let dim = posted.dim;
            let neighbors = posted.set.halo().map(|halo| halo.neighbors()).unwrap_or_default();
            for neighbor in neighbors {
                let bytes = self.comm.recv(neighbor.rank, posted.tag, self.timeout)?;
                let values: Vec<T> = decode(neighbor.rank, &bytes)?;
                let expected = dim * neighbor.recv.len();
                if values.len() != expected {
                    return Err(HaloExchangeError::SizeMismatch {
                        peer: neighbor.rank,
                        expected,
                        received: values.len(),
                    });
                }
                let storage = &dats[posted.storage];
                for (&entity, chunk) in neighbor.recv.iter().zip(values.chunks_exact(dim.max(1))) {
                    storage
                        .write(dim * entity..dim * (entity + 1))
                        .copy_from_slice(chunk);
                }
            }
            completed.push(posted.storage);
        }
        Ok(completed)
    }
}
