//! Coordination between processes (ranks) sharing one array file.
//!
//! The engine only relies on two primitives: a designated writer for bulk fill
//! values and a collective barrier. Ordinary chunk reads and writes aren't
//! arbitrated, callers must partition chunk ownership across ranks.
use std::{fmt, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::error::Error;

pub trait Coordinator: Send + Sync + fmt::Debug {
    /// Index of this process in the group.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Blocks until every process in the group reached the barrier.
    fn barrier(&self) -> Result<(), Error>;

    /// Whether this process performs the writes done once for the whole group.
    fn is_fill_writer(&self) -> bool {
        self.rank() == 0
    }

    #[inline]
    fn is_parallel(&self) -> bool {
        self.size() > 1
    }
}

/// The default, a group of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Coordinator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

#[derive(Debug)]
struct GroupShared {
    size: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

/// A group of threads standing in for processes, one member per thread.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl ThreadGroup {
    /// Creates the members of a group of `size`, a member waiting on a barrier for
    /// longer than `timeout` fails with [Error::Coordination].
    pub fn new(size: usize, timeout: Duration) -> Vec<Self> {
        let shared = Arc::new(GroupShared {
            size,
            timeout,
            state: Default::default(),
            condvar: Condvar::new(),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }
}

impl Coordinator for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), Error> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == shared.size {
            state.arrived = 0;
            state.generation += 1;
            shared.condvar.notify_all();
            return Ok(());
        }
        while state.generation == generation {
            if shared
                .condvar
                .wait_for(&mut state, shared.timeout)
                .timed_out()
                && state.generation == generation
            {
                state.arrived -= 1;
                return Err(Error::coordination(format!(
                    "rank {} timed out on barrier after {:?}",
                    self.rank, shared.timeout
                )));
            }
        }
        trace!("Rank {} passed barrier {generation}", self.rank);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_barrier_orders_phases() {
        let members = ThreadGroup::new(4, Duration::from_secs(10));
        let counter = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for member in members {
                let counter = counter.clone();
                s.spawn(move || {
                    for round in 1..=3 {
                        counter.fetch_add(1, Ordering::SeqCst);
                        member.barrier().unwrap();
                        assert!(counter.load(Ordering::SeqCst) >= round * 4);
                        member.barrier().unwrap();
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_barrier_timeout() {
        let members = ThreadGroup::new(2, Duration::from_millis(20));
        let err = members[0].barrier().unwrap_err();
        assert!(matches!(err, Error::Coordination(_)));
        assert!(members[1].is_parallel());
        assert!(!members[1].is_fill_writer());
        assert!(SingleProcess.barrier().is_ok());
    }
}
