// rust/rv-core/src/topology/collective.rs

//! Collective operations used by the topology verifier.

use std::sync::{Arc, Barrier, Mutex};

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, RvError};
use crate::poll::{poll_until, PollOutcome, PollPolicy};
use crate::store::{keys, RecordStore};

/// Group communication across every rank of the job.
///
/// All ranks must issue the same sequence of operations; a rank that skips
/// one leaves the others waiting until their timeout.
pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Contributes `value` and returns every rank's contribution, indexed by rank.
    fn all_gather(&mut self, value: &str) -> Result<Vec<String>>;

    /// Returns once every rank has entered the barrier.
    fn barrier(&mut self) -> Result<()>;
}

/// Collective backed by the shared record store.
///
/// Ranks first open a session: every non-zero rank offers a fresh nonce in
/// `collective.join.<rank>`, rank 0 answers in `collective.welcome.<rank>`
/// with that nonce and a new session id, and the rank confirms with
/// `collective.ready.<session>.<rank>`. Records of earlier runs under the
/// same job id carry other nonces and sessions, so they never satisfy a
/// round of this one.
///
/// Each operation is then a numbered round of the session. A rank writes
/// only its own `gather.<session>.<round>.<rank>` or
/// `barrier.<session>.<round>.<rank>` record and polls until the records of
/// all ranks for that round exist.
pub struct StoreCollective {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    job_id: String,
    rank: usize,
    world_size: usize,
    policy: PollPolicy,
    session: String,
    round: u64,
}

impl StoreCollective {
    /// Opens a session with every other rank of the job.
    ///
    /// Rank 0 returns once every rank has entered the session and then
    /// removes the records of earlier sessions; other ranks return as soon
    /// as rank 0 has welcomed them.
    ///
    /// # Errors
    ///
    /// Returns `CollectiveTimeout` (operation `connect`) naming the ranks
    /// that did not show up within `policy.timeout`, or a store error.
    pub fn connect(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        job_id: impl Into<String>,
        rank: usize,
        world_size: usize,
        policy: PollPolicy,
    ) -> Result<Self> {
        let job_id = job_id.into();
        let session = if rank == 0 {
            let session = Uuid::new_v4().simple().to_string();
            welcome_all(&store, clock.as_ref(), &policy, &job_id, world_size, &session)?;
            remove_other_sessions(store.as_ref(), &job_id, &session)?;
            session
        } else {
            await_welcome(&store, clock.as_ref(), &policy, &job_id, rank)?
        };

        tracing::debug!(job_id = %job_id, rank, session = %session, "collective session open");
        Ok(Self::joined(store, clock, job_id, rank, world_size, policy, session))
    }

    fn joined(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        job_id: String,
        rank: usize,
        world_size: usize,
        policy: PollPolicy,
        session: String,
    ) -> Self {
        Self {
            store,
            clock,
            job_id,
            rank,
            world_size,
            policy,
            session,
            round: 0,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Index of the next round this rank will enter.
    pub fn round(&self) -> u64 {
        self.round
    }

    fn next_round(&mut self) -> u64 {
        let round = self.round;
        self.round += 1;
        round
    }

    /// Publishes this rank's record for `round` and waits for everyone else's.
    fn exchange(
        &self,
        operation: &'static str,
        round: u64,
        key_for: fn(&str, u64, usize) -> String,
        value: &str,
    ) -> Result<()> {
        self.store
            .write(&self.job_id, &key_for(&self.session, round, self.rank), value)?;

        let expected: Vec<String> = (0..self.world_size)
            .map(|r| key_for(&self.session, round, r))
            .collect();
        let mut missing = Vec::new();

        let outcome = poll_until(self.clock.as_ref(), &self.policy, || {
            let present = self.store.list(&self.job_id)?;
            missing = expected
                .iter()
                .enumerate()
                .filter(|(_, key)| present.binary_search(key).is_err())
                .map(|(rank, _)| rank)
                .collect();
            Ok(missing.is_empty().then_some(()))
        })?;

        match outcome {
            PollOutcome::Ready { waited, .. } => {
                tracing::trace!(operation, round, waited_ms = waited.as_millis() as u64, "collective round complete");
                Ok(())
            }
            PollOutcome::TimedOut { waited } => Err(RvError::CollectiveTimeout {
                operation,
                round,
                missing,
                waited,
            }),
        }
    }
}

/// Rank 0 side of the handshake: answers every join with the session until
/// all ranks are ready.
fn welcome_all(
    store: &Arc<dyn RecordStore>,
    clock: &dyn Clock,
    policy: &PollPolicy,
    job_id: &str,
    world_size: usize,
    session: &str,
) -> Result<()> {
    // nonce each rank was last welcomed with
    let mut welcomed: Vec<Option<String>> = vec![None; world_size];
    let mut missing = Vec::new();

    let outcome = poll_until(clock, policy, || {
        let present = store.list(job_id)?;
        missing.clear();
        for rank in 1..world_size {
            if present.binary_search(&keys::collective_ready(session, rank)).is_ok() {
                continue;
            }
            missing.push(rank);

            let Some(nonce) = store.read(job_id, &keys::collective_join(rank))? else {
                continue;
            };
            let nonce = nonce.trim().to_string();
            if welcomed[rank].as_deref() != Some(nonce.as_str()) {
                store.write(
                    job_id,
                    &keys::collective_welcome(rank),
                    &format!("{nonce} {session}"),
                )?;
                welcomed[rank] = Some(nonce);
            }
        }
        Ok(missing.is_empty().then_some(()))
    })?;

    match outcome {
        PollOutcome::Ready { .. } => Ok(()),
        PollOutcome::TimedOut { waited } => Err(RvError::CollectiveTimeout {
            operation: "connect",
            round: 0,
            missing,
            waited,
        }),
    }
}

/// Non-zero rank side of the handshake. Returns the session id.
fn await_welcome(
    store: &Arc<dyn RecordStore>,
    clock: &dyn Clock,
    policy: &PollPolicy,
    job_id: &str,
    rank: usize,
) -> Result<String> {
    let nonce = Uuid::new_v4().simple().to_string();
    store.write(job_id, &keys::collective_join(rank), &nonce)?;

    let outcome = poll_until(clock, policy, || {
        let welcome = store.read(job_id, &keys::collective_welcome(rank))?;
        Ok(welcome.and_then(|value| {
            let (answered, session) = value.trim().split_once(' ')?;
            (answered == nonce).then(|| session.to_string())
        }))
    })?;

    match outcome {
        PollOutcome::Ready { value: session, .. } => {
            store.write(job_id, &keys::collective_ready(&session, rank), "")?;
            Ok(session)
        }
        PollOutcome::TimedOut { waited } => Err(RvError::CollectiveTimeout {
            operation: "connect",
            round: 0,
            missing: vec![0],
            waited,
        }),
    }
}

/// Deletes gather, barrier and ready records of every session but `session`.
fn remove_other_sessions(store: &dyn RecordStore, job_id: &str, session: &str) -> Result<usize> {
    let removed = store
        .list(job_id)?
        .iter()
        .filter(|key| keys::collective_session(key).is_some_and(|s| s != session))
        .filter(|key| store.delete(job_id, key))
        .count();
    if removed > 0 {
        tracing::debug!(job_id, removed, "removed records of earlier collective sessions");
    }
    Ok(removed)
}

impl Collective for StoreCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&mut self, value: &str) -> Result<Vec<String>> {
        let round = self.next_round();
        self.exchange("all_gather", round, keys::gather, value)?;

        (0..self.world_size)
            .map(|rank| {
                let key = keys::gather(&self.session, round, rank);
                self.store.read(&self.job_id, &key)?.ok_or_else(|| {
                    RvError::cluster(format!(
                        "gather record '{key}' of job '{}' vanished mid-round",
                        self.job_id
                    ))
                })
            })
            .collect()
    }

    fn barrier(&mut self) -> Result<()> {
        let round = self.next_round();
        self.exchange("barrier", round, keys::barrier, "")
    }
}

struct LocalShared {
    slots: Mutex<Vec<String>>,
    barrier: Barrier,
}

/// In-process collective for ranks running on threads of one process.
///
/// Useful for single-host runs and for exercising the verifier in tests.
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<LocalShared>,
}

impl LocalGroup {
    /// Creates one member per rank, in rank order.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(LocalShared {
            slots: Mutex::new(vec![String::new(); world_size]),
            barrier: Barrier::new(world_size),
        });

        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&mut self, value: &str) -> Result<Vec<String>> {
        {
            let mut slots = self.shared.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots[self.rank] = value.to_string();
        }
        self.shared.barrier.wait();

        let gathered = self
            .shared
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        // nobody may overwrite a slot until every rank has copied the round
        self.shared.barrier.wait();
        Ok(gathered)
    }

    fn barrier(&mut self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}
