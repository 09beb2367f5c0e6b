// rust/rv-core/src/rendezvous/protocol.rs

//! Head and worker halves of the rendezvous.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::{RendezvousConfig, RvConfig};
use crate::error::{Result, RvError};
use crate::poll::{poll_until, PollOutcome};
use crate::store::{keys, RecordStore};

use super::cluster::ClusterRuntime;

/// Whether the head saw the full expected membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormationStatus {
    Complete,
    /// The membership wait timed out; the run continues with a partial cluster.
    Degraded,
}

impl fmt::Display for FormationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => f.write_str("complete"),
            Self::Degraded => f.write_str("degraded"),
        }
    }
}

/// The head's view of cluster formation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formation {
    pub address: String,
    pub expected_nodes: usize,
    pub alive_nodes: usize,
    pub waited: Duration,
    pub status: FormationStatus,
}

impl Formation {
    pub fn is_degraded(&self) -> bool {
        self.status == FormationStatus::Degraded
    }
}

/// How a worker's wait for the completion record ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneWait {
    Observed { waited: Duration },
    /// The head never published completion; the worker exits anyway.
    TimedOut { waited: Duration },
}

/// Which workers acknowledged the completion record before cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSummary {
    pub acked: Vec<usize>,
    pub missing: Vec<usize>,
}

/// What the head did at the end of the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadShutdown {
    pub acks: AckSummary,
    pub records_removed: usize,
}

/// Rendezvous over a shared record store for one job attempt.
///
/// Each record has a single writer: the head writes `attempt`, `address` and
/// `done`, every worker writes only its own `ack.<rank>`. Workers accept an
/// address only when `attempt` names their own attempt, so an address left
/// by a preempted attempt of a requeued job is never joined.
pub struct Rendezvous {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    job_id: String,
    attempt: u32,
    config: RendezvousConfig,
}

impl Rendezvous {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        job_id: impl Into<String>,
        config: RendezvousConfig,
    ) -> Self {
        Self {
            store,
            clock,
            job_id: job_id.into(),
            attempt: 0,
            config,
        }
    }

    pub fn from_config(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, config: &RvConfig) -> Self {
        Self::new(store, clock, config.job.id.clone(), config.rendezvous.clone())
            .with_attempt(config.job.attempt)
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn recorded_attempt(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .read(&self.job_id, keys::ATTEMPT)?
            .map(|value| value.trim().to_string()))
    }

    // ---------------------------------------------------------------- head

    /// Removes records an earlier run of this job may have left behind.
    ///
    /// Records written under another attempt are all removed, the address
    /// included. When `attempt` already names this attempt, the address is
    /// kept so `publish_address` can report a possible second head.
    ///
    /// Returns how many records were removed.
    pub fn clear_stale(&self) -> Result<usize> {
        let current = self.attempt.to_string();
        let same_attempt = self.recorded_attempt()?.as_deref() == Some(current.as_str());

        let stale: Vec<String> = self
            .store
            .list(&self.job_id)?
            .into_iter()
            .filter(|key| !(same_attempt && keys::is_head_record(key)))
            .collect();

        let removed = stale
            .iter()
            .filter(|key| self.store.delete(&self.job_id, key))
            .count();
        if removed > 0 {
            tracing::info!(
                job_id = %self.job_id,
                attempt = self.attempt,
                removed,
                same_attempt,
                "cleared stale rendezvous records"
            );
        }
        Ok(removed)
    }

    /// Publishes this attempt, then the head address.
    ///
    /// By default an existing, different address is logged and overwritten
    /// (last writer wins). With `exclusive_head` the publish fails instead.
    ///
    /// # Errors
    ///
    /// Returns `AddressConflict` in exclusive mode when an address exists,
    /// or a store error if the write fails.
    pub fn publish_address(&self, address: &str) -> Result<()> {
        self.store
            .write(&self.job_id, keys::ATTEMPT, &self.attempt.to_string())?;

        if self.config.exclusive_head {
            if !self.store.create(&self.job_id, keys::ADDRESS, address)? {
                let existing = self
                    .store
                    .read(&self.job_id, keys::ADDRESS)?
                    .unwrap_or_default();
                return Err(RvError::AddressConflict {
                    job_id: self.job_id.clone(),
                    existing,
                });
            }
        } else {
            if let Some(existing) = self.store.read(&self.job_id, keys::ADDRESS)? {
                if existing.trim() != address {
                    tracing::warn!(
                        job_id = %self.job_id,
                        existing = %existing.trim(),
                        address,
                        "address record already present, overwriting (stale record or second head)"
                    );
                }
            }
            self.store.write(&self.job_id, keys::ADDRESS, address)?;
        }

        tracing::info!(job_id = %self.job_id, attempt = self.attempt, address, "published head address");
        Ok(())
    }

    /// Waits until the runtime reports `expected_nodes` alive nodes.
    ///
    /// A timeout is not an error: the formation is returned as degraded.
    pub fn await_membership(
        &self,
        cluster: &dyn ClusterRuntime,
        address: &str,
        expected_nodes: usize,
    ) -> Result<Formation> {
        let mut last_seen = 0;
        let outcome = poll_until(
            self.clock.as_ref(),
            &self.config.membership_policy(),
            || {
                last_seen = cluster.alive_nodes()?;
                tracing::debug!(alive = last_seen, expected_nodes, "membership check");
                Ok((last_seen >= expected_nodes).then_some(last_seen))
            },
        )?;

        let formation = match outcome {
            PollOutcome::Ready { value, waited } => Formation {
                address: address.to_string(),
                expected_nodes,
                alive_nodes: value,
                waited,
                status: FormationStatus::Complete,
            },
            PollOutcome::TimedOut { waited } => {
                tracing::warn!(
                    job_id = %self.job_id,
                    alive = last_seen,
                    expected_nodes,
                    waited_secs = waited.as_secs_f64(),
                    "cluster formation degraded: membership wait timed out"
                );
                Formation {
                    address: address.to_string(),
                    expected_nodes,
                    alive_nodes: last_seen,
                    waited,
                    status: FormationStatus::Degraded,
                }
            }
        };

        tracing::info!(
            alive = formation.alive_nodes,
            expected_nodes,
            status = %formation.status,
            "cluster formation finished"
        );
        Ok(formation)
    }

    /// Full head start-up: clear stale records, start the runtime, publish
    /// its address, wait for membership.
    pub fn form_as_head(
        &self,
        cluster: &mut dyn ClusterRuntime,
        expected_nodes: usize,
    ) -> Result<Formation> {
        self.clear_stale()?;
        let address = cluster.start_head()?;
        self.publish_address(&address)?;
        self.await_membership(cluster, &address, expected_nodes)
    }

    /// Publishes the completion sentinel.
    pub fn publish_done(&self) -> Result<()> {
        self.store
            .write(&self.job_id, keys::DONE, keys::DONE_SENTINEL)?;
        tracing::info!(job_id = %self.job_id, "published completion record");
        Ok(())
    }

    /// Waits, bounded by the done grace, for every worker's acknowledgement.
    pub fn await_acks(&self, world_size: usize) -> AckSummary {
        let workers: Vec<usize> = (1..world_size).collect();
        let mut acked = Vec::new();

        let outcome = poll_until(self.clock.as_ref(), &self.config.ack_policy(), || {
            let present = self.store.list(&self.job_id)?;
            acked = workers
                .iter()
                .copied()
                .filter(|rank| present.iter().any(|key| *key == keys::ack(*rank)))
                .collect();
            Ok((acked.len() == workers.len()).then_some(()))
        });

        let missing: Vec<usize> = workers
            .iter()
            .copied()
            .filter(|rank| !acked.contains(rank))
            .collect();

        match outcome {
            Ok(PollOutcome::Ready { .. }) => {}
            Ok(PollOutcome::TimedOut { .. }) => {
                tracing::warn!(job_id = %self.job_id, ?missing, "workers did not acknowledge completion");
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, error = %e, "failed to collect acknowledgements");
            }
        }

        AckSummary { acked, missing }
    }

    /// Head teardown: publish completion, give workers time to see it, stop
    /// the runtime, then remove every record of the job.
    ///
    /// Records are deleted only after every worker acknowledged or the grace
    /// period ran out, so no worker is still polling a record being removed.
    pub fn finish_as_head(
        &self,
        cluster: &mut dyn ClusterRuntime,
        world_size: usize,
    ) -> Result<HeadShutdown> {
        self.publish_done()?;
        let acks = self.await_acks(world_size);

        if let Err(e) = cluster.shutdown() {
            tracing::warn!(error = %e, "head runtime shutdown failed");
        }

        let records_removed = self.cleanup();
        Ok(HeadShutdown {
            acks,
            records_removed,
        })
    }

    // -------------------------------------------------------------- worker

    /// Polls for the head address of this attempt.
    ///
    /// An address is only read once `attempt` matches this attempt. Empty or
    /// whitespace-only records are treated as not yet published.
    ///
    /// # Errors
    ///
    /// Returns `RendezvousTimeout` if no address appears within the address
    /// timeout. This is the one rendezvous failure that is fatal.
    pub fn discover_address(&self) -> Result<String> {
        let current = self.attempt.to_string();
        let outcome = poll_until(
            self.clock.as_ref(),
            &self.config.address_policy(),
            || {
                if self.recorded_attempt()?.as_deref() != Some(current.as_str()) {
                    return Ok(None);
                }
                let record = self.store.read(&self.job_id, keys::ADDRESS)?;
                Ok(record
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty()))
            },
        )?;

        match outcome {
            PollOutcome::Ready { value, waited } => {
                tracing::info!(
                    job_id = %self.job_id,
                    address = %value,
                    waited_secs = waited.as_secs_f64(),
                    "discovered head address"
                );
                Ok(value)
            }
            PollOutcome::TimedOut { waited } => {
                Err(RvError::rendezvous_timeout(&self.job_id, keys::ADDRESS, waited))
            }
        }
    }

    /// Discovers the head address and joins the runtime with it.
    pub fn join_as_worker(&self, cluster: &mut dyn ClusterRuntime) -> Result<String> {
        let address = self.discover_address()?;
        cluster.join(&address)?;
        Ok(address)
    }

    /// Idles until the head publishes completion, then acknowledges it.
    ///
    /// A timeout is logged and returned as `DoneWait::TimedOut`; the head may
    /// already have torn everything down.
    pub fn await_done(&self, rank: usize) -> Result<DoneWait> {
        let outcome = poll_until(self.clock.as_ref(), &self.config.done_policy(), || {
            self.store.read(&self.job_id, keys::DONE)
        })?;

        match outcome {
            PollOutcome::Ready { value, waited } => {
                if value.trim() != keys::DONE_SENTINEL {
                    tracing::warn!(value = %value.trim(), "unexpected completion record content");
                }
                if let Err(e) = self.store.write(&self.job_id, &keys::ack(rank), "") {
                    tracing::warn!(rank, error = %e, "failed to acknowledge completion");
                }
                tracing::info!(job_id = %self.job_id, rank, "observed completion record");
                Ok(DoneWait::Observed { waited })
            }
            PollOutcome::TimedOut { waited } => {
                tracing::warn!(
                    job_id = %self.job_id,
                    rank,
                    waited_secs = waited.as_secs_f64(),
                    "timed out waiting for completion record"
                );
                Ok(DoneWait::TimedOut { waited })
            }
        }
    }

    /// Removes every record of the job. Best effort.
    pub fn cleanup(&self) -> usize {
        let removed = self.store.clear(&self.job_id);
        tracing::info!(job_id = %self.job_id, removed, "removed rendezvous records");
        removed
    }
}
