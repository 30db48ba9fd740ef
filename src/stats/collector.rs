//! Turns counter readings from the core into ledger deltas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::observability::metrics;
use crate::stats::ledger::TrafficLedger;
use crate::store::{TrafficDelta, TrafficEntity};
use crate::supervisor::{CounterKind, CounterSample, Supervisor, SupervisorError, TrafficReading};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("reading counters failed: {0}")]
    Query(#[from] SupervisorError),
}

/// What one collection tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    /// No running process.
    Skipped,
    /// First reading of a new process; recorded as the baseline.
    Baselined { entities: usize },
    /// Deltas merged into the ledger.
    Merged { deltas: usize },
}

/// Last-read cumulative counters, valid for one process generation.
#[derive(Debug, Default)]
pub struct BaselineTable {
    generation: Option<u64>,
    counters: HashMap<TrafficEntity, (u64, u64)>,
}

impl BaselineTable {
    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Diff `samples` against the stored baseline.
    ///
    /// Returns `None` when `generation` is new: the table is reset and the
    /// samples become the baseline. Within a generation an unknown entity
    /// counts from zero and a counter that went backwards is rebaselined
    /// without a delta.
    pub fn diff(&mut self, generation: u64, samples: &[CounterSample]) -> Option<Vec<TrafficDelta>> {
        if self.generation != Some(generation) {
            self.generation = Some(generation);
            self.counters = samples
                .iter()
                .map(|s| (s.entity.clone(), (s.uplink, s.downlink)))
                .collect();
            return None;
        }

        let mut deltas = Vec::new();
        for sample in samples {
            let current = (sample.uplink, sample.downlink);
            let previous = self
                .counters
                .insert(sample.entity.clone(), current)
                .unwrap_or((0, 0));

            let up = current.0.checked_sub(previous.0).unwrap_or_else(|| {
                tracing::debug!(entity = %sample.entity, "Uplink counter went backwards, rebaselined");
                0
            });
            let down = current.1.checked_sub(previous.1).unwrap_or_else(|| {
                tracing::debug!(entity = %sample.entity, "Downlink counter went backwards, rebaselined");
                0
            });

            if up > 0 || down > 0 {
                deltas.push(TrafficDelta {
                    entity: sample.entity.clone(),
                    up,
                    down,
                });
            }
        }
        Some(deltas)
    }
}

/// Polls the supervisor for counters and feeds the ledger.
pub struct StatsCollector {
    supervisor: Arc<Supervisor>,
    ledger: Arc<TrafficLedger>,
    baselines: Mutex<BaselineTable>,
}

impl StatsCollector {
    pub fn new(supervisor: Arc<Supervisor>, ledger: Arc<TrafficLedger>) -> Self {
        Self {
            supervisor,
            ledger,
            baselines: Mutex::new(BaselineTable::default()),
        }
    }

    /// Run one collection tick.
    ///
    /// Readings the supervisor took just before stopping a process are
    /// applied first, then the live reading. A failed live read merges only
    /// those final readings and leaves the live baselines untouched.
    pub async fn collect(&self) -> Result<CollectOutcome, CollectError> {
        let live = self.supervisor.query_traffic().await;
        // Drained after the live read so a stop racing with it is not missed.
        let finals = self.supervisor.take_final_readings();

        let mut readings: Vec<(bool, TrafficReading)> = Vec::with_capacity(finals.len() + 1);
        let live_error = match live {
            Ok(reading) => {
                readings.push((true, reading));
                None
            }
            Err(e) => Some(e),
        };
        readings.extend(finals.into_iter().map(|reading| (false, reading)));
        // Stable: a live reading stays ahead of the final one of its generation.
        readings.sort_by_key(|(_, reading)| reading.identity.generation);

        let mut live_outcome = None;
        let mut final_deltas = 0;
        for (is_live, reading) in readings {
            let outcome = self.apply(reading);
            if is_live {
                live_outcome = Some(outcome);
            } else if let CollectOutcome::Merged { deltas } = outcome {
                final_deltas += deltas;
            }
        }

        match (live_outcome, live_error) {
            (Some(outcome), _) => Ok(outcome),
            (None, Some(SupervisorError::NotRunning(_))) if final_deltas > 0 => {
                Ok(CollectOutcome::Merged { deltas: final_deltas })
            }
            (None, Some(SupervisorError::NotRunning(_))) | (None, None) => Ok(CollectOutcome::Skipped),
            (None, Some(e)) => Err(e.into()),
        }
    }

    fn apply(&self, reading: TrafficReading) -> CollectOutcome {
        let TrafficReading {
            identity,
            kind,
            samples,
        } = reading;

        let deltas = match kind {
            CounterKind::Incremental => samples
                .into_iter()
                .filter(|s| s.uplink > 0 || s.downlink > 0)
                .map(|s| TrafficDelta {
                    entity: s.entity,
                    up: s.uplink,
                    down: s.downlink,
                })
                .collect(),
            CounterKind::Cumulative => {
                let mut baselines = self.baselines.lock().unwrap_or_else(PoisonError::into_inner);
                match baselines.diff(identity.generation, &samples) {
                    Some(deltas) => deltas,
                    None => {
                        tracing::info!(
                            generation = identity.generation,
                            entities = samples.len(),
                            "Counter baseline recorded for new core process"
                        );
                        return CollectOutcome::Baselined {
                            entities: samples.len(),
                        };
                    }
                }
            }
        };

        let (up, down) = deltas
            .iter()
            .filter(|d| matches!(d.entity, TrafficEntity::Client(_)))
            .fold((0u64, 0u64), |(u, d), delta| {
                (u.saturating_add(delta.up), d.saturating_add(delta.down))
            });
        metrics::record_traffic(up, down);

        let count = deltas.len();
        self.ledger.merge_batch(deltas);
        tracing::debug!(generation = identity.generation, deltas = count, "Traffic collected");
        CollectOutcome::Merged { deltas: count }
    }
}
