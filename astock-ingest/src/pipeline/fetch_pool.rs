//! Bounded-concurrency fetch pool with retry and jittered pacing.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use astock_common::FetchConfig;

use super::retry::RetryPolicy;
use super::{FetchError, FetchOutcome, RawResult, WorkUnit};

/// Collaborator that fetches the raw records of one work unit.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, unit: &WorkUnit) -> Result<RawResult, FetchError>;
}

// ============================================================================
// Pacing
// ============================================================================

/// Uniform random pause a worker takes after every fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub min: Duration,
    pub max: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(300),
            max: Duration::from_millis(600),
        }
    }
}

impl Pacing {
    /// No pause at all.
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Draw the next pause from `rng`. Bounds are inclusive.
    pub fn delay(&self, rng: &mut StdRng) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Fetch pool settings.
#[derive(Debug, Clone)]
pub struct FetchPoolOptions {
    /// Upper bound on simultaneous in-flight fetches
    pub max_workers: usize,
    pub retry: RetryPolicy,
    pub pacing: Pacing,
    /// Worker `i` seeds its RNG with `seed + i`; `None` uses entropy
    pub seed: Option<u64>,
}

impl Default for FetchPoolOptions {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

impl FetchPoolOptions {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            retry: RetryPolicy::new(config.max_attempts, config.backoff()),
            pacing: Pacing {
                min: config.pacing_min(),
                max: config.pacing_max(),
            },
            seed: config.seed,
        }
    }
}

/// Runs fetches for a list of units on at most `max_workers` tokio tasks.
///
/// Workers pull units from a shared queue, so there is no cross-unit
/// ordering. Each unit is attempted sequentially under the retry policy,
/// and the worker paces itself after every fetch.
pub struct FetchPool {
    source: Arc<dyn DataSource>,
    options: FetchPoolOptions,
}

impl FetchPool {
    pub fn new(source: Arc<dyn DataSource>, options: FetchPoolOptions) -> Self {
        Self { source, options }
    }

    pub fn options(&self) -> &FetchPoolOptions {
        &self.options
    }

    /// Fetch every unit. One outcome per unit, in input order.
    pub async fn fetch_all(&self, units: &[WorkUnit]) -> Vec<(WorkUnit, FetchOutcome)> {
        self.fetch_all_with(units, |_, outcome| outcome).await
    }

    /// Fetch every unit and pass each outcome through `handler` on the
    /// worker that fetched it.
    ///
    /// A unit whose fetch or handler panics is handed to `handler` again
    /// as [`FetchOutcome::Failed`], so the output always holds exactly one
    /// entry per input unit, in input order.
    pub async fn fetch_all_with<T, H>(&self, units: &[WorkUnit], handler: H) -> Vec<(WorkUnit, T)>
    where
        T: Send + 'static,
        H: Fn(&WorkUnit, FetchOutcome) -> T + Send + Sync + 'static,
    {
        if units.is_empty() {
            return Vec::new();
        }

        let units: Arc<Vec<WorkUnit>> = Arc::new(units.to_vec());
        let handler = Arc::new(handler);
        let next = Arc::new(AtomicUsize::new(0));
        let workers = self.options.max_workers.clamp(1, units.len());

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let rng = match self.options.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(worker_id as u64)),
                None => StdRng::from_entropy(),
            };
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rng,
                Arc::clone(&units),
                Arc::clone(&next),
                Arc::clone(&self.source),
                Arc::clone(&handler),
                self.options.retry,
                self.options.pacing,
            )));
        }

        let mut slots: Vec<Option<T>> = (0..units.len()).map(|_| None).collect();
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(done) => {
                    for (index, value) in done {
                        slots[index] = Some(value);
                    }
                }
                Err(e) => error!(worker_id, error = %e, "Fetch worker terminated abnormally"),
            }
        }

        units
            .iter()
            .zip(slots)
            .map(|(unit, slot)| {
                let value = slot.unwrap_or_else(|| {
                    handler(
                        unit,
                        FetchOutcome::Failed {
                            reason: "fetch worker lost".into(),
                            attempts: 0,
                        },
                    )
                });
                (unit.clone(), value)
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<T, H>(
    worker_id: usize,
    mut rng: StdRng,
    units: Arc<Vec<WorkUnit>>,
    next: Arc<AtomicUsize>,
    source: Arc<dyn DataSource>,
    handler: Arc<H>,
    retry: RetryPolicy,
    pacing: Pacing,
) -> Vec<(usize, T)>
where
    T: Send + 'static,
    H: Fn(&WorkUnit, FetchOutcome) -> T + Send + Sync + 'static,
{
    let mut done = Vec::new();

    loop {
        let index = next.fetch_add(1, Ordering::SeqCst);
        let Some(unit) = units.get(index).cloned() else {
            break;
        };

        let task = {
            let source = Arc::clone(&source);
            let handler = Arc::clone(&handler);
            let unit = unit.clone();
            tokio::spawn(async move {
                let outcome = fetch_unit(source.as_ref(), &unit, retry).await;
                handler(&unit, outcome)
            })
        };

        let value = match task.await {
            Ok(value) => value,
            Err(e) => {
                error!(worker_id, unit = %unit.id, error = %e, "Unit processing panicked");
                handler(
                    &unit,
                    FetchOutcome::Failed {
                        reason: format!("panicked: {}", e),
                        attempts: 0,
                    },
                )
            }
        };
        done.push((index, value));

        let pause = pacing.delay(&mut rng);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    debug!(worker_id, units = done.len(), "Fetch worker finished");
    done
}

async fn fetch_unit(source: &dyn DataSource, unit: &WorkUnit, retry: RetryPolicy) -> FetchOutcome {
    let (result, attempts) = retry.run(&unit.id, move |_| source.fetch(unit)).await;

    match result {
        Ok(RawResult::Records(records)) => {
            debug!(unit = %unit.id, records = records.len(), attempts, "Fetched unit");
            FetchOutcome::Fetched(records)
        }
        Ok(RawResult::Empty) => {
            debug!(unit = %unit.id, attempts, "Unit has no data");
            FetchOutcome::Empty
        }
        Err(e) => {
            warn!(unit = %unit.id, attempts, error = %e, "Unit failed");
            FetchOutcome::Failed {
                reason: e.to_string(),
                attempts,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RawRecord;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted source: per-unit list of responses, last one repeats.
    struct ScriptedSource {
        script: HashMap<String, Vec<Result<RawResult, FetchError>>>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                script: HashMap::new(),
                calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn on(mut self, id: &str, responses: Vec<Result<RawResult, FetchError>>) -> Self {
            self.script.insert(id.to_string(), responses);
            self
        }

        fn calls(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl DataSource for ScriptedSource {
        async fn fetch(&self, unit: &WorkUnit) -> Result<RawResult, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let call = {
                let mut calls = self.calls.lock().unwrap();
                let entry = calls.entry(unit.id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if unit.id == "boom" {
                panic!("scripted panic");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match self.script.get(&unit.id) {
                Some(responses) => responses[(call - 1).min(responses.len() - 1)].clone(),
                None => Ok(RawResult::Records(vec![record()])),
            }
        }
    }

    fn record() -> RawRecord {
        let mut r = RawRecord::new();
        r.insert("close".into(), serde_json::json!(1.0));
        r
    }

    fn options(max_workers: usize) -> FetchPoolOptions {
        FetchPoolOptions {
            max_workers,
            retry: RetryPolicy::new(3, Duration::ZERO),
            pacing: Pacing::none(),
            seed: Some(7),
        }
    }

    fn units(ids: &[&str]) -> Vec<WorkUnit> {
        ids.iter().map(|id| WorkUnit::new(*id, None)).collect()
    }

    #[tokio::test]
    async fn test_one_outcome_per_unit_in_input_order() {
        let source = Arc::new(
            ScriptedSource::new()
                .on("empty", vec![Ok(RawResult::Empty)])
                .on("bad", vec![Err(FetchError::Permanent("404".into()))]),
        );
        let pool = FetchPool::new(source, options(3));
        let input = units(&["a", "empty", "bad", "b", "c"]);

        let out = pool.fetch_all(&input).await;

        let ids: Vec<&str> = out.iter().map(|(u, _)| u.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "empty", "bad", "b", "c"]);
        assert!(matches!(out[0].1, FetchOutcome::Fetched(ref r) if r.len() == 1));
        assert_eq!(out[1].1, FetchOutcome::Empty);
        assert!(matches!(out[2].1, FetchOutcome::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_transient_failures_stop_at_max_attempts() {
        let source = Arc::new(
            ScriptedSource::new()
                .on("flaky", vec![Err(FetchError::Transient("reset".into()))])
                .on(
                    "recovers",
                    vec![Err(FetchError::Transient("reset".into())), Ok(RawResult::Empty)],
                ),
        );
        let pool = FetchPool::new(source.clone(), options(2));

        let out = pool.fetch_all(&units(&["flaky", "recovers"])).await;

        assert!(matches!(out[0].1, FetchOutcome::Failed { attempts: 3, .. }));
        assert_eq!(out[1].1, FetchOutcome::Empty);
        assert_eq!(source.calls("flaky"), 3);
        assert_eq!(source.calls("recovers"), 2);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_max_workers() {
        let source = Arc::new(ScriptedSource::new());
        let pool = FetchPool::new(source.clone(), options(2));
        let ids: Vec<String> = (0..10).map(|i| format!("u{}", i)).collect();
        let input: Vec<WorkUnit> = ids.iter().map(|id| WorkUnit::new(id.clone(), None)).collect();

        let out = pool.fetch_all(&input).await;

        assert_eq!(out.len(), 10);
        assert!(source.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_unit_is_reported_failed() {
        let source = Arc::new(ScriptedSource::new());
        let pool = FetchPool::new(source, options(2));

        let out = pool.fetch_all(&units(&["a", "boom", "b"])).await;

        assert_eq!(out.len(), 3);
        assert!(matches!(out[0].1, FetchOutcome::Fetched(_)));
        assert!(matches!(out[1].1, FetchOutcome::Failed { ref reason, .. } if reason.contains("panicked")));
        assert!(matches!(out[2].1, FetchOutcome::Fetched(_)));
    }

    #[tokio::test]
    async fn test_handler_runs_per_unit() {
        let source = Arc::new(ScriptedSource::new().on("empty", vec![Ok(RawResult::Empty)]));
        let pool = FetchPool::new(source, options(4));

        let out = pool
            .fetch_all_with(&units(&["a", "empty"]), |unit, outcome| {
                format!("{}:{}", unit.id, matches!(outcome, FetchOutcome::Fetched(_)))
            })
            .await;

        assert_eq!(out[0].1, "a:true");
        assert_eq!(out[1].1, "empty:false");
    }

    #[test]
    fn test_pacing_delay_within_bounds_and_reproducible() {
        let pacing = Pacing::default();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);

        for _ in 0..50 {
            let da = pacing.delay(&mut a);
            assert!(da >= pacing.min && da <= pacing.max);
            assert_eq!(da, pacing.delay(&mut b));
        }
        assert_eq!(Pacing::none().delay(&mut a), Duration::ZERO);
    }
}
