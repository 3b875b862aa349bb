use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{Product, Row, VariableSpec};
use crate::error::CensusError;
use crate::geography::GeographyInstance;
use crate::source::{FailureKind, GeographyFilter, SourceError, StatisticsSource};

const CANCEL_POLL: Duration = Duration::from_millis(25);

/// One logical request: every variable of `variables` for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    product: Product,
    year: u16,
    geography: GeographyInstance,
    variables: VariableSpec,
}

impl FetchRequest {
    pub fn new(
        product: Product,
        year: u16,
        geography: GeographyInstance,
        variables: VariableSpec,
    ) -> Self {
        Self {
            product,
            year,
            geography,
            variables,
        }
    }

    pub fn product(&self) -> Product {
        self.product
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn geography(&self) -> &GeographyInstance {
        &self.geography
    }

    pub fn variables(&self) -> &VariableSpec {
        &self.variables
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    #[serde(skip)]
    pub request: FetchRequest,
    pub geoid: String,
    pub kind: FailureKind,
    pub transient: bool,
    pub attempts: usize,
    pub message: String,
}

impl FetchFailure {
    pub fn to_error(&self) -> CensusError {
        if self.transient {
            CensusError::TransientFetch {
                geoid: self.geoid.clone(),
                attempts: self.attempts,
                message: self.message.clone(),
            }
        } else {
            CensusError::NonTransientFetch {
                geoid: self.geoid.clone(),
                message: self.message.clone(),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum FetchResult {
    Rows {
        request: FetchRequest,
        rows: Vec<Row>,
        calls: usize,
        attempts: usize,
    },
    Failed(FetchFailure),
}

impl FetchResult {
    pub fn request(&self) -> &FetchRequest {
        match self {
            FetchResult::Rows { request, .. } => request,
            FetchResult::Failed(failure) => &failure.request,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Rows { .. })
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            FetchResult::Rows { rows, .. } => Some(rows),
            FetchResult::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            FetchResult::Failed(failure) => Some(failure),
            FetchResult::Rows { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_parallel: usize,
    pub max_retries: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub variable_ceiling: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            variable_ceiling: 49,
        }
    }
}

/// Run-level cancellation signal shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct CallJob {
    request: usize,
    variables: VariableSpec,
}

enum CallOutcome {
    Rows { rows: Vec<Row>, attempts: usize },
    Failed { error: SourceError, attempts: usize },
    Cancelled { attempts: usize },
    Skipped,
}

pub struct BatchFetcher<S: StatisticsSource> {
    source: S,
    options: FetchOptions,
}

impl<S: StatisticsSource> BatchFetcher<S> {
    pub fn new(source: S, options: FetchOptions) -> Self {
        Self { source, options }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Returns exactly one result per request, at the request's index.
    pub fn fetch_all(&self, requests: &[FetchRequest], cancel: &CancelFlag) -> Vec<FetchResult> {
        let jobs = requests
            .iter()
            .enumerate()
            .flat_map(|(index, request)| {
                request
                    .variables
                    .chunks(self.options.variable_ceiling)
                    .into_iter()
                    .map(move |variables| CallJob {
                        request: index,
                        variables,
                    })
            })
            .collect::<Vec<_>>();

        let workers = self.options.max_parallel.max(1).min(jobs.len().max(1));
        info!(
            requests = requests.len(),
            calls = jobs.len(),
            workers,
            "starting batch fetch"
        );
        let start = Instant::now();

        let mut outcomes = (0..jobs.len()).map(|_| None).collect::<Vec<_>>();
        let cursor = AtomicUsize::new(0);
        let abandoned = (0..requests.len())
            .map(|_| AtomicBool::new(false))
            .collect::<Vec<_>>();

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            for _ in 0..workers {
                let tx = tx.clone();
                let (jobs, cursor, abandoned) = (&jobs, &cursor, &abandoned);
                scope.spawn(move || {
                    loop {
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = jobs.get(index) else {
                            break;
                        };
                        let outcome = if cancel.is_cancelled() {
                            CallOutcome::Cancelled { attempts: 0 }
                        } else if abandoned[job.request].load(Ordering::SeqCst) {
                            CallOutcome::Skipped
                        } else {
                            self.call_with_retries(&requests[job.request], &job.variables, cancel)
                        };
                        if !matches!(outcome, CallOutcome::Rows { .. }) {
                            abandoned[job.request].store(true, Ordering::SeqCst);
                        }
                        if tx.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            for (index, outcome) in rx {
                outcomes[index] = Some(outcome);
            }
        });

        let mut per_request: Vec<Vec<CallOutcome>> = (0..requests.len()).map(|_| Vec::new()).collect();
        for (job, outcome) in jobs.iter().zip(outcomes) {
            per_request[job.request].push(outcome.unwrap_or(CallOutcome::Cancelled { attempts: 0 }));
        }

        let results = requests
            .iter()
            .zip(per_request)
            .map(|(request, outcomes)| gather(request, outcomes))
            .collect::<Vec<_>>();

        let failed = results.iter().filter(|result| !result.is_success()).count();
        info!(
            succeeded = results.len() - failed,
            failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch fetch finished"
        );
        results
    }

    fn call_with_retries(
        &self,
        request: &FetchRequest,
        variables: &VariableSpec,
        cancel: &CancelFlag,
    ) -> CallOutcome {
        let filter = GeographyFilter::for_instance(&request.geography);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            debug!(geoid = request.geography.id(), attempt, variables = variables.len(), "fetch call");
            match self
                .source
                .fetch(request.product, request.year, variables, &filter)
            {
                Ok(rows) => {
                    return CallOutcome::Rows {
                        rows,
                        attempts: attempt,
                    };
                }
                Err(error) if error.is_transient() && attempt <= self.options.max_retries => {
                    let delay = backoff_delay(
                        self.options.backoff_base,
                        self.options.backoff_max,
                        attempt - 1,
                    );
                    warn!(
                        geoid = request.geography.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient fetch failure, retrying"
                    );
                    if !sleep_unless_cancelled(delay, cancel) {
                        return CallOutcome::Cancelled { attempts: attempt };
                    }
                }
                Err(error) => {
                    return CallOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

/// `base * 2^attempt`, capped at `max`, plus up to half of that as jitter.
pub fn backoff_delay(base: Duration, max: Duration, attempt: usize) -> Duration {
    let base_ms = base.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    let exp = 1u64 << attempt.min(16);
    let delay_ms = base_ms.saturating_mul(exp).min(max_ms);
    let jitter_ms = if delay_ms > 1 {
        rand::thread_rng().gen_range(0..=delay_ms / 2)
    } else {
        0
    };
    Duration::from_millis(delay_ms + jitter_ms)
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

fn gather(request: &FetchRequest, outcomes: Vec<CallOutcome>) -> FetchResult {
    let calls = outcomes.len();
    let attempts = outcomes
        .iter()
        .map(|outcome| match outcome {
            CallOutcome::Rows { attempts, .. }
            | CallOutcome::Failed { attempts, .. }
            | CallOutcome::Cancelled { attempts } => *attempts,
            CallOutcome::Skipped => 0,
        })
        .sum();

    let mut chunks = Vec::with_capacity(calls);
    let mut cancelled = false;
    for outcome in outcomes {
        match outcome {
            CallOutcome::Rows { rows, .. } => chunks.push(rows),
            CallOutcome::Failed { error, .. } => {
                return FetchResult::Failed(FetchFailure {
                    request: request.clone(),
                    geoid: request.geography.id().to_string(),
                    kind: error.kind(),
                    transient: error.is_transient(),
                    attempts,
                    message: error.to_string(),
                });
            }
            CallOutcome::Cancelled { .. } | CallOutcome::Skipped => cancelled = true,
        }
    }

    if cancelled {
        return FetchResult::Failed(FetchFailure {
            request: request.clone(),
            geoid: request.geography.id().to_string(),
            kind: FailureKind::Cancelled,
            transient: true,
            attempts,
            message: "run cancelled before the request completed".to_string(),
        });
    }

    FetchResult::Rows {
        request: request.clone(),
        rows: merge_rows(chunks),
        calls,
        attempts,
    }
}

/// Column-merges the rows of split calls by GEOID, keeping first-seen order.
pub fn merge_rows(chunks: Vec<Vec<Row>>) -> Vec<Row> {
    let mut merged: Vec<Row> = Vec::new();
    let mut positions = HashMap::new();
    for row in chunks.into_iter().flatten() {
        match positions.get(&row.geoid) {
            Some(&position) => {
                let existing: &mut Row = &mut merged[position];
                if existing.name.is_none() {
                    existing.name = row.name;
                }
                existing.values.extend(row.values);
            }
            None => {
                positions.insert(row.geoid.clone(), merged.len());
                merged.push(row);
            }
        }
    }
    merged
}
