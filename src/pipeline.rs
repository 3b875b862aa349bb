use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::boundaries::GeometrySource;
use crate::config::{ResolvedConfig, validate_fetch_options};
use crate::domain::{Product, Row, VariableSpec};
use crate::error::CensusError;
use crate::fetcher::{BatchFetcher, CancelFlag, FetchOptions, FetchRequest, FetchResult};
use crate::geography::{GeographyInstance, GeographyLevel};
use crate::geometry::Crs;
use crate::joiner::GeometryJoiner;
use crate::resolver::{RequestResolver, ScopeFilter};
use crate::sink::{RecordSink, SinkTarget};
use crate::source::{FailureKind, GeographyCatalog, StatisticsSource};
use crate::store::BoundaryCache;
use crate::transform::{RecordSet, Transformer};

/// What to fetch: one level, one scope, one vintage, one variable set.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub level: GeographyLevel,
    pub scope: ScopeFilter,
    pub product: Product,
    pub year: u16,
    pub variables: VariableSpec,
    pub target_crs: Crs,
}

impl PipelineRequest {
    pub fn new(
        level: GeographyLevel,
        scope: ScopeFilter,
        product: Product,
        year: u16,
        variables: VariableSpec,
    ) -> Self {
        Self {
            level,
            scope,
            product,
            year,
            variables,
            target_crs: Crs::WGS84,
        }
    }

    pub fn with_target_crs(mut self, crs: Crs) -> Self {
        self.target_crs = crs;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub fetch: FetchOptions,
    /// Fail when the scope resolves to no instances.
    pub require_instances: bool,
    /// Fail when any fetch fails instead of reporting partial results.
    pub fail_on_any_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedInstance {
    pub instance: GeographyInstance,
    pub kind: FailureKind,
    pub transient: bool,
    pub attempts: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub level: GeographyLevel,
    pub product: Product,
    pub year: u16,
    pub instances_resolved: usize,
    pub fetches_succeeded: usize,
    pub fetches_failed: usize,
    pub physical_calls: usize,
    pub failures: Vec<FailedInstance>,
    pub records_written: usize,
    pub geometry_absent: usize,
    pub elapsed_ms: u64,
}

impl RunReport {
    /// Instances to pass to [`Pipeline::run_instances`] for a retry.
    pub fn failed_instances(&self) -> Vec<GeographyInstance> {
        self.failures
            .iter()
            .map(|failure| failure.instance.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Discards progress events.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct Pipeline<S: StatisticsSource, C: GeographyCatalog, G: GeometrySource> {
    resolver: RequestResolver<C>,
    fetcher: BatchFetcher<S>,
    joiner: GeometryJoiner<G>,
    transformer: Transformer,
    options: PipelineOptions,
    progress: Box<dyn ProgressSink>,
}

impl<S: StatisticsSource, C: GeographyCatalog, G: GeometrySource> Pipeline<S, C, G> {
    pub fn new(
        source: S,
        catalog: C,
        geometry: G,
        cache: BoundaryCache,
        options: PipelineOptions,
    ) -> Result<Self, CensusError> {
        validate_fetch_options(&options.fetch)?;
        Ok(Self {
            resolver: RequestResolver::new(catalog),
            fetcher: BatchFetcher::new(source, options.fetch.clone()),
            joiner: GeometryJoiner::new(geometry, cache),
            transformer: Transformer::new(),
            options,
            progress: Box::new(NoProgress),
        })
    }

    pub fn from_config(
        config: &ResolvedConfig,
        source: S,
        catalog: C,
        geometry: G,
    ) -> Result<Self, CensusError> {
        Self::new(
            source,
            catalog,
            geometry,
            BoundaryCache::with_root(config.cache_root.clone()),
            config.options.clone(),
        )
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn joiner(&self) -> &GeometryJoiner<G> {
        &self.joiner
    }

    pub fn run(
        &self,
        request: &PipelineRequest,
        sink: &dyn RecordSink,
        target: &SinkTarget,
    ) -> Result<RunReport, CensusError> {
        self.run_with_cancel(request, sink, target, &CancelFlag::new())
    }

    /// Like [`Pipeline::run`], stopping new fetch calls once `cancel` is set.
    /// The flag belongs to this run only.
    pub fn run_with_cancel(
        &self,
        request: &PipelineRequest,
        sink: &dyn RecordSink,
        target: &SinkTarget,
        cancel: &CancelFlag,
    ) -> Result<RunReport, CensusError> {
        self.emit(
            format!("phase=Resolve; {} within [{}]", request.level, request.scope),
            None,
        );
        let start = Instant::now();
        let instances = self.resolver.resolve(
            request.level,
            &request.scope,
            request.product,
            request.year,
        )?;
        self.emit(
            format!("phase=Resolve; {} instances", instances.len()),
            Some(start.elapsed()),
        );
        if instances.is_empty() && self.options.require_instances {
            return Err(CensusError::EmptyResolution(request.level.to_string()));
        }
        self.run_instances_with_cancel(request, &instances, sink, target, cancel)
    }

    /// Runs fetch, join, transform and write for already resolved instances.
    pub fn run_instances(
        &self,
        request: &PipelineRequest,
        instances: &[GeographyInstance],
        sink: &dyn RecordSink,
        target: &SinkTarget,
    ) -> Result<RunReport, CensusError> {
        self.run_instances_with_cancel(request, instances, sink, target, &CancelFlag::new())
    }

    pub fn run_instances_with_cancel(
        &self,
        request: &PipelineRequest,
        instances: &[GeographyInstance],
        sink: &dyn RecordSink,
        target: &SinkTarget,
        cancel: &CancelFlag,
    ) -> Result<RunReport, CensusError> {
        let start = Instant::now();
        if let Some(stray) = instances
            .iter()
            .find(|instance| instance.level() != request.level)
        {
            return Err(CensusError::InvalidLevel(format!(
                "{stray} in a {} run",
                request.level
            )));
        }
        request.product.check_available(request.year)?;

        self.emit(
            format!("phase=Fetch; {} instances", instances.len()),
            None,
        );
        let requests = instances
            .iter()
            .map(|instance| {
                FetchRequest::new(
                    request.product,
                    request.year,
                    instance.clone(),
                    request.variables.clone(),
                )
            })
            .collect::<Vec<_>>();
        let fetch_start = Instant::now();
        let results = self.fetcher.fetch_all(&requests, cancel);
        self.emit(
            format!("phase=Fetch; {} results", results.len()),
            Some(fetch_start.elapsed()),
        );

        let total = results.len();
        let mut rows = Vec::new();
        let mut failures = Vec::new();
        let mut physical_calls = 0usize;
        for result in results {
            match result {
                FetchResult::Rows {
                    rows: fetched,
                    calls,
                    ..
                } => {
                    physical_calls += calls;
                    rows.extend(
                        fetched
                            .into_iter()
                            .map(|row| label_row(row, &request.variables)),
                    );
                }
                FetchResult::Failed(failure) => {
                    warn!(
                        geoid = %failure.geoid,
                        kind = ?failure.kind,
                        attempts = failure.attempts,
                        message = %failure.message,
                        "fetch failed"
                    );
                    failures.push(FailedInstance {
                        instance: failure.request.geography().clone(),
                        kind: failure.kind,
                        transient: failure.transient,
                        attempts: failure.attempts,
                        message: failure.message,
                    });
                }
            }
        }
        if total > 0 && failures.len() == total {
            return Err(CensusError::AllFetchesFailed { failures });
        }
        if self.options.fail_on_any_failure && !failures.is_empty() {
            return Err(CensusError::FetchFailures { failures, total });
        }

        // Nothing to attach boundaries to, so the boundary set is not fetched.
        let records = if rows.is_empty() {
            self.emit("phase=Join; no rows".to_string(), None);
            Vec::new()
        } else {
            self.emit("phase=Join; attaching boundaries".to_string(), None);
            self.joiner
                .join(request.level, request.year, &rows, request.target_crs)?
        };

        self.emit("phase=Transform; deriving columns".to_string(), None);
        let records = self
            .transformer
            .apply(RecordSet::new(request.variables.columns(), records))?;

        self.emit(format!("phase=Write; {}", target.name), None);
        sink.write(&records, target).map_err(|err| match err {
            CensusError::SinkWrite(_) => err,
            other => CensusError::SinkWrite(other.to_string()),
        })?;

        let report = RunReport {
            level: request.level,
            product: request.product,
            year: request.year,
            instances_resolved: instances.len(),
            fetches_succeeded: total - failures.len(),
            fetches_failed: failures.len(),
            physical_calls,
            failures,
            records_written: records.len(),
            geometry_absent: records.geometry_absent(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            level = %report.level,
            year = report.year,
            instances = report.instances_resolved,
            failed = report.fetches_failed,
            records = report.records_written,
            geometry_absent = report.geometry_absent,
            "pipeline run finished"
        );
        Ok(report)
    }

    fn emit(&self, message: String, elapsed: Option<Duration>) {
        self.progress.event(ProgressEvent { message, elapsed });
    }
}

/// Re-keys row values from variable codes to output column names, dropping
/// anything that was not requested.
fn label_row(row: Row, variables: &VariableSpec) -> Row {
    let values = row
        .values
        .into_iter()
        .filter_map(|(code, value)| {
            variables
                .column_for(&code)
                .map(|column| (column.to_string(), value))
        })
        .collect();
    Row {
        geoid: row.geoid,
        name: row.name,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Value;

    #[test]
    fn label_row_uses_column_names() {
        let spec = VariableSpec::new([("B01003_001E", "total_population")]).unwrap();
        let row = Row::new("39049")
            .with_value("B01003_001E", Value::Number(5.0))
            .with_value("B99999_001E", Value::Number(1.0));
        let labelled = label_row(row, &spec);
        assert_eq!(labelled.get("total_population"), &Value::Number(5.0));
        assert_eq!(labelled.values.len(), 1);
    }
}
