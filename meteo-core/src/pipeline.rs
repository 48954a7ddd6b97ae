//! Fetch, assemble, accumulate and upload, one city at a time.

use serde::Serialize;
use std::time::Duration;

use anyhow::Context;

use crate::{
    assemble,
    config::{Config, FailurePolicy},
    dataset::Dataset,
    error::{FetchError, PipelineError},
    model::{CityTarget, FetchRequest, VariableGap},
    provider::{OpenMeteoClient, WeatherSource},
    retry::RetryPolicy,
    storage::{FsStore, ObjectLocation, ObjectStore, S3Store, StorageSink},
};

/// A city left out of the dataset and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CityFailure {
    pub city: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub cities_ok: Vec<String>,
    pub failures: Vec<CityFailure>,
    pub gaps: Vec<VariableGap>,
    pub rows: usize,
    pub uploads: usize,
}

#[derive(Debug)]
pub struct PipelineRunner {
    source: Box<dyn WeatherSource>,
    sink: StorageSink,
    policy: FailurePolicy,
}

impl PipelineRunner {
    pub fn new(source: Box<dyn WeatherSource>, sink: StorageSink, policy: FailurePolicy) -> Self {
        Self {
            source,
            sink,
            policy,
        }
    }

    /// Runner uploading to the configured S3 object.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.api.timeout_secs);
        let store = S3Store::from_config(&config.storage, timeout)
            .context("Failed to set up S3 storage")?;
        Self::with_store(config, Box::new(store))
    }

    /// Runner writing `<root>/<bucket>/<key>` on the local filesystem instead of S3.
    pub fn local(config: &Config, root: impl Into<std::path::PathBuf>) -> anyhow::Result<Self> {
        Self::with_store(config, Box::new(FsStore::new(root)))
    }

    pub fn with_store(config: &Config, store: Box<dyn ObjectStore>) -> anyhow::Result<Self> {
        let source = OpenMeteoClient::from_config(config)?;
        let retry =
            RetryPolicy::from(&config.retry).with_max_retries(config.storage.upload_retries);
        let sink = StorageSink::new(
            store,
            ObjectLocation::new(&config.storage.bucket, &config.storage.key),
            retry,
        );

        Ok(Self::new(Box::new(source), sink, config.pipeline.failure_policy))
    }

    /// Process every city in order, uploading the cumulative dataset after each one.
    ///
    /// Storage access is checked before anything is fetched. A city that fails is
    /// reported and skipped under [`FailurePolicy::BestEffort`], and no upload happens
    /// for that iteration since the dataset did not change. Upload errors end the run.
    pub async fn run(
        &self,
        cities: &[CityTarget],
        variables: &[String],
    ) -> Result<RunReport, PipelineError> {
        if cities.is_empty() {
            return Err(PipelineError::NoCities);
        }

        self.sink.ensure_access().await?;

        let mut dataset = Dataset::new(variables.to_vec());
        let mut report = RunReport::default();

        for target in cities {
            let request = FetchRequest {
                target: target.clone(),
                variables: variables.to_vec(),
            };

            let response = match self.source.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    self.city_failed(&mut report, e)?;
                    continue;
                }
            };

            let assembly = assemble::build(target, &response.range, &response.series, variables);
            let rows = assembly.rows.len();
            dataset.append(assembly.rows);
            report.gaps.extend(assembly.gaps);

            self.sink.upload(&dataset).await?;

            tracing::info!(city = %target.name, rows, total = dataset.len(), "city merged");
            report.cities_ok.push(target.name.clone());
            report.uploads += 1;
        }

        report.rows = dataset.len();

        if report.uploads == 0 {
            return Err(PipelineError::AllCitiesFailed {
                failed: report.failures.len(),
            });
        }

        Ok(report)
    }

    fn city_failed(&self, report: &mut RunReport, error: FetchError) -> Result<(), PipelineError> {
        match self.policy {
            FailurePolicy::FailFast => {
                tracing::error!(city = %error.city(), "{error}");
                Err(PipelineError::City(error))
            }
            FailurePolicy::BestEffort => {
                tracing::warn!(city = %error.city(), "skipping city: {error}");
                report.failures.push(CityFailure {
                    city: error.city().to_string(),
                    error: error.to_string(),
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{AttemptError, StorageError},
        model::{HourlyResponse, TimeRange, VariableSeries},
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::{
        collections::HashSet,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    #[derive(Debug, Default)]
    struct FakeSource {
        failing: HashSet<String>,
        fetches: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WeatherSource for FakeSource {
        async fn fetch(&self, request: &FetchRequest) -> Result<HourlyResponse, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let city = request.target.name.clone();
            if self.failing.contains(&city) {
                return Err(FetchError::FetchFailed {
                    city,
                    attempts: 6,
                    source: AttemptError::Status {
                        status: 503,
                        body: String::new(),
                    },
                });
            }

            let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let range = TimeRange::new(
                start,
                start + ChronoDuration::hours(2),
                ChronoDuration::hours(1),
            );
            let series: VariableSeries = request
                .variables
                .iter()
                .map(|v| (v.clone(), vec![Some(1.0), Some(2.0)]))
                .collect();
            Ok(HourlyResponse { range, series })
        }
    }

    #[derive(Debug, Default)]
    struct RecordingStore {
        deny_access: bool,
        uploads: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn ensure_access(&self) -> Result<(), StorageError> {
            if self.deny_access {
                return Err(StorageError::CredentialResolutionFailed("no keys".into()));
            }
            Ok(())
        }

        async fn put_object(
            &self,
            _: &ObjectLocation,
            body: Vec<u8>,
            _: &str,
        ) -> Result<(), StorageError> {
            let text = String::from_utf8(body).map_err(|e| StorageError::Serialize(e.to_string()))?;
            self.uploads.lock().unwrap().push(text);
            Ok(())
        }
    }

    fn cities(names: &[&str]) -> Vec<CityTarget> {
        names.iter().map(|n| CityTarget::new(*n, 45.0, 3.0)).collect()
    }

    fn runner(
        failing: &[&str],
        deny_access: bool,
        policy: FailurePolicy,
    ) -> (PipelineRunner, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let source = FakeSource {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            fetches: fetches.clone(),
        };
        let store = RecordingStore {
            deny_access,
            uploads: uploads.clone(),
        };
        let sink = StorageSink::new(
            Box::new(store),
            ObjectLocation::new("bucket", "weather.csv"),
            RetryPolicy::default().with_max_retries(0),
        );
        (PipelineRunner::new(Box::new(source), sink, policy), fetches, uploads)
    }

    fn vars() -> Vec<String> {
        vec!["temperature_2m".into()]
    }

    #[tokio::test]
    async fn uploads_after_every_city_with_growing_dataset() {
        let (runner, _, uploads) = runner(&[], false, FailurePolicy::BestEffort);
        let report = runner.run(&cities(&["A", "B"]), &vars()).await.expect("run");

        assert_eq!(report.uploads, 2);
        assert_eq!(report.rows, 4);
        assert_eq!(report.cities_ok, ["A", "B"]);

        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads[0].lines().count(), 3);
        assert_eq!(uploads[1].lines().count(), 5);
        let cities: Vec<&str> = uploads[1]
            .lines()
            .skip(1)
            .map(|l| l.rsplit(',').next().unwrap())
            .collect();
        assert_eq!(cities, ["A", "A", "B", "B"]);
    }

    #[tokio::test]
    async fn failed_city_is_skipped_and_run_succeeds() {
        let (runner, _, uploads) = runner(&["B"], false, FailurePolicy::BestEffort);
        let report = runner.run(&cities(&["A", "B"]), &vars()).await.expect("run");

        assert_eq!(report.cities_ok, ["A"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].city, "B");
        assert_eq!(report.rows, 2);

        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].lines().skip(1).all(|l| l.ends_with(",A")));
    }

    #[tokio::test]
    async fn credential_failure_aborts_before_any_fetch() {
        let (runner, fetches, uploads) = runner(&[], true, FailurePolicy::BestEffort);
        let err = runner.run(&cities(&["A", "B"]), &vars()).await.unwrap_err();

        assert!(matches!(err, PipelineError::Storage(StorageError::CredentialResolutionFailed(_))));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert!(uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_city_failing_is_a_run_failure() {
        let (runner, _, uploads) = runner(&["A", "B"], false, FailurePolicy::BestEffort);
        let err = runner.run(&cities(&["A", "B"]), &vars()).await.unwrap_err();

        assert!(matches!(err, PipelineError::AllCitiesFailed { failed: 2 }));
        assert!(uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_fast_stops_at_first_failure_but_keeps_prior_upload() {
        let (runner, fetches, uploads) = runner(&["B"], false, FailurePolicy::FailFast);
        let err = runner.run(&cities(&["A", "B", "C"]), &vars()).await.unwrap_err();

        assert!(matches!(err, PipelineError::City(FetchError::FetchFailed { .. })));
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(uploads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_city_list_is_rejected() {
        let (runner, _, _) = runner(&[], false, FailurePolicy::BestEffort);
        let err = runner.run(&[], &vars()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoCities));
    }
}
