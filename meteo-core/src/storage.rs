//! Serialization of the dataset and its upload to a single fixed object.

use async_trait::async_trait;
use std::fmt::{self, Debug};

use crate::{dataset::Dataset, error::StorageError, retry::RetryPolicy};

pub mod fs;
pub mod s3;

pub use fs::FsStore;
pub use s3::S3Store;

pub const CSV_CONTENT_TYPE: &str = "text/csv; charset=utf-8";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

/// Bucket and key of the uploaded object. Every upload replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// A place objects can be written to with whole-object overwrite semantics.
#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    /// Establish that uploads are possible at all, e.g. that credentials resolve.
    async fn ensure_access(&self) -> Result<(), StorageError>;

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;
}

/// Serializes datasets to CSV and writes them to one location, retrying transient failures.
#[derive(Debug)]
pub struct StorageSink {
    store: Box<dyn ObjectStore>,
    location: ObjectLocation,
    retry: RetryPolicy,
}

impl StorageSink {
    pub fn new(store: Box<dyn ObjectStore>, location: ObjectLocation, retry: RetryPolicy) -> Self {
        Self {
            store,
            location,
            retry,
        }
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    pub async fn ensure_access(&self) -> Result<(), StorageError> {
        self.store.ensure_access().await
    }

    /// Replace the stored object with `dataset`.
    ///
    /// Only transient errors are retried; credential problems and rejections come back
    /// on the first attempt.
    pub async fn upload(&self, dataset: &Dataset) -> Result<(), StorageError> {
        let body = encode_csv(dataset)?;
        let attempts = self.retry.attempts();

        let mut attempt = 0;
        loop {
            let err = match self
                .store
                .put_object(&self.location, body.clone(), CSV_CONTENT_TYPE)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        location = %self.location,
                        rows = dataset.len(),
                        bytes = body.len(),
                        "dataset uploaded"
                    );
                    return Ok(());
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= attempts {
                return Err(StorageError::UploadFailed {
                    location: self.location.clone(),
                    attempts,
                    source: Box::new(err),
                });
            }

            let delay = self.retry.delay_for_attempt(attempt - 1);
            tracing::warn!(
                location = %self.location,
                "upload attempt {attempt} of {attempts} failed: {err}; retrying in {delay:?}"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Header plus one line per row. Absent values are empty fields, never zero.
pub fn encode_csv(dataset: &Dataset) -> Result<Vec<u8>, StorageError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());

    wtr.write_record(dataset.header())
        .map_err(|e| StorageError::Serialize(e.to_string()))?;

    for row in dataset.rows() {
        let record = std::iter::once(row.timestamp.format(DATE_FORMAT).to_string())
            .chain(row.values.iter().map(|v| v.map(format_value).unwrap_or_default()))
            .chain(std::iter::once(row.city.clone()));

        wtr.write_record(record)
            .map_err(|e| StorageError::Serialize(e.to_string()))?;
    }

    wtr.into_inner().map_err(|e| StorageError::Serialize(e.to_string()))
}

/// Locale-independent number formatting. Integral values keep one decimal (`10.0`).
pub fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Row;
    use chrono::{TimeZone, Utc};
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use std::time::Duration;

    fn dataset() -> Dataset {
        let ts = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        Dataset::new(vec!["temperature_2m".into(), "precipitation".into()]).with_rows(vec![
            Row {
                timestamp: ts(0),
                city: "Lille".into(),
                values: vec![Some(10.0), Some(0.25)],
            },
            Row {
                timestamp: ts(1),
                city: "Lille".into(),
                values: vec![Some(-1.5), None],
            },
        ])
    }

    #[test]
    fn csv_layout() {
        let out = String::from_utf8(encode_csv(&dataset()).expect("encode")).expect("utf8");
        assert_eq!(
            out,
            "date,temperature_2m,precipitation,city\n\
             2024-01-01 00:00:00+00:00,10.0,0.25,Lille\n\
             2024-01-01 01:00:00+00:00,-1.5,,Lille\n"
        );
    }

    #[test]
    fn serialization_is_byte_identical_across_calls() {
        let ds = dataset();
        assert_eq!(encode_csv(&ds).expect("encode"), encode_csv(&ds).expect("encode"));
    }

    #[test]
    fn empty_dataset_is_header_only() {
        let ds = Dataset::new(vec!["t".into()]);
        assert_eq!(encode_csv(&ds).expect("encode"), b"date,t,city\n");
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_value(10.0), "10.0");
        assert_eq!(format_value(0.1), "0.1");
        assert_eq!(format_value(-273.15), "-273.15");
        assert_eq!(format_value(3600.0), "3600.0");
    }

    #[derive(Debug)]
    struct FlakyStore {
        failures: u32,
        error: fn() -> StorageError,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn ensure_access(&self) -> Result<(), StorageError> {
            Ok(())
        }

        async fn put_object(
            &self,
            _: &ObjectLocation,
            _: Vec<u8>,
            _: &str,
        ) -> Result<(), StorageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures { Err((self.error)()) } else { Ok(()) }
        }
    }

    fn sink(
        failures: u32,
        error: fn() -> StorageError,
        retries: u32,
    ) -> (StorageSink, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let store = FlakyStore {
            failures,
            error,
            calls: calls.clone(),
        };
        let retry = RetryPolicy {
            max_retries: retries,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
        };
        (StorageSink::new(Box::new(store), ObjectLocation::new("b", "k.csv"), retry), calls)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (sink, calls) = sink(2, || StorageError::Transient("503".into()), 3);
        sink.upload(&dataset()).await.expect("eventually succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_upload_failed() {
        let (sink, calls) = sink(10, || StorageError::Transient("503".into()), 2);
        let err = sink.upload(&dataset()).await.unwrap_err();
        assert!(matches!(err, StorageError::UploadFailed { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let (sink, calls) = sink(
            10,
            || StorageError::Unauthorized {
                status: 403,
                message: "SignatureDoesNotMatch".into(),
            },
            3,
        );
        let err = sink.upload(&dataset()).await.unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized { status: 403, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
