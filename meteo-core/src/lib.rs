//! Core library for the `meteo` pipeline.
//!
//! This crate defines:
//! - Configuration (cities, variables, API, cache, retry and storage settings)
//! - The weather source abstraction and its Open-Meteo client
//! - Row assembly and the per-run dataset
//! - CSV serialization and object-store uploads (S3 or local directory)
//! - The pipeline runner tying them together
//!
//! It is used by `meteo-cli`, but can also be driven by any other scheduler.

pub mod assemble;
pub mod config;
pub mod credentials;
pub mod dataset;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod retry;
pub mod storage;

pub use config::{Config, FailurePolicy};
pub use dataset::Dataset;
pub use error::{AttemptError, FetchError, PipelineError, StorageError};
pub use model::{
    CityTarget, FetchRequest, HourlyResponse, Row, TimeRange, VariableGap, VariableSeries,
};
pub use pipeline::{CityFailure, PipelineRunner, RunReport};
pub use provider::{OpenMeteoClient, ResponseCache, WeatherSource};
pub use retry::RetryPolicy;
pub use storage::{FsStore, ObjectLocation, ObjectStore, S3Store, StorageSink};
