use async_trait::async_trait;
use std::fmt::Debug;

use crate::{
    error::FetchError,
    model::{FetchRequest, HourlyResponse},
};

pub mod cache;
pub mod openmeteo;

pub use cache::ResponseCache;
pub use openmeteo::OpenMeteoClient;

/// A source of hourly series for one city at a time.
#[async_trait]
pub trait WeatherSource: Send + Sync + Debug {
    async fn fetch(&self, request: &FetchRequest) -> Result<HourlyResponse, FetchError>;
}
