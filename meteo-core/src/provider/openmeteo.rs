use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::HashMap, time::Duration as StdDuration};

use crate::{
    config::Config,
    error::{AttemptError, FetchError, truncate_body},
    model::{FetchRequest, HourlyResponse, TimeRange, VariableSeries},
    provider::{ResponseCache, WeatherSource},
    retry::RetryPolicy,
};

/// Spacing assumed when a response carries a single sample.
const DEFAULT_INTERVAL_SECS: i64 = 3600;

/// Open-Meteo forecast client with an optional response cache and bounded retries.
///
/// Built once per run and passed to the pipeline; it holds no other state.
#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    endpoint: Url,
    http: Client,
    retry: RetryPolicy,
    cache: Option<ResponseCache>,
}

impl OpenMeteoClient {
    pub fn new(endpoint: &str, timeout: StdDuration, retry: RetryPolicy) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid weather API endpoint: {endpoint}"))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint,
            http,
            retry,
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Self::new(
            &config.api.endpoint,
            StdDuration::from_secs(config.api.timeout_secs),
            RetryPolicy::from(&config.retry),
        )?;

        if !config.cache.enabled {
            return Ok(client);
        }

        let cache = ResponseCache::new(
            config.cache_dir()?,
            StdDuration::from_secs(config.cache.ttl_secs),
        );
        Ok(client.with_cache(cache))
    }

    /// Full request URL; also the cache key.
    pub fn request_url(&self, request: &FetchRequest) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("latitude", &request.target.latitude.to_string())
            .append_pair("longitude", &request.target.longitude.to_string())
            .append_pair("hourly", &request.variables.join(","))
            .append_pair("timeformat", "unixtime");
        url
    }

    /// Single reachability check against the endpoint, no retries and no cache.
    pub async fn probe(&self) -> Result<(), AttemptError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("latitude", "52.52")
            .append_pair("longitude", "13.41")
            .append_pair("hourly", "temperature_2m");

        self.get_body(url).await.map(|_| ())
    }

    async fn get_body(&self, url: Url) -> Result<String, AttemptError> {
        let res = self.http.get(url).send().await?;

        let status = res.status();
        let body = res.text().await?;

        if !status.is_success() {
            return Err(AttemptError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        Ok(body)
    }

    fn cached(&self, url: &Url, request: &FetchRequest) -> Option<HourlyResponse> {
        let cache = self.cache.as_ref()?;
        let body = match cache.get(url.as_str()) {
            Ok(body) => body?,
            Err(e) => {
                tracing::warn!(city = %request.target.name, "cache read failed: {e}");
                return None;
            }
        };

        match decode_hourly(&body, &request.variables) {
            Ok(response) => {
                tracing::debug!(city = %request.target.name, "serving weather from cache");
                Some(response)
            }
            Err(_) => {
                tracing::warn!(city = %request.target.name, "discarding undecodable cache entry");
                None
            }
        }
    }

    fn store(&self, url: &Url, body: &str, city: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(url.as_str(), body) {
                tracing::warn!(city, "cache write failed: {e}");
            }
        }
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<HourlyResponse, FetchError> {
        let city = request.target.name.as_str();
        let url = self.request_url(request);

        if let Some(hit) = self.cached(&url, request) {
            return Ok(hit);
        }

        let attempts = self.retry.attempts();
        let mut attempt = 0;
        loop {
            let outcome = match self.get_body(url.clone()).await {
                Ok(body) => match decode_hourly(&body, &request.variables) {
                    Ok(response) => {
                        self.store(&url, &body, city);
                        return Ok(response);
                    }
                    Err(DecodeError::Malformed(reason)) => {
                        return Err(FetchError::MalformedResponse {
                            city: city.to_string(),
                            reason,
                        });
                    }
                    Err(DecodeError::Body(e)) => AttemptError::Decode(e),
                },
                Err(e) => e,
            };

            attempt += 1;
            if attempt >= attempts {
                return Err(FetchError::FetchFailed {
                    city: city.to_string(),
                    attempts,
                    source: outcome,
                });
            }

            let delay = self.retry.delay_for_attempt(attempt - 1);
            tracing::warn!(
                city,
                "attempt {attempt} of {attempts} failed: {outcome}; retrying in {delay:?}"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct OmHourly {
    time: Vec<i64>,
    #[serde(flatten)]
    variables: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct OmResponse {
    hourly: OmHourly,
}

#[derive(Debug)]
enum DecodeError {
    /// Not the JSON shape we expect at all; worth another attempt.
    Body(serde_json::Error),
    /// Well-formed JSON whose samples don't line up; retrying won't help.
    Malformed(String),
}

/// Decode a JSON body into a time range plus a name -> series map.
///
/// Variables missing from the body decode as empty series and `null` samples as `None`;
/// the assembler reports both as gaps. An array whose length differs from the
/// timestamp count is malformed.
fn decode_hourly(body: &str, variables: &[String]) -> Result<HourlyResponse, DecodeError> {
    let parsed: OmResponse = serde_json::from_str(body).map_err(DecodeError::Body)?;
    let hourly = parsed.hourly;
    let range = time_range(&hourly.time).map_err(DecodeError::Malformed)?;
    let expected = hourly.time.len();

    let mut series = VariableSeries::new();
    for variable in variables {
        let values = match hourly.variables.get(variable) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => {
                if items.len() != expected {
                    return Err(DecodeError::Malformed(format!(
                        "variable '{variable}' has {} samples but {expected} timestamps \
                         were declared",
                        items.len()
                    )));
                }
                items
                    .iter()
                    .map(|v| match v {
                        Value::Null => Ok(None),
                        Value::Number(n) => Ok(n.as_f64()),
                        other => Err(DecodeError::Malformed(format!(
                            "variable '{variable}' has a non-numeric sample: {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            Some(other) => {
                return Err(DecodeError::Malformed(format!(
                    "variable '{variable}' is not an array: {other}"
                )));
            }
        };
        series.insert(variable.clone(), values);
    }

    Ok(HourlyResponse { range, series })
}

fn time_range(time: &[i64]) -> Result<TimeRange, String> {
    let Some(&first) = time.first() else {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        return Ok(TimeRange::new(epoch, epoch, Duration::seconds(DEFAULT_INTERVAL_SECS)));
    };

    let step = match time.get(1) {
        Some(&second) => second
            .checked_sub(first)
            .ok_or_else(|| format!("timestamps {first} and {second} are too far apart"))?,
        None => DEFAULT_INTERVAL_SECS,
    };
    if step <= 0 {
        return Err("timestamps are not strictly increasing".to_string());
    }
    if let Some(pair) = time.windows(2).find(|w| w[1].checked_sub(w[0]) != Some(step)) {
        return Err(format!("timestamps are unevenly spaced at {}", pair[1]));
    }

    let out_of_range =
        || format!("{} timestamps from {first} every {step}s are out of range", time.len());
    let start = DateTime::from_timestamp(first, 0).ok_or_else(out_of_range)?;
    let interval = Duration::try_seconds(step).ok_or_else(out_of_range)?;
    let end = i64::try_from(time.len())
        .ok()
        .and_then(|n| step.checked_mul(n))
        .and_then(Duration::try_seconds)
        .and_then(|span| start.checked_add_signed(span))
        .ok_or_else(out_of_range)?;

    Ok(TimeRange::new(start, end, interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CityTarget;

    fn vars(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn decodes_by_name_in_any_body_order() {
        let body = r#"{
            "latitude": 50.64, "longitude": 3.06,
            "hourly": {
                "time": [1704067200, 1704070800, 1704074400],
                "wind_speed_10m": [5.0, 6.0, 7.0],
                "temperature_2m": [10.0, 11.0, 12.0]
            }
        }"#;

        let response = decode_hourly(body, &vars(&["temperature_2m", "wind_speed_10m"]))
            .expect("decodes");

        assert_eq!(response.range.count(), 3);
        assert_eq!(response.range.interval, Duration::hours(1));
        assert_eq!(
            response.series.get("temperature_2m"),
            Some(&[Some(10.0), Some(11.0), Some(12.0)][..])
        );
        assert_eq!(
            response.series.get("wind_speed_10m"),
            Some(&[Some(5.0), Some(6.0), Some(7.0)][..])
        );
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let body = r#"{"hourly": {"time": [0, 3600], "temperature_2m": [1.0]}}"#;
        let err = decode_hourly(body, &vars(&["temperature_2m"])).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(msg) if msg.contains("1 samples but 2")));
    }

    #[test]
    fn missing_variable_and_nulls_are_gaps_not_errors() {
        let body = r#"{"hourly": {"time": [0, 3600], "temperature_2m": [1.0, null]}}"#;
        let response = decode_hourly(body, &vars(&["temperature_2m", "precipitation"]))
            .expect("decodes");

        assert_eq!(response.series.get("temperature_2m"), Some(&[Some(1.0), None][..]));
        assert_eq!(response.series.get("precipitation"), Some(&[][..]));
    }

    #[test]
    fn uneven_timestamps_are_malformed() {
        let body = r#"{"hourly": {"time": [0, 3600, 9000]}}"#;
        assert!(matches!(decode_hourly(body, &[]), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn span_beyond_date_range_is_malformed() {
        let body = r#"{"hourly": {"time": [0, 5000000000000000]}}"#;
        let err = decode_hourly(body, &[]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(msg) if msg.contains("out of range")));
    }

    #[test]
    fn overflowing_timestamp_difference_is_malformed() {
        let body = r#"{"hourly": {"time": [-9000000000000000000, 9000000000000000000]}}"#;
        let err = decode_hourly(body, &[]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(msg) if msg.contains("too far apart")));
    }

    #[test]
    fn overflow_between_later_timestamps_is_malformed() {
        let body = r#"{"hourly": {"time": [0, 1, -9223372036854775808]}}"#;
        assert!(matches!(decode_hourly(body, &[]), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn non_json_is_a_body_error() {
        assert!(matches!(decode_hourly("<html>", &[]), Err(DecodeError::Body(_))));
    }

    #[test]
    fn empty_time_array_gives_empty_range() {
        let body = r#"{"hourly": {"time": [], "temperature_2m": []}}"#;
        let response = decode_hourly(body, &vars(&["temperature_2m"])).expect("decodes");
        assert!(!response.range.is_valid());
        assert_eq!(response.range.count(), 0);
    }

    #[test]
    fn request_url_keeps_variable_order() {
        let client = OpenMeteoClient::new(
            "https://api.open-meteo.com/v1/meteofrance",
            StdDuration::from_secs(5),
            RetryPolicy::default(),
        )
        .expect("client");

        let request = FetchRequest {
            target: CityTarget::new("Lille", 50.6365654, 3.0635282),
            variables: vars(&["wind_speed_10m", "temperature_2m"]),
        };

        let url = client.request_url(&request);
        let query = url.query().expect("query");
        assert!(query.contains("latitude=50.6365654"));
        assert!(query.contains("hourly=wind_speed_10m%2Ctemperature_2m"));
        assert!(query.contains("timeformat=unixtime"));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let err =
            OpenMeteoClient::new("not a url", StdDuration::from_secs(1), RetryPolicy::default())
                .unwrap_err();
        assert!(err.to_string().contains("Invalid weather API endpoint"));
    }
}
