//! S3 `PutObject` over plain HTTPS, signed with AWS Signature Version 4.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url, header::CONTENT_TYPE};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::{
    config::StorageConfig,
    credentials::{CredentialSource, Credentials, resolve_region},
    error::{StorageError, truncate_body},
    storage::{ObjectLocation, ObjectStore},
};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

#[derive(Debug, Clone)]
pub struct S3Store {
    http: Client,
    region: String,
    /// Path-style endpoint; `None` means AWS virtual-hosted style.
    endpoint: Option<Url>,
    credentials: CredentialSource,
}

impl S3Store {
    pub fn new(
        region: impl Into<String>,
        endpoint: Option<&str>,
        credentials: CredentialSource,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = endpoint
            .map(|e| Url::parse(e).with_context(|| format!("Invalid storage endpoint: {e}")))
            .transpose()?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            region: region.into(),
            endpoint,
            credentials,
        })
    }

    pub fn from_config(config: &StorageConfig, timeout: Duration) -> Result<Self> {
        let region = resolve_region(config, |k| std::env::var(k).ok());
        Self::new(
            region,
            config.endpoint.as_deref(),
            CredentialSource::from_config(config),
            timeout,
        )
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn object_url(&self, location: &ObjectLocation) -> Result<Url, StorageError> {
        let key = encode_key(&location.key);
        let raw = match &self.endpoint {
            Some(endpoint) => format!(
                "{}/{}/{}",
                endpoint.as_str().trim_end_matches('/'),
                location.bucket,
                key
            ),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", location.bucket, self.region, key),
        };

        Url::parse(&raw).map_err(|e| StorageError::Rejected {
            status: 400,
            message: format!("invalid object URL {raw}: {e}"),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_access(&self) -> Result<(), StorageError> {
        let creds = self.credentials.resolve()?;
        tracing::debug!(
            access_key_id = %creds.access_key_id,
            region = %self.region,
            "storage credentials resolved"
        );
        Ok(())
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let creds = self.credentials.resolve()?;
        let url = self.object_url(location)?;
        let payload_hash = hex::encode(Sha256::digest(&body));
        let headers = sign(&creds, &self.region, "PUT", &url, &payload_hash, Utc::now())?;

        let mut req = self.http.put(url).header(CONTENT_TYPE, content_type);
        for (name, value) in headers {
            req = req.header(name, value);
        }

        let res = req.body(body).send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(());
        }

        let text = res.text().await.unwrap_or_default();
        Err(StorageError::from_status(status, truncate_body(&text)))
    }
}

/// Percent-encode each path segment of an object key, keeping `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/').map(|seg| urlencoding::encode(seg).into_owned()).collect::<Vec<_>>().join("/")
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| {
        StorageError::CredentialResolutionFailed(format!("unusable signing key: {e}"))
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")`.
fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, StorageError> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// Headers to add so that the request to `url` is SigV4-signed. Signs `host`,
/// `x-amz-content-sha256`, `x-amz-date` and, with temporary credentials,
/// `x-amz-security-token`.
fn sign(
    creds: &Credentials,
    region: &str,
    method: &str,
    url: &Url,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(&'static str, String)>, StorageError> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();

    let mut signed: Vec<(&'static str, String)> = vec![
        ("host", host_header(url)),
        ("x-amz-content-sha256", payload_hash.to_string()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &creds.session_token {
        signed.push(("x-amz-security-token", token.clone()));
    }

    let canonical_headers: String =
        signed.iter().map(|(name, value)| format!("{name}:{}\n", value.trim())).collect();
    let signed_headers = signed.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        url.path(),
        url.query().unwrap_or_default(),
    );

    let scope = format!("{date_stamp}/{region}/{SERVICE}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(&creds.secret_access_key, &date_stamp, region, SERVICE)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        creds.access_key_id
    );

    // reqwest derives Host from the URL itself.
    let mut headers: Vec<(&'static str, String)> =
        signed.into_iter().filter(|(name, _)| *name != "host").collect();
    headers.push(("authorization", authorization));
    Ok(headers)
}
