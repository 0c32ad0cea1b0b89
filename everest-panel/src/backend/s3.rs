//! S3-compatible backup storage.
//!
//! Works against AWS S3 and anything speaking its API (MinIO, B2, R2). Uses
//! reqwest with manual AWS Signature V4 signing so no SDK dependency is needed.

use std::collections::BTreeMap;

use anyhow::bail;
use chrono::{DateTime, Utc};
use everest_common::{BackupDisk, StorageError};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::{HttpConfig, S3Settings};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>, // Custom endpoint for MinIO and other S3-compatible APIs
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Config {
    /// Resolve credentials from the config file, falling back to the
    /// environment.
    pub fn from_settings(settings: &S3Settings) -> anyhow::Result<Self> {
        let access_key_id = settings
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
            .unwrap_or_default();
        let secret_access_key = settings
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
            .unwrap_or_default();

        if access_key_id.is_empty() || secret_access_key.is_empty() {
            bail!("S3 credentials not found for bucket '{}'", settings.bucket);
        }

        Ok(Self {
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
            endpoint: settings.endpoint.clone(),
            access_key_id,
            secret_access_key,
        })
    }
}

pub struct S3Adapter {
    config: S3Config,
    client: Client,
}

impl S3Adapter {
    pub fn new(config: S3Config, http: &HttpConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(http.timeout())
            .connect_timeout(http.connect_timeout())
            .build()?;
        Ok(Self { config, client })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Host used for the `host` header and request URL. Custom endpoints are
    /// addressed path-style, AWS virtual-hosted-style.
    fn host_and_base(&self) -> (String, String) {
        match &self.config.endpoint {
            Some(ep) => {
                let ep = ep.trim_end_matches('/');
                (url_host(ep), ep.to_string())
            }
            None => {
                let host = format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                );
                (host.clone(), format!("https://{}", host))
            }
        }
    }

    /// Canonical (already encoded) path of an object.
    fn object_path(&self, key: &str) -> String {
        let encoded_key = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        match self.config.endpoint {
            Some(_) => format!("/{}/{}", urlencoding::encode(&self.config.bucket), encoded_key),
            None => format!("/{}", encoded_key),
        }
    }

    /// Compute AWS Signature V4 for a request.
    #[allow(clippy::too_many_arguments)]
    fn sign(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &BTreeMap<String, String>,
        body_hash: &str,
        date_time: &str,
        date: &str,
    ) -> String {
        // Canonical request
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers: String = headers.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query, canonical_headers, signed_headers, body_hash
        );

        // String to sign
        let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let credential_scope = format!("{}/{}/s3/aws4_request", date, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            date_time, credential_scope, cr_hash
        );

        let signing_key =
            derive_signing_key(&self.config.secret_access_key, date, &self.config.region);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.config.access_key_id, credential_scope, signed_headers, signature
        )
    }

    fn signed_headers(&self, method: &str, path: &str, now: DateTime<Utc>) -> (String, String, String) {
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let (host, _) = self.host_and_base();
        let empty_hash = body_hash(b"");

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), host);
        headers.insert("x-amz-content-sha256".to_string(), empty_hash.clone());
        headers.insert("x-amz-date".to_string(), date_time.clone());

        let auth = self.sign(method, path, "", &headers, &empty_hash, &date_time, &date);
        (auth, date_time, empty_hash)
    }

    /// Delete one object. Any non-2xx answer is a failure, 404 included:
    /// DeleteObject on a missing key succeeds, so a 404 means the bucket
    /// itself is gone.
    pub async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key);
        let (auth, date_time, content_hash) = self.signed_headers("DELETE", &path, Utc::now());
        let (_, base) = self.host_and_base();
        let url = format!("{}{}", base, path);

        let resp = self
            .client
            .delete(&url)
            .header("x-amz-date", &date_time)
            .header("x-amz-content-sha256", &content_hash)
            .header("Authorization", &auth)
            .send()
            .await
            .map_err(|e| StorageError::Connection {
                disk: BackupDisk::S3,
                status: e.status().map(|s| s.as_u16()),
                message: format!("S3 DELETE request failed: {}", e),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Connection {
                disk: BackupDisk::S3,
                status: Some(status.as_u16()),
                message: format!("S3 DELETE failed: HTTP {} - {}", status, body),
            });
        }

        debug!(bucket = %self.config.bucket, key = %key, "S3 delete complete");
        Ok(())
    }
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn body_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Extract the host part from a URL for use in signing.
fn url_host(url: &str) -> String {
    // Strip scheme and path, return just host[:port]
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}
