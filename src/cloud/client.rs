use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use rusoto_core::{HttpClient, Region};
use rusoto_credential::{DefaultCredentialsProvider, ProfileProvider, StaticProvider};
use rusoto_s3::S3Client;

use crate::config::StorageConfig;

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Resolve the configured region, honouring a custom endpoint.
///
/// A custom URL (MinIO, Ceph, LocalStack...) turns the region into
/// `Region::Custom` so requests go to that endpoint while still being signed
/// for the configured region name.
pub fn resolve_region(storage: &StorageConfig) -> Result<Region> {
    let name = non_empty(&storage.region).ok_or_else(|| anyhow!("storage region is required"))?;

    match non_empty(&storage.custom_url) {
        Some(endpoint) => Ok(Region::Custom {
            name: name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }),
        None => name
            .parse::<Region>()
            .map_err(|e| anyhow!("Invalid region '{}': {}", name, e)),
    }
}

/// Create an S3 client from the storage configuration.
///
/// Credential precedence: static keys, then a named profile, then the default
/// provider chain (environment, profile files, instance metadata).
pub fn create_s3_client(storage: &StorageConfig) -> Result<S3Client> {
    let region = resolve_region(storage)?;
    let http_client = HttpClient::new().context("Failed to create HTTP client")?;

    if storage.use_path_style {
        debug!("Path-style addressing requested; rusoto always addresses buckets by path");
    }

    if let (Some(access_key), Some(secret_key)) =
        (non_empty(&storage.access_key), non_empty(&storage.secret_key))
    {
        info!("Using static S3 credentials region={}", region.name());
        let provider = StaticProvider::new(
            access_key.to_string(),
            secret_key.to_string(),
            non_empty(&storage.session_token).map(str::to_string),
            None,
        );
        return Ok(S3Client::new_with(http_client, provider, region));
    }

    if let Some(profile) = non_empty(&storage.profile) {
        info!("Using AWS profile {} region={}", profile, region.name());
        let mut provider =
            ProfileProvider::new().context("Failed to create AWS profile provider")?;
        provider.set_profile(profile);
        return Ok(S3Client::new_with(http_client, provider, region));
    }

    let provider =
        DefaultCredentialsProvider::new().context("Failed to create default AWS credentials chain")?;
    Ok(S3Client::new_with(http_client, provider, region))
}
