//! Object storage integration.
//!
//! The shipping pipeline talks to storage through one seam, the
//! [`Uploader`] trait. [`S3Uploader`] is the production implementation; tests
//! substitute recording or failing fakes.
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────┐     ┌────────────┐
//! │ Worker Pool /   │────▶│  Uploader    │────▶│  S3 Bucket │
//! │ Tail Buffer     │     │ (S3Uploader) │     └────────────┘
//! └─────────────────┘     └──────────────┘
//! ```

/// S3 client construction (region, endpoint, credentials)
pub mod client;

/// rusoto-backed uploader with retries and multipart support
pub mod s3;

/// The upload port used by the shipping pipeline
pub mod uploader;

pub use s3::S3Uploader;
pub use uploader::{UploadBody, UploadUnit, Uploader};
