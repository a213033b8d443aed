//! S3-compatible backend for the [`storage::StorageProvider`] capability.

use std::io;

use aws_sdk_s3::{
    error::{
        ProvideErrorMetadata,
        SdkError,
    },
    primitives::ByteStream,
};
use bytes::Bytes;
use errors::ErrorMetadata;
use futures::{
    stream::BoxStream,
    StreamExt,
};

mod storage;

pub use crate::storage::S3Storage;

/// Adapts the SDK's `ByteStream` to the `futures` stream the rest of the
/// system speaks.
pub(crate) fn into_io_stream(body: ByteStream) -> BoxStream<'static, io::Result<Bytes>> {
    futures::stream::try_unfold(body, |mut body| async move {
        match body.try_next().await {
            Ok(Some(bytes)) => Ok(Some((bytes, body))),
            Ok(None) => Ok(None),
            Err(e) => Err(io::Error::other(e)),
        }
    })
    .boxed()
}

/// S3 error codes that indicate the request may succeed on retry.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "SlowDown",
    "InternalError",
    "ServiceUnavailable",
    "RequestTimeout",
];

/// Classifies an SDK failure: connection and throttling problems become
/// retryable `Overloaded` errors, everything else is surfaced as fatal.
pub(crate) fn sdk_error<E>(action: &'static str, err: SdkError<E>) -> anyhow::Error
where
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            true
        },
        SdkError::ServiceError(service_err) => service_err
            .err()
            .code()
            .map(|code| TRANSIENT_ERROR_CODES.contains(&code))
            .unwrap_or(false),
        _ => false,
    };
    let wrapped = anyhow::anyhow!(err).context(format!("S3 {action} failed"));
    if transient {
        wrapped.context(ErrorMetadata::overloaded(
            "ProviderUnavailable",
            "the storage provider is temporarily unavailable; retry shortly",
        ))
    } else {
        wrapped
    }
}
