use super::CleanupError;
use crate::config::S3Config;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::Client as S3Client;
use tracing::{debug, info, instrument};

/// S3 error code for an object that does not exist
const NO_SUCH_KEY: &str = "NoSuchKey";

/// Bucket holding the files behind friend links
#[derive(Clone)]
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
}

impl ObjectStore {
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object store initialized"
        );

        Self::from_client(S3Client::from_conf(s3_config_builder.build()), config.bucket.clone())
    }

    pub fn from_client(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Delete an object. An object that is already gone counts as deleted.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), CleanupError> {
        match self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => {
                debug!(key = %key, "Deleted object");
                Ok(())
            }
            Err(e) if e.code() == Some(NO_SUCH_KEY) => {
                debug!(key = %key, "Object already deleted");
                Ok(())
            }
            Err(e) => Err(CleanupError::Storage(format!(
                "failed to delete {}: {}",
                key,
                DisplayErrorContext(&e)
            ))),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::error::ErrorMetadata;
    use aws_sdk_s3::operation::delete_object::{DeleteObjectError, DeleteObjectOutput};
    use aws_smithy_mocks::{mock, mock_client};

    fn failing_with(code: &'static str) -> DeleteObjectError {
        DeleteObjectError::generic(ErrorMetadata::builder().code(code).message("mocked").build())
    }

    #[tokio::test]
    async fn test_delete_sends_bucket_and_key() {
        let rule = mock!(aws_sdk_s3::Client::delete_object)
            .match_requests(|req| req.bucket() == Some("links") && req.key() == Some("2024-01-15/a.pdf"))
            .then_output(|| DeleteObjectOutput::builder().build());
        let store = ObjectStore::from_client(mock_client!(aws_sdk_s3, [&rule]), "links");

        store.delete("2024-01-15/a.pdf").await.unwrap();
        assert_eq!(rule.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_object_counts_as_deleted() {
        let rule = mock!(aws_sdk_s3::Client::delete_object).then_error(|| failing_with(NO_SUCH_KEY));
        let store = ObjectStore::from_client(mock_client!(aws_sdk_s3, [&rule]), "links");

        store.delete("gone.pdf").await.unwrap();
        store.delete("gone.pdf").await.unwrap();
        assert_eq!(rule.num_calls(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_transient() {
        let rule = mock!(aws_sdk_s3::Client::delete_object).then_error(|| failing_with("AccessDenied"));
        let store = ObjectStore::from_client(mock_client!(aws_sdk_s3, [&rule]), "links");

        let err = store.delete("a.pdf").await.unwrap_err();
        assert!(matches!(err, CleanupError::Storage(_)));
        assert!(!err.is_permanent());
    }
}
