use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures::stream::StreamExt;
use futures::stream::TryStreamExt;
use http::{StatusCode, Uri};
use serde::Deserialize;

use super::Chunk;
use super::Key;
use super::{PutBody, Stat};

pub(crate) mod logging;
use super::errors::{Error, Result};
use super::s3::logging::LoggingInterceptor;
use super::ObjectStore;

#[derive(Clone, Deserialize)]
pub struct S3Config {
    secret_key: String,
    access_key: String,
    hostname: String,
    bucket_name: String,
    region: String,
}

impl S3Config {
    pub async fn new_objects(&self) -> Result<S3> {
        let scp = SharedCredentialsProvider::new(
            Credentials::new(
                self.access_key.clone(),
                self.secret_key.clone(),
                None,
                None,
                "depot",
            )
            .provide_credentials()
            .await?,
        );

        let uri = Uri::builder()
            .scheme("https")
            .authority(self.hostname.as_str())
            .path_and_query("/")
            .build()?;

        let sdk_config = aws_config::load_from_env().await;

        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .region(Region::new(self.region.clone()))
            .credentials_provider(scp)
            .endpoint_url(uri.to_string())
            .interceptor(LoggingInterceptor)
            .build();

        let s3_client = aws_sdk_s3::Client::from_conf(config);

        Ok(S3 {
            bucket_name: self.bucket_name.clone(),
            client: s3_client,
        })
    }
}

/// Converts a boxed `io::Result<Bytes>` stream into the [`ByteStream`] the AWS SDK expects.
fn to_byte_stream(body: PutBody) -> ByteStream {
    let mapped = body.map_err(|e| aws_smithy_types::byte_stream::error::Error::from(Box::new(e) as _));
    ByteStream::from(http_body::Body::map_err(
        http_body_util::StreamBody::new(mapped.map(|r| r.map(hyper::body::Frame::data))),
        std::convert::identity,
    ))
}

#[derive(Clone)]
pub struct S3 {
    bucket_name: String,
    client: Client,
}

#[async_trait]
impl ObjectStore for S3 {
    async fn get(&self, key: &Key) -> Result<super::ObjectBody> {
        let get_object_output = self
            .client
            .get_object()
            .key(key)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        Ok(get_object_output.body.map_err(Error::from).boxed())
    }

    async fn exists(&self, key: &Key) -> Result<bool> {
        match self
            .client
            .head_object()
            .key(key)
            .bucket(&self.bucket_name)
            .send()
            .await
        {
            Err(SdkError::ServiceError(e)) => {
                let http = e.raw();
                match http.status() {
                    StatusCode::NOT_FOUND => Ok(false),
                    _ => Err(SdkError::ServiceError(e).into()),
                }
            }
            Err(e) => Err(Error::AWSSDKHeadObjectError(e)),
            Ok(_) => Ok(true),
        }
    }

    async fn stat(&self, key: &Key) -> Result<Option<Stat>> {
        match self
            .client
            .head_object()
            .key(key)
            .bucket(&self.bucket_name)
            .send()
            .await
        {
            Ok(out) => Ok(Some(Stat {
                size: out.content_length().unwrap_or_default().max(0) as u64,
            })),
            Err(SdkError::ServiceError(e)) => {
                let http = e.raw();
                match http.status() {
                    StatusCode::NOT_FOUND => Ok(None),
                    _ => Err(SdkError::ServiceError(e).into()),
                }
            }
            Err(e) => Err(Error::AWSSDKHeadObjectError(e)),
        }
    }

    async fn put(&self, key: &Key, body: PutBody, content_length: u64) -> Result<()> {
        let _put_object_output = self
            .client
            .put_object()
            .key(key)
            .body(to_byte_stream(body))
            .content_length(content_length as i64)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &Key) -> Result<()> {
        self.client
            .delete_object()
            .key(key)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &Key) -> Result<()> {
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let out = req.send().await?;
            for obj in out.contents() {
                if let Some(key) = obj.key() {
                    self.client
                        .delete_object()
                        .key(key)
                        .bucket(&self.bucket_name)
                        .send()
                        .await?;
                }
            }
            continuation = out.next_continuation_token().map(String::from);
            if continuation.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn r#move(&self, src: &Key, dst: &Key) -> Result<()> {
        let copy_source = format!("{}/{}", &self.bucket_name, src);
        self.client
            .copy_object()
            .copy_source(copy_source)
            .key(dst)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        self.client
            .delete_object()
            .key(src)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn list(&self, prefix: &Key) -> Result<Vec<String>> {
        let prefix_str = format!("{prefix}/");
        let out = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket_name)
            .prefix(&prefix_str)
            .delimiter("/")
            .send()
            .await?;
        let mut names: Vec<String> = out
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .map(|p| {
                p.trim_start_matches(&prefix_str)
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn walk(
        &self,
        prefix: &Key,
        f: &mut (dyn FnMut(Key) -> std::result::Result<(), Error> + Send),
    ) -> Result<()> {
        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let out = req.send().await?;
            for obj in out.contents() {
                if let Some(key) = obj.key() {
                    f(Key::from(key.to_string()))?;
                }
            }
            continuation = out.next_continuation_token().map(String::from);
            if continuation.is_none() {
                break;
            }
        }
        Ok(())
    }

    async fn initiate_chunked_upload(&self, session_key: &Key) -> Result<String> {
        let create_multipart_upload_output = self
            .client
            .create_multipart_upload()
            .key(session_key)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let upload_id = create_multipart_upload_output.upload_id.ok_or(
            Error::ObjectsFailedToInitiateChunkedUpload("missing upload id"),
        )?;

        Ok(upload_id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        session_key: &Key,
        chunk_number: i32,
        content_length: u64,
        body: PutBody,
    ) -> Result<Chunk> {
        let upload_part_output = self
            .client
            .upload_part()
            .upload_id(upload_id)
            .part_number(chunk_number)
            .key(session_key)
            .body(to_byte_stream(body))
            .content_length(content_length as i64)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let chunk = Chunk {
            e_tag: upload_part_output.e_tag,
            chunk_number,
        };

        Ok(chunk)
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        session_key: &Key,
        chunks: Vec<Chunk>,
        key: &Key,
    ) -> Result<()> {
        let mut mpu = CompletedMultipartUpload::builder();
        for chunk in chunks {
            let mut pb = CompletedPart::builder();
            if let Some(e_tag) = &chunk.e_tag {
                pb = pb.e_tag(e_tag);
            }
            mpu = mpu.parts(pb.part_number(chunk.chunk_number).build());
        }
        let _complete_multipart_upload_output = self
            .client
            .complete_multipart_upload()
            .multipart_upload(mpu.build())
            .upload_id(upload_id)
            .key(session_key)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let copy_source = format!("{}/{}", &self.bucket_name, session_key);
        let _copy_object_output = self
            .client
            .copy_object()
            .copy_source(copy_source)
            .key(key)
            .bucket(&self.bucket_name)
            .send()
            .await?;

        let _delete_object_output = self
            .client
            .delete_object()
            .key(session_key)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        Ok(())
    }

    async fn abort_chunked_upload(&self, upload_id: &str, session_key: &Key) -> Result<()> {
        let _abort_multipart_upload_output = self
            .client
            .abort_multipart_upload()
            .upload_id(upload_id)
            .key(session_key)
            .bucket(&self.bucket_name)
            .send()
            .await?;
        // TODO: list parts to identify any lingering parts uploaded concurrently with the
        // abort -- shouldn't be reachable given how upload sessions are serialized, but the
        // SDK docs call it out.
        Ok(())
    }
}
