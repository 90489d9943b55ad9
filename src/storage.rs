use anyhow::Context;
use aws_config::{defaults, BehaviorVersion};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{Builder as S3ConfigBuilder, Region},
    Client,
};
use aws_smithy_types::byte_stream::ByteStream;
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::StorageConfig;

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()>;
    /// `Ok(false)` when the object does not exist.
    async fn head_object(&self, key: &str) -> anyhow::Result<bool>;
    async fn delete_object(&self, key: &str) -> anyhow::Result<()>;
    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(cfg: &StorageConfig) -> anyhow::Result<Self> {
        let mut loader = defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()))
            .credentials_provider(Credentials::new(
                &cfg.access_key,
                &cfg.secret_key,
                None,
                None,
                "static",
            ));
        if let Some(endpoint) = &cfg.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let mut builder = S3ConfigBuilder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: cfg.bucket.clone(),
        })
    }
}

#[async_trait]
impl StorageClient for Storage {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .context("s3 put_object")?;
        Ok(())
    }

    async fn head_object(&self, key: &str) -> anyhow::Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = e.into_service_error();
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow::Error::new(err).context("s3 head_object"))
                }
            }
        }
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("s3 delete_object")?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .context("s3 list_objects_v2")?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            match page.next_continuation_token() {
                Some(next) if page.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string())
                }
                _ => break,
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
pub mod memory {
    //! In-process bucket used by the unit tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::StorageClient;

    #[derive(Default)]
    pub struct MemoryStorage {
        objects: Mutex<BTreeMap<String, (Bytes, String)>>,
        /// Puts whose key contains this fragment fail.
        fail_put_on: Mutex<Option<String>>,
        /// Puts succeed but the object never becomes visible.
        drop_writes: Mutex<bool>,
        fail_deletes: Mutex<bool>,
    }

    impl MemoryStorage {
        pub fn fail_put_on(&self, fragment: &str) {
            *self.fail_put_on.lock().unwrap() = Some(fragment.to_string());
        }

        pub fn drop_writes(&self) {
            *self.drop_writes.lock().unwrap() = true;
        }

        pub fn fail_deletes(&self) {
            *self.fail_deletes.lock().unwrap() = true;
        }

        pub fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }

        pub fn content_type(&self, key: &str) -> Option<String> {
            self.objects.lock().unwrap().get(key).map(|(_, ct)| ct.clone())
        }

        pub fn body(&self, key: &str) -> Option<Bytes> {
            self.objects.lock().unwrap().get(key).map(|(b, _)| b.clone())
        }
    }

    #[async_trait]
    impl StorageClient for MemoryStorage {
        async fn put_object(&self, key: &str, body: Bytes, ct: &str) -> anyhow::Result<()> {
            if let Some(fragment) = self.fail_put_on.lock().unwrap().as_deref() {
                if key.contains(fragment) {
                    anyhow::bail!("injected put failure for {}", key);
                }
            }
            if *self.drop_writes.lock().unwrap() {
                return Ok(());
            }
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), (body, ct.to_string()));
            Ok(())
        }

        async fn head_object(&self, key: &str) -> anyhow::Result<bool> {
            Ok(self.objects.lock().unwrap().contains_key(key))
        }

        async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
            if *self.fail_deletes.lock().unwrap() {
                anyhow::bail!("injected delete failure for {}", key);
            }
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }
}
