use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Classification, Classifier};
use crate::error::Result;

/// Remembers definitive verdicts by content hash so repeated content
/// (static scenes, re-uploaded images) is only sent to the provider once.
pub struct CachingClassifier<C> {
    inner: C,
    cache: RwLock<HashMap<String, Classification>>,
}

impl<C: Classifier> CachingClassifier<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }

    async fn lookup(&self, key: &str) -> Option<Classification> {
        self.cache.read().await.get(key).cloned()
    }

    async fn remember(&self, key: String, classification: &Classification) {
        // Indeterminate answers may change on retry, so they are not cached
        if classification.verdict.is_definitive() {
            self.cache.write().await.insert(key, classification.clone());
        }
    }
}

fn cache_key(kind: &str, payload: &[u8]) -> String {
    format!("{}:{:x}", kind, md5::compute(payload))
}

#[async_trait]
impl<C: Classifier> Classifier for CachingClassifier<C> {
    async fn prepare(&self) -> Result<()> {
        self.inner.prepare().await
    }

    async fn classify_image(&self, image: &[u8]) -> Result<Classification> {
        let key = cache_key("img", image);
        if let Some(hit) = self.lookup(&key).await {
            debug!("Cache hit for {}", key);
            return Ok(hit);
        }

        let classification = self.inner.classify_image(image).await?;
        self.remember(key, &classification).await;
        Ok(classification)
    }

    async fn classify_text(&self, text: &str) -> Result<Classification> {
        let key = cache_key("txt", text.as_bytes());
        if let Some(hit) = self.lookup(&key).await {
            debug!("Cache hit for {}", key);
            return Ok(hit);
        }

        let classification = self.inner.classify_text(text).await?;
        self.remember(key, &classification).await;
        Ok(classification)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
