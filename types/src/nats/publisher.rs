use core::fmt::{Debug, Formatter, Result as FmtResult};
use std::marker::PhantomData;

use anyhow::{Context as _, Result as AnyResult};
use async_nats::jetstream::{self, context::Publish, stream};
use bytes::Bytes;
use serde::Serialize;

/// JetStream publisher bound to a single subject.
pub struct Publisher<T> {
    context: jetstream::Context,
    subject: String,
    phantom: PhantomData<T>,
}

impl<T> Debug for Publisher<T> {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        fmt.debug_tuple("Publisher").field(&self.subject).finish()
    }
}

impl<T: Serialize> Publisher<T> {
    /// Ensure the backing stream exists and return a publisher bound to
    /// `subject`.
    pub async fn new(
        context: jetstream::Context,
        subject: String,
        config: stream::Config,
    ) -> AnyResult<Self> {
        let name = config.name.clone();
        context
            .get_or_create_stream(config)
            .await
            .with_context(|| format!("failed to create stream {}", name))?;
        Ok(Self {
            context,
            subject,
            phantom: PhantomData,
        })
    }

    pub async fn publish(&self, payload: &T) -> AnyResult<()> {
        let bytes = serde_json::to_vec(payload).context("failed to encode payload to json")?;
        self.publish_bytes(bytes.into(), None).await
    }

    /// Publish with a deduplicating message id.
    pub async fn publish_with_id(&self, payload: &T, message_id: String) -> AnyResult<()> {
        let bytes = serde_json::to_vec(payload).context("failed to encode payload to json")?;
        self.publish_bytes(bytes.into(), Some(message_id)).await
    }

    async fn publish_bytes(&self, bytes: Bytes, message_id: Option<String>) -> AnyResult<()> {
        let mut publish = Publish::build().payload(bytes);
        if let Some(id) = message_id {
            publish = publish.message_id(id);
        }
        self.context
            .send_publish(self.subject.clone(), publish)
            .await
            .with_context(|| format!("failed to publish to {}", self.subject))?
            .await
            .with_context(|| format!("failed to receive publish ack for {}", self.subject))?;
        Ok(())
    }
}
