//! 进程内传输：直接读存储、订阅广播器

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use super::transport::{LiveStream, Transport};
use crate::protocol::StreamMessage;
use crate::server::{Ingestor, Subscription};
use crate::types::{Event, EventFilter};

/// 进程内传输
pub struct BusTransport {
    ingestor: Arc<Ingestor>,
}

impl BusTransport {
    pub fn new(ingestor: Arc<Ingestor>) -> Self {
        Self { ingestor }
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ingestor) -> crate::Result<T> + Send + 'static,
    {
        let ingestor = self.ingestor.clone();
        let result = tokio::task::spawn_blocking(move || f(&ingestor))
            .await
            .context("blocking task failed")?;
        Ok(result?)
    }
}

#[async_trait]
impl LiveStream for Subscription {
    async fn next(&mut self) -> Option<StreamMessage> {
        self.recv().await
    }
}

#[async_trait]
impl Transport for BusTransport {
    fn name(&self) -> &'static str {
        "bus"
    }

    async fn backfill(&self, limit: usize) -> anyhow::Result<Vec<Event>> {
        self.blocking(move |ingestor| {
            ingestor
                .store()
                .query(&EventFilter::default().limit(limit))
        })
        .await
    }

    async fn subscribe(&self) -> anyhow::Result<Box<dyn LiveStream>> {
        Ok(Box::new(self.ingestor.broadcaster().subscribe()))
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.blocking(|ingestor| ingestor.clear()).await?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> anyhow::Result<()> {
        let session_id = session_id.to_string();
        self.blocking(move |ingestor| ingestor.delete_session(&session_id))
            .await?;
        Ok(())
    }
}
