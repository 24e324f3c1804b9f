//! 📦 The bulk writer: a bucket that empties itself every `flush_size` documents.
//!
//! 🎬 *[the loader hands over 2,500 documents. the writer nods, holds 1,000, sends them,
//! holds 1,000 more, sends them, and is left with 500 and a promise to send those too.]*
//!
//! Scoped like a file handle: open it, `add` documents, `close` it. `close` sends the remainder.
//! [`BulkWriter::write_pages`] drains a page stream and flushes the remainder even when the
//! stream errors halfway, then hands back the stream's error. Any document rejected by the store
//! fails the flush; a rebuild with holes in it is not a rebuild.
//!
//! ⚠️ Rust has no async drop, so a writer dropped without `close` cannot flush. It says so loudly.

use std::pin::pin;

use anyhow::{Context, Result, bail};
use futures::{Stream, TryStreamExt};
use tracing::{debug, warn};

use crate::backends::{DocumentStore, StoreBackend};
use crate::common::EntityDocument;

#[derive(Debug)]
pub struct BulkWriter<'a> {
    store: &'a StoreBackend,
    index: String,
    flush_size: usize,
    buffer: Vec<EntityDocument>,
    written: usize,
}

impl<'a> BulkWriter<'a> {
    /// 🚪 Open a writer into `index`. A `flush_size` of zero is treated as one.
    pub fn open(store: &'a StoreBackend, index: impl Into<String>, flush_size: usize) -> Self {
        let flush_size = flush_size.max(1);
        Self {
            store,
            index: index.into(),
            flush_size,
            buffer: Vec::with_capacity(flush_size),
            written: 0,
        }
    }

    /// ➕ Buffer one document, flushing once the buffer reaches the threshold.
    pub async fn add(&mut self, document: EntityDocument) -> Result<()> {
        self.buffer.push(document);
        if self.buffer.len() >= self.flush_size {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let response = self
            .store
            .bulk_write(&self.index, &batch)
            .await
            .with_context(|| {
                format!("💀 Bulk write of {} documents into '{}' failed", batch.len(), self.index)
            })?;
        if response.has_failures() {
            let failures: Vec<String> = response
                .failures()
                .take(3)
                .map(|item| {
                    format!(
                        "{}: {}",
                        item.id.as_deref().unwrap_or("?"),
                        item.error.as_deref().unwrap_or("unknown")
                    )
                })
                .collect();
            bail!(
                "💀 '{}' rejected {} of {} documents, e.g. [{}]",
                self.index,
                response.failures().count(),
                batch.len(),
                failures.join("; ")
            );
        }
        self.written += batch.len();
        debug!(index = %self.index, documents = batch.len(), total = self.written, "📦 bulk batch flushed");
        Ok(())
    }

    /// ✅ Flush whatever is left and report how many documents landed.
    pub async fn close(mut self) -> Result<usize> {
        self.flush().await?;
        Ok(self.written)
    }

    /// 🌊 Drain a page stream into the index, then close.
    ///
    /// The remainder is flushed even if the stream fails; the stream's error wins.
    pub async fn write_pages<S>(mut self, pages: S) -> Result<usize>
    where
        S: Stream<Item = Result<Vec<EntityDocument>>>,
    {
        let drained = self.drain(pages).await;
        let flushed = self.flush().await;
        match (drained, flushed) {
            (Ok(()), Ok(())) => Ok(self.written),
            (Err(error), Ok(())) => Err(error),
            (Ok(()), Err(error)) => Err(error),
            (Err(error), Err(flush_error)) => {
                warn!(index = %self.index, "⚠️ final flush failed too: {flush_error:#}");
                Err(error)
            }
        }
    }

    async fn drain<S>(&mut self, pages: S) -> Result<()>
    where
        S: Stream<Item = Result<Vec<EntityDocument>>>,
    {
        let mut pages = pin!(pages);
        while let Some(page) = pages.try_next().await? {
            for document in page {
                self.add(document).await?;
            }
        }
        Ok(())
    }
}

impl Drop for BulkWriter<'_> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            warn!(
                index = %self.index,
                documents = self.buffer.len(),
                "⚠️ bulk writer dropped without close; buffered documents were never sent"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryStore;
    use serde_json::{Map, json};

    fn doc(i: usize) -> EntityDocument {
        let mut fields = Map::new();
        fields.insert("n".into(), json!(i));
        EntityDocument::new(i.to_string(), fields)
    }

    async fn store_with_index() -> Result<(InMemoryStore, StoreBackend)> {
        let peek = InMemoryStore::new();
        let backend = StoreBackend::InMemory(peek.clone());
        backend.create_index("target", &json!({})).await?;
        Ok((peek, backend))
    }

    #[tokio::test]
    async fn the_one_where_the_remainder_is_flushed_on_close() -> Result<()> {
        let (peek, backend) = store_with_index().await?;
        let mut writer = BulkWriter::open(&backend, "target", 4);
        for i in 0..10 {
            writer.add(doc(i)).await?;
        }
        // 🧮 two full batches are already in, two documents are waiting
        assert_eq!(peek.documents("target").await.map(|d| d.len()), Some(8));
        assert_eq!(writer.close().await?, 10);
        assert_eq!(peek.documents("target").await.map(|d| d.len()), Some(10));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failing_stream_still_flushes_what_it_got() -> Result<()> {
        let (peek, backend) = store_with_index().await?;
        let pages = futures::stream::iter(vec![
            Ok(vec![doc(1), doc(2), doc(3)]),
            Err(anyhow::anyhow!("source went away")),
            Ok(vec![doc(4)]),
        ]);
        let result = BulkWriter::open(&backend, "target", 100).write_pages(pages).await;

        let message = format!("{:#}", result.expect_err("💀 the stream error must surface"));
        assert!(message.contains("source went away"));
        assert_eq!(peek.documents("target").await.map(|d| d.len()), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_store_failure_stops_the_writer() -> Result<()> {
        let (peek, backend) = store_with_index().await?;
        peek.fail_bulk_at_document(5).await;
        let pages = futures::stream::iter(vec![Ok((0..10).map(doc).collect::<Vec<_>>())]);
        let result = BulkWriter::open(&backend, "target", 3).write_pages(pages).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_empty_close_writes_nothing() -> Result<()> {
        let (peek, backend) = store_with_index().await?;
        assert_eq!(BulkWriter::open(&backend, "target", 0).close().await?, 0);
        assert_eq!(peek.documents("target").await.map(|d| d.len()), Some(0));
        Ok(())
    }
}
