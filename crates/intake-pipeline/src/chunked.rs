//! Sequential, fixed-size chunk persistence.

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use intake_core::{BatchResult, CatalogRecord};
use intake_storage::{CatalogRepository, StorageError};
use tracing::{debug, warn};

/// Something that can take one chunk of records and persist it atomically.
#[async_trait]
pub trait ChunkSink<R: Sync>: Send + Sync {
    type Error: Display + Send;

    async fn persist(&self, chunk: &[R]) -> Result<(), Self::Error>;
}

/// Persists `records` in input order, `chunk_size` at a time.
///
/// Chunks are written one after another. A failed chunk marks every record in it as failed,
/// then the next chunk is attempted. `on_progress` receives the number of records handled so far.
pub async fn write_chunked<R, S>(
    records: Vec<R>,
    chunk_size: usize,
    sink: &S,
    mut on_progress: impl FnMut(usize),
) -> BatchResult<R>
where
    R: Send + Sync,
    S: ChunkSink<R> + ?Sized,
{
    let chunk_size = chunk_size.max(1);
    let mut result = BatchResult::default();
    let mut handled = 0usize;
    let mut remaining = records.into_iter().peekable();
    let mut chunk_no = 0usize;

    while remaining.peek().is_some() {
        let chunk: Vec<R> = remaining.by_ref().take(chunk_size).collect();
        handled += chunk.len();
        match sink.persist(&chunk).await {
            Ok(()) => {
                debug!(chunk_no, size = chunk.len(), "chunk persisted");
                result.successful.extend(chunk);
            }
            Err(err) => {
                let error = err.to_string();
                warn!(chunk_no, size = chunk.len(), error = %error, "chunk failed");
                for record in chunk {
                    result.record_failure(record, &error);
                }
            }
        }
        chunk_no += 1;
        on_progress(handled);
    }

    result
}

/// Chunk sink writing catalog records for one owner.
pub struct CatalogChunkSink {
    repository: Arc<dyn CatalogRepository>,
    owner_id: String,
}

impl CatalogChunkSink {
    pub fn new(repository: Arc<dyn CatalogRepository>, owner_id: impl Into<String>) -> Self {
        Self {
            repository,
            owner_id: owner_id.into(),
        }
    }
}

#[async_trait]
impl ChunkSink<CatalogRecord> for CatalogChunkSink {
    type Error = StorageError;

    async fn persist(&self, chunk: &[CatalogRecord]) -> Result<(), StorageError> {
        self.repository.insert_many(&self.owner_id, chunk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FailingSink {
        fail_calls: Vec<usize>,
        calls: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl ChunkSink<u32> for FailingSink {
        type Error = String;

        async fn persist(&self, chunk: &[u32]) -> Result<(), String> {
            let mut calls = self.calls.lock().expect("lock");
            let call = calls.len();
            calls.push(chunk.to_vec());
            if self.fail_calls.contains(&call) {
                Err(format!("chunk {call} rejected"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn splits_into_ordered_chunks() {
        let sink = FailingSink {
            fail_calls: vec![],
            calls: Mutex::new(Vec::new()),
        };
        let mut progress = Vec::new();
        let result = write_chunked((1..=120).collect::<Vec<u32>>(), 50, &sink, |n| progress.push(n)).await;

        let calls = sink.calls.lock().expect("lock");
        let sizes: Vec<usize> = calls.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(calls[1][0], 51);
        assert_eq!(result.successful.len(), 120);
        assert_eq!(progress, vec![50, 100, 120]);
    }

    #[tokio::test]
    async fn failed_chunk_marks_all_its_records() {
        let sink = FailingSink {
            fail_calls: vec![1],
            calls: Mutex::new(Vec::new()),
        };
        let result = write_chunked((1..=120).collect::<Vec<u32>>(), 50, &sink, |_| {}).await;

        assert_eq!(result.successful.len(), 70);
        assert_eq!(result.failed.len(), 50);
        assert_eq!(result.failed[0].item, 51);
        assert_eq!(result.failed[49].item, 100);
        assert_eq!(result.failed[0].error, "chunk 1 rejected");
        assert_eq!(sink.calls.lock().expect("lock").len(), 3);
    }

    #[tokio::test]
    async fn empty_input_never_calls_the_sink() {
        let sink = FailingSink {
            fail_calls: vec![],
            calls: Mutex::new(Vec::new()),
        };
        let result = write_chunked(Vec::<u32>::new(), 0, &sink, |_| {}).await;
        assert_eq!(result.total(), 0);
        assert!(sink.calls.lock().expect("lock").is_empty());
    }

    proptest::proptest! {
        #[test]
        fn every_record_lands_exactly_once(
            len in 0usize..200,
            chunk_size in 1usize..40,
            fail_calls in proptest::collection::vec(0usize..10, 0..4),
        ) {
            let sink = FailingSink {
                fail_calls,
                calls: Mutex::new(Vec::new()),
            };
            let records: Vec<u32> = (0..len as u32).collect();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            let result = runtime.block_on(write_chunked(records.clone(), chunk_size, &sink, |_| {}));

            proptest::prop_assert_eq!(result.successful.len() + result.failed.len(), len);
            let calls = sink.calls.lock().expect("lock");
            proptest::prop_assert!(calls.iter().all(|chunk| chunk.len() <= chunk_size));

            let mut seen: Vec<u32> = result
                .successful
                .iter()
                .copied()
                .chain(result.failed.iter().map(|f| f.item))
                .collect();
            seen.sort_unstable();
            proptest::prop_assert_eq!(seen, records);
        }
    }
}
