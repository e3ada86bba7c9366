//! Chunked batch writes and reads with resubmission of unprocessed items.
//!
//! Items are split into chunks no larger than the backend's per-call limit.
//! Whatever the backend reports back as unprocessed, or a whole chunk that
//! failed with a throttling error, is resubmitted after a delay that starts
//! at the configured base and doubles each round. Throttling retries are
//! unbounded; the loop checks the cancellation signal every round and the
//! sleep itself is cancellable. Any other error ends the chunk and is then
//! raised or swallowed according to the [`FailurePolicy`].

use crate::client::CancelSignal;
use crate::config::{StoreConfig, MAX_READ_BATCH, MAX_WRITE_BATCH};
use crate::error::{Result, ShortstackError};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, then return the error to the caller.
    Raise,
    /// Log and carry on with the next chunk.
    Swallow,
}

impl FailurePolicy {
    pub fn for_writes(config: &StoreConfig) -> Self {
        if config.fail_on_write_error {
            FailurePolicy::Raise
        } else {
            FailurePolicy::Swallow
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchExecutor {
    write_chunk: usize,
    read_chunk: usize,
    base_delay: Duration,
    request_timeout: Duration,
    cancel: CancelSignal,
}

impl BatchExecutor {
    pub fn new(config: &StoreConfig, cancel: CancelSignal) -> Self {
        BatchExecutor {
            write_chunk: config.write_chunk(),
            read_chunk: config.read_chunk(),
            base_delay: config.retry_base_delay(),
            request_timeout: config.request_timeout(),
            cancel,
        }
    }

    pub fn with_chunk_sizes(mut self, write_chunk: usize, read_chunk: usize) -> Self {
        self.write_chunk = write_chunk.clamp(1, MAX_WRITE_BATCH);
        self.read_chunk = read_chunk.clamp(1, MAX_READ_BATCH);
        self
    }

    pub fn write_chunk(&self) -> usize {
        self.write_chunk
    }

    pub fn read_chunk(&self) -> usize {
        self.read_chunk
    }

    /// Runs one backend call under the per-request timeout.
    pub async fn timed<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ShortstackError::Timeout(self.request_timeout.as_millis() as u64)),
        }
    }

    /// Writes `items` in chunks. `submit` receives one chunk and returns the
    /// items the backend did not process. Returns how many items were
    /// written.
    pub async fn write_all<T, F, Fut>(
        &self,
        label: &str,
        items: Vec<T>,
        policy: FailurePolicy,
        mut submit: F,
    ) -> Result<usize>
    where
        T: Clone,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let total = items.len();
        let mut written = 0;

        for chunk in split_chunks(items, self.write_chunk) {
            let len = chunk.len();
            match self.drive_write(label, chunk, &mut submit).await {
                Ok(()) => written += len,
                Err(ShortstackError::Cancelled) => return Err(ShortstackError::Cancelled),
                Err(e) => {
                    tracing::error!(
                        "[BATCH {}] write of {} items failed: {}",
                        label,
                        len,
                        e
                    );
                    if policy == FailurePolicy::Raise {
                        return Err(e);
                    }
                }
            }
        }

        tracing::debug!("[BATCH {}] wrote {}/{} items", label, written, total);
        Ok(written)
    }

    /// Reads `keys` in chunks. `submit` returns the found values and the keys
    /// the backend left unprocessed. Missing keys are simply absent from the
    /// result.
    pub async fn read_all<K, V, F, Fut>(
        &self,
        label: &str,
        keys: Vec<K>,
        policy: FailurePolicy,
        mut submit: F,
    ) -> Result<Vec<V>>
    where
        K: Clone,
        F: FnMut(Vec<K>) -> Fut,
        Fut: Future<Output = Result<(Vec<V>, Vec<K>)>>,
    {
        let mut found = Vec::with_capacity(keys.len());

        for chunk in split_chunks(keys, self.read_chunk) {
            let len = chunk.len();
            match self.drive_read(label, chunk, &mut submit, &mut found).await {
                Ok(()) => {}
                Err(ShortstackError::Cancelled) => return Err(ShortstackError::Cancelled),
                Err(e) => {
                    tracing::error!("[BATCH {}] read of {} keys failed: {}", label, len, e);
                    if policy == FailurePolicy::Raise {
                        return Err(e);
                    }
                }
            }
        }

        Ok(found)
    }

    async fn drive_write<T, F, Fut>(&self, label: &str, chunk: Vec<T>, submit: &mut F) -> Result<()>
    where
        T: Clone,
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let mut pending = chunk;
        let mut delay = self.base_delay;
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ShortstackError::Cancelled);
            }
            attempt += 1;
            match self.timed(submit(pending.clone())).await {
                Ok(unprocessed) if unprocessed.is_empty() => return Ok(()),
                Ok(unprocessed) => {
                    tracing::warn!(
                        "[BATCH {}] {} unprocessed items after attempt {}, retrying in {:?}",
                        label,
                        unprocessed.len(),
                        attempt,
                        delay
                    );
                    pending = unprocessed;
                }
                Err(e) if e.is_throttling() => {
                    tracing::warn!(
                        "[BATCH {}] throttled on attempt {} ({}), retrying {} items in {:?}",
                        label,
                        attempt,
                        e,
                        pending.len(),
                        delay
                    );
                }
                Err(e) => return Err(e),
            }
            self.backoff(delay).await?;
            delay = delay.saturating_mul(2);
        }
    }

    async fn drive_read<K, V, F, Fut>(
        &self,
        label: &str,
        chunk: Vec<K>,
        submit: &mut F,
        found: &mut Vec<V>,
    ) -> Result<()>
    where
        K: Clone,
        F: FnMut(Vec<K>) -> Fut,
        Fut: Future<Output = Result<(Vec<V>, Vec<K>)>>,
    {
        let mut pending = chunk;
        let mut delay = self.base_delay;
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(ShortstackError::Cancelled);
            }
            attempt += 1;
            match self.timed(submit(pending.clone())).await {
                Ok((values, unprocessed)) => {
                    found.extend(values);
                    if unprocessed.is_empty() {
                        return Ok(());
                    }
                    tracing::warn!(
                        "[BATCH {}] {} unprocessed keys after attempt {}, retrying in {:?}",
                        label,
                        unprocessed.len(),
                        attempt,
                        delay
                    );
                    pending = unprocessed;
                }
                Err(e) if e.is_throttling() => {
                    tracing::warn!(
                        "[BATCH {}] throttled on attempt {} ({}), retrying {} keys in {:?}",
                        label,
                        attempt,
                        e,
                        pending.len(),
                        delay
                    );
                }
                Err(e) => return Err(e),
            }
            self.backoff(delay).await?;
            delay = delay.saturating_mul(2);
        }
    }

    async fn backoff(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(ShortstackError::Cancelled),
        }
    }
}

/// Splits `items` into consecutive chunks of at most `size`.
pub fn split_chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
