//! Adaptive batch iteration.
//!
//! Bulk lookups copy whole hash buckets, so a buffer smaller than the
//! biggest bucket fails with an insufficient-buffer error. The iterator
//! starts from a chunk size sized for an average table and doubles it on
//! every such failure, up to a bounded number of attempts per batch.

use crate::map::Map;
use mapcache_core::constants::{DEFAULT_BATCH_RETRIES, MIN_BATCH_CHUNK_SIZE};
use mapcache_core::{MapError, MapKey, MapRecord, MapResult, MapValue};
use mapcache_store::{BatchCursor, BatchRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cooperative cancellation for batch iteration.
///
/// Clones share the flag. Checked before every bulk lookup.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancelled once `deadline` has passed.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Starting chunk size for a table of `max_entries`.
///
/// The smallest power of two at or above `sqrt(2 * max_entries)`, which
/// covers the largest bucket of a reasonably balanced hash table.
pub fn starting_chunk_size(max_entries: u32) -> usize {
    let root = (2.0 * f64::from(max_entries)).sqrt();
    if root <= 1.0 {
        return 1;
    }
    2f64.powf(root.log2().ceil()) as usize
}

// ============================================================================
// BATCH ITERATOR
// ============================================================================

/// Iterates a map in bulk.
///
/// ```ignore
/// let mut iter = BatchIterator::new(&map);
/// for (key, value) in iter.iterate_all(&Cancellation::new()) {
///     // ...
/// }
/// if let Some(err) = iter.err() {
///     // the sequence ended early
/// }
/// ```
pub struct BatchIterator<'m, K, V> {
    map: &'m Map<K, V>,
    max_retries: u32,
    starting_chunk_size: Option<usize>,
    chunk_size: usize,
    processed: usize,
    err: Option<MapError>,
}

impl<'m, K: MapKey, V: MapValue> BatchIterator<'m, K, V> {
    /// Iterator configured from the map's batch settings.
    pub fn new(map: &'m Map<K, V>) -> Self {
        let config = &map.shared.batch;
        Self {
            map,
            max_retries: config.max_retries,
            starting_chunk_size: config.starting_chunk_size,
            chunk_size: 0,
            processed: 0,
            err: None,
        }
    }

    /// Buffer growths allowed per batch; zero means the default.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = if max_retries == 0 {
            DEFAULT_BATCH_RETRIES
        } else {
            max_retries
        };
        self
    }

    /// Override the capacity-derived starting chunk size. Zero falls back to
    /// the minimum chunk size.
    pub fn with_starting_chunk_size(mut self, size: usize) -> Self {
        self.starting_chunk_size = Some(size);
        self
    }

    /// Error that ended the last iteration early, if any.
    pub fn err(&self) -> Option<&MapError> {
        self.err.as_ref()
    }

    /// Chunk size reached by the last iteration.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Entries delivered by the last iteration.
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Lazily iterate every entry of the map.
    ///
    /// The sequence ends early on cancellation or failure; check
    /// [`BatchIterator::err`] afterwards. Unsupported map types yield an
    /// empty sequence with [`MapError::Unsupported`] recorded.
    pub fn iterate_all<'a>(&'a mut self, cancel: &'a Cancellation) -> Batches<'a, 'm, K, V> {
        self.err = None;
        self.processed = 0;
        self.reset_chunk_size();

        let map_type = self.map.map_type();
        let done = !map_type.supports_batch_lookup();
        if done {
            self.err = Some(MapError::Unsupported {
                operation: "batch iteration",
                map_type,
            });
        }

        let chunk_size = self.chunk_size;
        Batches {
            iter: self,
            cancel,
            cursor: BatchCursor::new(),
            keys: vec![0; chunk_size * K::SIZE],
            values: vec![0; chunk_size * V::SIZE],
            len: 0,
            pos: 0,
            done,
        }
    }

    fn reset_chunk_size(&mut self) {
        self.chunk_size = match self.starting_chunk_size {
            Some(0) => MIN_BATCH_CHUNK_SIZE,
            Some(size) => size,
            None => starting_chunk_size(self.map.max_entries()),
        };
    }

    /// Fetch the next batch, growing the buffers on insufficient-buffer
    /// failures.
    ///
    /// The first attempt is not a retry: with `max_retries` retries the
    /// buffer can grow to `start << max_retries` entries.
    fn fetch(
        &mut self,
        cursor: &mut BatchCursor,
        keys: &mut Vec<u8>,
        values: &mut Vec<u8>,
    ) -> MapResult<BatchRead> {
        let attempts = self.max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.map.batch_lookup(cursor, keys, values) {
                Ok(read) => return Ok(read),
                Err(MapError::Store(e)) if e.is_insufficient_buffer() => {
                    if attempt == attempts {
                        break;
                    }
                    self.chunk_size *= 2;
                    keys.resize(self.chunk_size * K::SIZE, 0);
                    values.resize(self.chunk_size * V::SIZE, 0);
                    tracing::debug!(
                        map = %self.map.name(),
                        chunk_size = self.chunk_size,
                        attempt,
                        "Batch buffer too small, growing"
                    );
                }
                Err(MapError::Store(e)) => return Err(MapError::BatchIteration(e)),
                Err(e) => return Err(e),
            }
        }

        Err(MapError::BatchRetriesExhausted {
            chunk_size: self.chunk_size,
            attempts,
        })
    }
}

/// The lazy sequence returned by [`BatchIterator::iterate_all`].
pub struct Batches<'a, 'm, K, V> {
    iter: &'a mut BatchIterator<'m, K, V>,
    cancel: &'a Cancellation,
    cursor: BatchCursor,
    keys: Vec<u8>,
    values: Vec<u8>,
    len: usize,
    pos: usize,
    done: bool,
}

impl<K: MapKey, V: MapValue> Batches<'_, '_, K, V> {
    fn decode(&self, i: usize) -> MapResult<(K, V)> {
        let key = K::from_bytes(&self.keys[i * K::SIZE..(i + 1) * K::SIZE])?;
        let value = V::from_bytes(&self.values[i * V::SIZE..(i + 1) * V::SIZE])?;
        Ok((key, value))
    }

    fn fail(&mut self, err: MapError) {
        self.iter.err = Some(err);
        self.done = true;
        self.len = 0;
    }
}

impl<K: MapKey, V: MapValue> Iterator for Batches<'_, '_, K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            if self.pos < self.len {
                let i = self.pos;
                self.pos += 1;
                return match self.decode(i) {
                    Ok(entry) => {
                        self.iter.processed += 1;
                        Some(entry)
                    }
                    Err(e) => {
                        self.fail(e);
                        None
                    }
                };
            }
            if self.done {
                return None;
            }

            if self.cancel.is_cancelled() {
                self.fail(MapError::Cancelled);
                return None;
            }

            self.pos = 0;
            match self
                .iter
                .fetch(&mut self.cursor, &mut self.keys, &mut self.values)
            {
                Ok(read) => {
                    self.len = read.count;
                    self.done = read.exhausted;
                }
                Err(e) => {
                    self.fail(e);
                    return None;
                }
            }
        }
    }
}

/// Drain `iter` and count the entries, failing if iteration ended early.
pub fn count_all<K: MapKey, V: MapValue>(
    iter: &mut BatchIterator<'_, K, V>,
    cancel: &Cancellation,
) -> MapResult<usize> {
    let count = iter.iterate_all(cancel).count();
    match iter.err.take() {
        Some(err) => Err(err),
        None => Ok(count),
    }
}

impl<K: MapKey, V: MapValue> Map<K, V> {
    pub(crate) fn batch_lookup(
        &self,
        cursor: &mut BatchCursor,
        keys: &mut [u8],
        values: &mut [u8],
    ) -> MapResult<BatchRead> {
        let store = self.store()?;
        Ok(store.batch_lookup(cursor, keys, values)?)
    }

    pub fn batch_iterator(&self) -> BatchIterator<'_, K, V> {
        BatchIterator::new(self)
    }

    /// Count the entries of the table in bulk, without decoding them.
    pub fn batch_count(&self) -> MapResult<usize> {
        let map_type = self.map_type();
        if !map_type.supports_batch_lookup() {
            return Err(MapError::Unsupported {
                operation: "batch count",
                map_type,
            });
        }

        let mut iter = self.batch_iterator();
        iter.reset_chunk_size();
        let mut cursor = BatchCursor::new();
        let mut keys = vec![0; iter.chunk_size * K::SIZE];
        let mut values = vec![0; iter.chunk_size * V::SIZE];

        let mut count = 0;
        loop {
            let read = iter.fetch(&mut cursor, &mut keys, &mut values)?;
            count += read.count;
            if read.exhausted {
                return Ok(count);
            }
        }
    }
}
