//! Fixed-layout record traits for map keys and values.
//!
//! Every record declares its encoded size statically through
//! [`MapRecord::SIZE`]. Map specs derive key and value sizes from these
//! constants; nothing inspects types at runtime.

use crate::constants::PER_CPU_ALIGNMENT;
use crate::error::StoreError;
use std::fmt;

/// A fixed-size binary record stored in an external map.
///
/// # Implementation Requirements
///
/// - `SIZE` is the exact number of bytes produced by `encode`
/// - `zeroed()` returns the all-zero instance used as a decode target
/// - `decode` must reject buffers shorter than `SIZE`
/// - `Display` must be stable: it is the key of the in-process cache
pub trait MapRecord: fmt::Display + fmt::Debug + Clone + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Fresh zero-valued instance.
    fn zeroed() -> Self;

    /// Write the encoded record into `out`, which is exactly `SIZE` bytes.
    fn encode(&self, out: &mut [u8]);

    /// Overwrite `self` from the first `SIZE` bytes of `bytes`.
    fn decode(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Encode into a freshly allocated buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::SIZE];
        self.encode(&mut out);
        out
    }

    /// Decode a fresh record from `bytes`.
    fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut record = Self::zeroed();
        record.decode(bytes)?;
        Ok(record)
    }
}

/// Marker for records usable as map keys.
pub trait MapKey: MapRecord {}

/// Marker for records usable as map values.
pub trait MapValue: MapRecord {}

/// Values of per-CPU maps.
///
/// A per-CPU lookup returns one slot per possible CPU, each slot padded to
/// [`PER_CPU_ALIGNMENT`] bytes.
pub trait PerCpuValue: MapValue {
    /// Decode one value per CPU from a per-CPU lookup buffer.
    fn decode_per_cpu(bytes: &[u8], possible_cpus: usize) -> Result<Vec<Self>, StoreError> {
        let stride = per_cpu_stride(Self::SIZE);
        let expected = stride * possible_cpus;
        if bytes.len() < expected {
            return Err(StoreError::SizeMismatch {
                expected,
                got: bytes.len(),
            });
        }

        bytes
            .chunks_exact(stride)
            .take(possible_cpus)
            .map(Self::from_bytes)
            .collect()
    }
}

/// Size of one per-CPU slot for a value of `size` bytes.
pub fn per_cpu_stride(size: usize) -> usize {
    size.div_ceil(PER_CPU_ALIGNMENT) * PER_CPU_ALIGNMENT
}
