//! Byte-level helpers for the wire format.
//!
//! Conventions: all integers are LE fixed width, payload records are
//! `#[repr(C)]` and `bytemuck::Pod`-safe. Receivers verify lengths; higher
//! layers exchange sizes first whenever a length is not implied by the
//! protocol.

/// Reinterpret a Pod slice as bytes.
pub fn cast_slice<T: bytemuck::Pod>(data: &[T]) -> &[u8] {
    bytemuck::cast_slice(data)
}

/// Reinterpret received bytes as a Pod slice. The byte length must be an
/// exact multiple of `size_of::<T>()`.
pub fn cast_slice_from<T: bytemuck::Pod>(bytes: &[u8]) -> &[T] {
    bytemuck::cast_slice(bytes)
}

/// Copy received bytes into an owned Pod vector, tolerating the unaligned
/// buffers that come out of a receive queue.
pub fn pod_vec_from<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    let n = bytes.len() / std::mem::size_of::<T>();
    let mut out = vec![T::zeroed(); n];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_round_trip() {
        let xs: Vec<u64> = vec![1, 2, 3, u64::MAX];
        let bytes = cast_slice(&xs).to_vec();
        assert_eq!(pod_vec_from::<u64>(&bytes), xs);
    }

    #[test]
    fn unaligned_source() {
        let xs: Vec<f64> = vec![0.5, -1.25];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(cast_slice(&xs));
        assert_eq!(pod_vec_from::<f64>(&bytes[1..]), xs);
    }
}
