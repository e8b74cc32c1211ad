//! Wire packing of user cell payloads.
//!
//! Every cell owned by a rank carries one payload value. Payloads travel
//! between ranks during ghost exchange, refinement and migration, so the
//! payload type declares how it is packed into bytes. All multi-byte
//! integers on the wire are little-endian fixed width.

use crate::grid_error::GridError;

/// A user payload attached to each owned leaf cell.
///
/// `FIXED_LEN` is `Some(n)` when every value packs to exactly `n` bytes;
/// bulk (one-message-per-peer) transfers require it. Variable-length
/// payloads set it to `None` and are exchanged one cell at a time after a
/// size handshake.
pub trait CellData: Clone + Default + Send + 'static {
    /// Wire length of every value, or `None` for variable-length payloads.
    const FIXED_LEN: Option<usize>;

    /// Appends this value's wire bytes to `buf`.
    ///
    /// For fixed-length payloads the number of appended bytes must equal
    /// `FIXED_LEN`.
    fn pack(&self, buf: &mut Vec<u8>);

    /// Replaces this value with the one decoded from `bytes`.
    fn unpack(&mut self, bytes: &[u8]) -> Result<(), GridError>;
}

macro_rules! impl_cell_data_for_le_number {
    ($($t:ty),*) => {$(
        impl CellData for $t {
            const FIXED_LEN: Option<usize> = Some(std::mem::size_of::<$t>());

            #[inline]
            fn pack(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }

            #[inline]
            fn unpack(&mut self, bytes: &[u8]) -> Result<(), GridError> {
                let arr: [u8; std::mem::size_of::<$t>()] =
                    bytes.try_into().map_err(|_| GridError::PayloadSizeMismatch {
                        expected: std::mem::size_of::<$t>(),
                        got: bytes.len(),
                    })?;
                *self = <$t>::from_le_bytes(arr);
                Ok(())
            }
        }
    )*};
}

impl_cell_data_for_le_number!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// The unit payload, for grids used purely for topology.
impl CellData for () {
    const FIXED_LEN: Option<usize> = Some(0);

    #[inline]
    fn pack(&self, _buf: &mut Vec<u8>) {}

    #[inline]
    fn unpack(&mut self, bytes: &[u8]) -> Result<(), GridError> {
        if bytes.is_empty() {
            Ok(())
        } else {
            Err(GridError::PayloadSizeMismatch {
                expected: 0,
                got: bytes.len(),
            })
        }
    }
}
