//! RLP prefix byte constants.
//!
//! See <https://ethereum.org/en/developers/docs/data-structures-and-encoding/rlp/>.

/// Prefix for a single zero-length string, and the encoding of the integer 0.
pub const RLP_NULL: u8 = 0x80;

/// Prefix for the empty list.
pub const RLP_EMPTY_LIST: u8 = 0xc0;
