//! # discv5-rlp
//!
//! Recursive Length Prefix (RLP) encoding and decoding, used on the wire for
//! discv5 message payloads and for Ethereum Node Records (ENRs).
//!
//! ## Quick Start
//!
//! ```rust
//! use discv5_rlp::encode::RLPEncode;
//! use discv5_rlp::decode::RLPDecode;
//!
//! let value: u64 = 42;
//! let encoded = value.encode_to_vec();
//! let decoded = u64::decode(&encoded).unwrap();
//! assert_eq!(value, decoded);
//! ```
//!
//! ## Core Traits
//!
//! - [`encode::RLPEncode`]: types that can be RLP-encoded
//! - [`decode::RLPDecode`]: types that can be RLP-decoded
//!
//! ## Builder Structs
//!
//! - [`structs::Encoder`]: fluent API for encoding structs field by field
//! - [`structs::Decoder`]: fluent API for decoding structs with error context
//!
//! ## Modules
//!
//! - [`encode`]: encoding trait, implementations, and helper functions
//! - [`decode`]: decoding trait, implementations, and helper functions
//! - [`structs`]: `Encoder` and `Decoder` builder types for complex structures
//! - [`error`]: error types for encoding and decoding failures
//! - [`constants`]: RLP protocol constants (`RLP_NULL`, `RLP_EMPTY_LIST`)

pub mod constants;
pub mod decode;
pub mod encode;
pub mod error;
pub mod structs;
