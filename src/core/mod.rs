//! # Core Packet Components
//!
//! Low-level packet handling and stream framing.
//!
//! ## Components
//! - **Packet**: ordered binary buffer with typed reads and writes
//! - **Codec**: carry-over reassembly of TCP reads and the length-prefix encoder
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [MessageId(4)] [Payload(N)]
//! ```
//! All integers are 32-bit little-endian. `Length` counts the bytes after itself.
//!
//! ## Safety
//! - Maximum frame size: 16MB (a larger declared length closes the stream)
//! - Reads past the written content fail instead of returning stale bytes

pub mod codec;
pub mod packet;
