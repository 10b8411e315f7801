//! Multifeed wire layer.
//!
//! Carries every protocol extension and every per-feed sub-stream of one
//! peer session over a single bidirectional byte stream.
//!
//! Wire format: `u32` big-endian length prefix followed by a
//! MessagePack-encoded [`Frame`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use multifeed_wire::{spawn_reader, spawn_writer, Frame, WireConfig};
//!
//! # async fn example(stream: tokio::io::DuplexStream) -> Result<(), multifeed_wire::WireError> {
//! let config = WireConfig::new();
//! let (read_half, write_half) = tokio::io::split(stream);
//! let (mut frames, _reader) = spawn_reader(read_half, &config);
//! let (outbound, writer) = spawn_writer(write_half, &config);
//!
//! outbound.send(Frame::Close).await.map_err(|_| multifeed_wire::WireError::Closed)?;
//! while let Some(frame) = frames.recv().await {
//!     println!("got {}", frame?.kind());
//! }
//! drop(outbound);
//! writer.await.map_err(|_| multifeed_wire::WireError::Closed)??;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod frame;
mod key;
mod stream;

pub use config::WireConfig;
pub use error::WireError;
pub use frame::Frame;
pub use key::{discovery_key, FeedKey, KEY_LEN};
pub use stream::{read_framed, spawn_reader, spawn_writer, write_framed};
