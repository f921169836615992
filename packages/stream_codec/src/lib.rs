//! Compressed framing for line-oriented telemetry streams.
//!
//! [`Codec`] wraps a long-lived zstd context primed with a shared dictionary.
//! [`StreamBuffer`] batches lines and flushes them through a codec into one
//! independently decodable frame at a time.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use stream_codec::{Codec, FrameSink, StreamBuffer};
//!
//! struct Stdout;
//!
//! impl FrameSink for Stdout {
//!     fn deliver(&mut self, frame: &[u8]) {
//!         println!("frame of {} bytes", frame.len());
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut codec = Codec::from_dictionary_file("dictionary.zdict".as_ref(), 3)?;
//! let mut buffer = StreamBuffer::new(4096, Duration::from_millis(1000));
//! buffer.append(b"phy0;tx_status;ok\n", &mut codec, &mut Stdout)?;
//! buffer.flush(&mut codec, &mut Stdout);
//! # Ok(())
//! # }
//! ```

mod buffer;
mod codec;
mod error;

pub use buffer::{DEFAULT_CAPACITY, DEFAULT_TIMEOUT, FrameSink, StreamBuffer};
pub use codec::{Codec, DEFAULT_LEVEL, compress_bound};
pub use error::{BufferError, CodecError, Result};
