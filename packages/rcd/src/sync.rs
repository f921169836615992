//! Initial device snapshot for newly joined subscribers.
//!
//! A subscriber sees every device that existed when it connected before it
//! sees any live event. After that it only gets incremental add/remove lines.

use std::io;

use bytes::Bytes;
use stream_codec::{Codec, CodecError, compress_bound};
use tracing::warn;

use crate::device::DeviceRecord;
use crate::subscriber::{Mode, Subscriber};

/// Fixed destination for compressed lifecycle notifications.
pub const LIFECYCLE_FRAME: usize = 512;

/// Render a device add/remove line. Compressed output goes through a fixed
/// stack destination; lines whose bound exceeds it get an owned frame.
pub fn render_lifecycle(mode: Mode, line: &str, codec: &mut Codec) -> Result<Bytes, CodecError> {
    match mode {
        Mode::Plain => Ok(Bytes::copy_from_slice(line.as_bytes())),
        Mode::Compressed if compress_bound(line.len()) > LIFECYCLE_FRAME => {
            codec.compress(line.as_bytes()).map(Bytes::from)
        }
        Mode::Compressed => {
            let mut dst = [0u8; LIFECYCLE_FRAME];
            let n = codec.compress_into(&mut dst, line.as_bytes())?;
            Ok(Bytes::copy_from_slice(&dst[..n]))
        }
    }
}

/// Send one device description to one subscriber.
///
/// The API preamble goes out first if this subscriber has never received it.
pub fn send_device(sub: &mut Subscriber, record: &DeviceRecord, codec: &mut Codec) -> io::Result<()> {
    if !sub.seen_api_info() {
        let preamble = record.preamble();
        if !preamble.is_empty() {
            sub.send_text(&preamble, codec)?;
        }
        sub.mark_api_info_seen();
    }

    match render_lifecycle(sub.mode(), &record.add_line(), codec) {
        Ok(frame) => sub.send(frame)?,
        Err(e) => warn!(conn_id = sub.id(), device = %record.id, error = %e, "dropping device add"),
    }

    let stations = record.station_lines();
    if !stations.is_empty() {
        sub.send_text(&stations, codec)?;
    }
    Ok(())
}

/// Replay `snapshot` to `sub` if it has not been synchronized yet.
///
/// Returns the number of device records sent.
pub fn replay(sub: &mut Subscriber, snapshot: &[DeviceRecord], codec: &mut Codec) -> io::Result<usize> {
    if sub.is_synced() {
        return Ok(0);
    }

    for record in snapshot {
        send_device(sub, record, codec)?;
    }
    sub.mark_synced();
    Ok(snapshot.len())
}
