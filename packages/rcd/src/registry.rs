//! Primary subscriber registry.
//!
//! Plain subscribers get each event as its own line. Compressed subscribers
//! share one [`StreamBuffer`] whose frames are fanned out at flush time.

use std::fmt;

use stream_codec::{Codec, StreamBuffer};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::DeviceRecord;
use crate::subscriber::{Collection, Mode, Subscriber, SubscriberId};
use crate::sync;

#[derive(Debug)]
pub struct Registry {
    plain: Collection,
    compressed: Collection,
    buffer: Option<StreamBuffer>,
}

impl Registry {
    /// `buffer` is `None` when compression is disabled.
    pub fn new(buffer: Option<StreamBuffer>) -> Self {
        Self {
            plain: Collection::new(Mode::Plain),
            compressed: Collection::new(Mode::Compressed),
            buffer,
        }
    }

    pub fn compression_enabled(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn collection(&self, mode: Mode) -> &Collection {
        match mode {
            Mode::Plain => &self.plain,
            Mode::Compressed => &self.compressed,
        }
    }

    fn collection_mut(&mut self, mode: Mode) -> &mut Collection {
        match mode {
            Mode::Plain => &mut self.plain,
            Mode::Compressed => &mut self.compressed,
        }
    }

    pub fn len(&self) -> usize {
        self.plain.len() + self.compressed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.plain.contains(id) || self.compressed.contains(id)
    }

    /// Register a new subscriber after replaying the device snapshot to it.
    pub fn accept(&mut self, mut sub: Subscriber, snapshot: &[DeviceRecord], codec: &mut Codec) {
        let id = sub.id();
        let mode = sub.mode();

        if mode == Mode::Compressed && !self.compression_enabled() {
            warn!(conn_id = id, "compression disabled, refusing subscriber");
            return;
        }
        if mode == Mode::Compressed {
            // Batched events predate this subscriber.
            self.flush(codec);
        }

        match sync::replay(&mut sub, snapshot, codec) {
            Ok(records) => {
                info!(conn_id = id, peer = %sub.peer(), %mode, records, "subscriber connected");
                self.collection_mut(mode).insert(sub);
            }
            Err(e) => debug!(conn_id = id, error = %e, "subscriber lost during snapshot"),
        }
    }

    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let removed = self
            .plain
            .remove(id)
            .or_else(|| self.compressed.remove(id))
            .is_some();
        if removed {
            info!(conn_id = id, "subscriber disconnected");
        }
        removed
    }

    /// Deliver one device event to every subscriber.
    pub fn broadcast_event(&mut self, device: &str, line: &str, codec: &mut Codec) {
        let text = format!("{device};{line}\n");
        self.plain.broadcast_text(&text, codec);

        if self.compressed.is_empty() {
            return;
        }
        if let Some(buffer) = &mut self.buffer {
            // Oversized events are logged by the buffer.
            let _ = buffer.append(text.as_bytes(), codec, &mut self.compressed);
        }
    }

    /// Deliver an administrative notice to every subscriber. Compressed
    /// subscribers get it as its own frame, after anything already batched.
    pub fn broadcast_formatted(&mut self, args: fmt::Arguments<'_>, codec: &mut Codec) {
        let text = args.to_string();
        self.plain.broadcast_text(&text, codec);
        self.flush(codec);
        self.compressed.broadcast_text(&text, codec);
    }

    /// Announce a newly added device.
    pub fn device_added(&mut self, record: &DeviceRecord, codec: &mut Codec) {
        self.flush(codec);
        for mode in [Mode::Plain, Mode::Compressed] {
            self.collection_mut(mode)
                .sweep(|sub| sync::send_device(sub, record, codec));
        }
    }

    pub fn device_removed(&mut self, id: &str, codec: &mut Codec) {
        self.flush(codec);
        let line = DeviceRecord::remove_line(id);
        for mode in [Mode::Plain, Mode::Compressed] {
            let collection = self.collection_mut(mode);
            if collection.is_empty() {
                continue;
            }
            match sync::render_lifecycle(mode, &line, codec) {
                Ok(frame) => {
                    collection.fan_out(&frame);
                }
                Err(e) => warn!(device = id, error = %e, "dropping device removal"),
            }
        }
    }

    /// Send `text` to one subscriber only.
    pub fn reply(&mut self, id: SubscriberId, text: &str, codec: &mut Codec) {
        for mode in [Mode::Plain, Mode::Compressed] {
            let collection = self.collection_mut(mode);
            if let Some(sub) = collection.get_mut(id) {
                if let Err(e) = sub.send_text(text, codec) {
                    debug!(conn_id = id, error = %e, "reply failed");
                    collection.remove(id);
                }
                return;
            }
        }
    }

    pub fn flush(&mut self, codec: &mut Codec) {
        if let Some(buffer) = &mut self.buffer {
            buffer.flush(codec, &mut self.compressed);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.buffer.as_ref().and_then(StreamBuffer::deadline)
    }

    pub fn poll_expired(&mut self, now: Instant, codec: &mut Codec) {
        if let Some(buffer) = &mut self.buffer {
            buffer.poll_expired(now, codec, &mut self.compressed);
        }
    }

    /// Flush pending output and close every subscriber.
    pub fn shutdown(&mut self, codec: &mut Codec) {
        self.flush(codec);
        if let Some(buffer) = &mut self.buffer {
            buffer.cancel();
        }
        self.plain.clear();
        self.compressed.clear();
    }
}
