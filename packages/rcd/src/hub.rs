//! The single owner of daemon state.
//!
//! All I/O tasks report to the hub through one channel; the hub applies
//! each event to the registry, the device directory and the monitoring
//! sessions in arrival order. Nothing else mutates that state.

use std::collections::BTreeSet;
use std::io::Write;

use stream_codec::{Codec, StreamBuffer};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::control::{self, Command, CommandError, Target};
use crate::device::DeviceDirectory;
use crate::net;
use crate::registry::Registry;
use crate::session::{SessionId, SessionManager};
use crate::subscriber::{Mode, Subscriber, SubscriberId, Transport};

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Primary(Mode),
    Session(SessionId),
}

impl Endpoint {
    pub fn session(&self) -> Option<SessionId> {
        match self {
            Endpoint::Primary(_) => None,
            Endpoint::Session(id) => Some(*id),
        }
    }
}

/// Where a line or a close came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A subscriber connection, on the primary ports or on a session port.
    Client {
        session: Option<SessionId>,
        id: SubscriberId,
    },
    /// A device event stream.
    Device { id: String, generation: u64 },
    /// The source file of a monitoring session.
    Session(SessionId),
}

pub enum HubEvent {
    Connected {
        endpoint: Endpoint,
        id: SubscriberId,
        transport: Box<dyn Transport>,
    },
    Line {
        origin: Origin,
        line: String,
    },
    Closed {
        origin: Origin,
        reason: Option<String>,
    },
    DevicesScanned(Vec<String>),
}

pub struct Hub {
    codec: Codec,
    registry: Registry,
    sessions: SessionManager,
    devices: DeviceDirectory,
    events: mpsc::Sender<HubEvent>,
}

impl Hub {
    pub fn new(config: &DaemonConfig, codec: Codec, events: mpsc::Sender<HubEvent>) -> Self {
        let buffer = config.compression.enabled().then(|| {
            StreamBuffer::new(config.compression.buffer_size, config.compression.timeout)
        });
        Self {
            codec,
            registry: Registry::new(buffer),
            sessions: SessionManager::new(
                config.monitor.bind,
                config.server.send_queue,
                events.clone(),
            ),
            devices: DeviceDirectory::new(config.devices.paths.clone()),
            events,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn devices(&self) -> &DeviceDirectory {
        &self.devices
    }

    /// Process events until `shutdown` fires, then flush and close everything.
    pub async fn run(mut self, mut events: mpsc::Receiver<HubEvent>, shutdown: CancellationToken) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sleep_until(deadline) => self.poll_timers(Instant::now()),
            }
        }
        self.shutdown();
    }

    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected {
                endpoint: Endpoint::Primary(mode),
                id,
                transport,
            } => {
                let snapshot = self.devices.snapshot();
                self.registry.accept(
                    Subscriber::new(id, mode, transport),
                    &snapshot,
                    &mut self.codec,
                );
            }
            HubEvent::Connected {
                endpoint: Endpoint::Session(session),
                id,
                transport,
            } => self.sessions.accept(session, id, transport),

            HubEvent::Line { origin, line } => match origin {
                Origin::Client { session: None, id } => self.dispatch(id, &line),
                Origin::Client { session: Some(_), .. } => {}
                Origin::Device { id, generation } => {
                    if self.devices.is_current(&id, generation) {
                        self.registry.broadcast_event(&id, &line, &mut self.codec);
                    }
                }
                Origin::Session(session) => {
                    self.sessions.source_line(session, &line, &mut self.codec)
                }
            },

            HubEvent::Closed { origin, reason } => match origin {
                Origin::Client { session: None, id } => {
                    self.registry.remove(id);
                }
                Origin::Client {
                    session: Some(session),
                    id,
                } => self.sessions.subscriber_closed(session, id),
                Origin::Device { id, generation } => {
                    if self.devices.is_current(&id, generation) {
                        debug!(device = %id, ?reason, "device event stream ended");
                        self.remove_device(&id);
                    }
                }
                Origin::Session(session) => {
                    let reason = reason.as_deref().unwrap_or("source closed");
                    self.sessions.teardown(session, reason);
                }
            },

            HubEvent::DevicesScanned(names) => self.sync_devices(names),
        }
    }

    fn sync_devices(&mut self, names: Vec<String>) {
        let present: BTreeSet<String> = names.into_iter().collect();
        let gone: Vec<String> = self
            .devices
            .ids()
            .filter(|id| !present.contains(*id))
            .map(str::to_string)
            .collect();

        for id in gone {
            self.remove_device(&id);
        }
        for id in present {
            if !self.devices.contains(&id) {
                self.add_device(&id);
            }
        }
    }

    fn add_device(&mut self, id: &str) {
        let (generation, events) = match self.devices.open(id) {
            Ok(opened) => opened,
            Err(e) => {
                debug!(device = id, error = %e, "cannot open device");
                return;
            }
        };

        let cancel = CancellationToken::new();
        net::spawn_line_reader(
            net::EventSource::new(events),
            Origin::Device {
                id: id.to_string(),
                generation,
            },
            self.events.clone(),
            cancel.clone(),
        );
        self.devices.attach_reader(id, cancel.drop_guard());
        info!(device = id, generation, "device added");

        if let Some(record) = self.devices.describe(id) {
            self.registry.device_added(&record, &mut self.codec);
        }
    }

    fn remove_device(&mut self, id: &str) {
        if self.devices.remove(id).is_some() {
            info!(device = id, "device removed");
            self.registry.device_removed(id, &mut self.codec);
        }
    }

    fn dispatch(&mut self, client: SubscriberId, line: &str) {
        let result = control::parse(line).and_then(|cmd| match cmd {
            Some(cmd) => self.execute(client, cmd),
            None => Ok(()),
        });

        if let Err(e) = result {
            debug!(conn_id = client, command = line, error = %e, "command failed");
            self.registry.reply(client, &e.reply(), &mut self.codec);
        }
    }

    fn execute(&mut self, client: SubscriberId, cmd: Command) -> Result<(), CommandError> {
        match cmd {
            Command::Control {
                target: Target::All,
                payload,
            } => {
                for device in self.devices.iter_mut() {
                    device.write_control(&payload)?;
                }
            }
            Command::Control {
                target: Target::Device(id),
                payload,
            } => {
                self.devices
                    .get_mut(&id)
                    .ok_or(CommandError::UnknownDevice)?
                    .write_control(&payload)?;
            }
            Command::DebugfsRead { device, file } => {
                self.require_device(&device)?;
                let raw = std::fs::read(self.devices.debugfs_path(&device, &file))?;
                let content = String::from_utf8_lossy(&raw);
                let content = content.strip_suffix('\n').unwrap_or(&content).replace('\n', ",");
                self.registry.reply(
                    client,
                    &format!("{device};0;debugfs;{file};{content}\n"),
                    &mut self.codec,
                );
            }
            Command::DebugfsWrite {
                device,
                file,
                value,
            } => {
                self.require_device(&device)?;
                std::fs::OpenOptions::new()
                    .write(true)
                    .open(self.devices.debugfs_path(&device, &file))?
                    .write_all(value.as_bytes())?;
            }
            Command::Monitor {
                device,
                file,
                port,
                compression,
            } => {
                self.require_device(&device)?;
                let dir = self.devices.paths().device_dir(&device);
                let session = self.sessions.start(&dir, &file, port, compression)?;
                self.registry.broadcast_formatted(
                    format_args!(
                        "{device};0;debugfs_monitor;{file};{:x};{:x}\n",
                        session.port,
                        u8::from(session.compressed)
                    ),
                    &mut self.codec,
                );
            }
        }
        Ok(())
    }

    fn require_device(&self, id: &str) -> Result<(), CommandError> {
        if self.devices.contains(id) {
            Ok(())
        } else {
            Err(CommandError::UnknownDevice)
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.registry.deadline(), self.sessions.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll_timers(&mut self, now: Instant) {
        self.registry.poll_expired(now, &mut self.codec);
        self.sessions.poll_expired(now, &mut self.codec);
    }

    pub fn shutdown(&mut self) {
        info!(
            subscribers = self.registry.len(),
            sessions = self.sessions.len(),
            "shutting down"
        );
        self.sessions.stop_all();
        self.registry.shutdown(&mut self.codec);
        self.devices.clear();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
