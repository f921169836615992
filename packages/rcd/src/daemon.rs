//! Listener setup and the top-level run loop.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use stream_codec::Codec;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DaemonConfig;
use crate::discovery;
use crate::hub::{Endpoint, Hub};
use crate::net;
use crate::subscriber::Mode;

/// Events buffered between I/O tasks and the hub.
const EVENT_QUEUE: usize = 1024;

pub struct Daemon {
    config: DaemonConfig,
    codec: Codec,
    listeners: Vec<(TcpListener, Mode)>,
}

impl Daemon {
    /// Load the dictionary and bind every primary listener.
    pub fn bind(config: DaemonConfig) -> Result<Self> {
        let level = config.compression.level;
        let codec = match &config.compression.dictionary {
            Some(path) => Codec::from_dictionary_file(path, level)
                .with_context(|| format!("cannot initialize compression from {}", path.display()))?,
            None => Codec::new(level, None).context("cannot initialize compression")?,
        };

        let mut listeners = Vec::new();
        for &host in &config.server.hosts {
            let mut ports = vec![(config.server.port, Mode::Plain)];
            if config.compression.enabled() {
                ports.push((config.server.compressed_port, Mode::Compressed));
            }
            for (port, mode) in ports {
                let addr = SocketAddr::new(host, port);
                let listener =
                    net::bind(addr).with_context(|| format!("cannot listen on {addr}"))?;
                info!(addr = %listener.local_addr()?, %mode, "listening");
                listeners.push((listener, mode));
            }
        }

        Ok(Self {
            config,
            codec,
            listeners,
        })
    }

    pub fn local_addrs(&self) -> Vec<(SocketAddr, Mode)> {
        self.listeners
            .iter()
            .filter_map(|(l, mode)| l.local_addr().ok().map(|a| (a, *mode)))
            .collect()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let tasks = shutdown.child_token();

        for (listener, mode) in self.listeners {
            net::spawn_listener(
                listener,
                Endpoint::Primary(mode),
                self.config.server.send_queue,
                tx.clone(),
                tasks.clone(),
            );
        }
        tokio::spawn(discovery::run(
            self.config.devices.paths.class_dir.clone(),
            self.config.devices.poll_interval,
            tx.clone(),
            tasks.clone(),
        ));

        let hub = Hub::new(&self.config, self.codec, tx);
        hub.run(rx, shutdown).await;
        tasks.cancel();
    }
}
