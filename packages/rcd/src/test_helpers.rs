use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use stream_codec::Codec;

use crate::config::{CompressionConfig, DaemonConfig, DevicesConfig, MonitorConfig, ServerConfig};
use crate::device::DevicePaths;
use crate::subscriber::Transport;

/// Raw-content dictionary shared by encoder and decoder in tests.
pub const DICT: &[u8] =
    b"phy0;0;add;mt76;wlan0;0\nphy0;0;sta;add;\nphy0;tx_status;ok\n*;0;#error;Syntax error\n";

pub fn codec() -> Codec {
    Codec::new(3, Some(DICT)).expect("codec")
}

pub fn decompress(frame: &[u8]) -> Vec<u8> {
    zstd::bulk::Decompressor::with_dictionary(DICT)
        .expect("decompressor")
        .decompress(frame, 1 << 20)
        .expect("valid frame")
}

/// Decode each frame and concatenate the text.
pub fn decompress_all(frames: &[Vec<u8>]) -> String {
    frames
        .iter()
        .map(|f| String::from_utf8_lossy(&decompress(f)).into_owned())
        .collect()
}

/// Decode a byte stream of back-to-back frames. `None` while the last
/// frame is still incomplete.
pub fn decode_stream(data: &[u8]) -> Option<String> {
    let mut decoder = zstd::stream::read::Decoder::with_dictionary(data, DICT).ok()?;
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(String::from_utf8_lossy(&out).into_owned())
}

#[derive(Default)]
struct Recorded {
    frames: Vec<Vec<u8>>,
    fail: bool,
}

/// Transport that records what it was sent. Clones share one record, so a
/// test can keep a handle after giving one to a subscriber.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send fail.
    pub fn fail(&self) {
        self.inner.lock().unwrap().fail = true;
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().frames.clone()
    }

    pub fn text(&self) -> String {
        self.frames()
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    /// True once every other handle, including the subscriber's, is gone.
    pub fn is_dropped(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, data: Bytes) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        inner.frames.push(data.to_vec());
        Ok(())
    }

    fn peer(&self) -> String {
        "test".to_string()
    }
}

/// Temporary sysfs/debugfs lookalike.
///
/// ```text
/// <root>/class/<id>/
/// <root>/debug/<id>/rc/{api_control,api_event,api_info,api_phy}
/// <root>/debug/<id>/<debugfs files>
/// ```
pub struct FakeDevices {
    dir: tempfile::TempDir,
}

impl FakeDevices {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("class")).unwrap();
        std::fs::create_dir_all(dir.path().join("debug")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> DevicePaths {
        DevicePaths {
            class_dir: self.dir.path().join("class"),
            debugfs_dir: self.dir.path().join("debug"),
        }
    }

    fn rc(&self, id: &str) -> PathBuf {
        self.paths().device_dir(id).join("rc")
    }

    /// Create the debugfs side of a device.
    pub fn add(&self, id: &str, api_phy: &str) {
        let rc = self.rc(id);
        std::fs::create_dir_all(&rc).unwrap();
        std::fs::write(rc.join("api_control"), "").unwrap();
        std::fs::write(rc.join("api_event"), "").unwrap();
        std::fs::write(rc.join("api_info"), "").unwrap();
        std::fs::write(rc.join("api_phy"), api_phy).unwrap();
    }

    /// Make the device visible to discovery.
    pub fn plug(&self, id: &str) {
        std::fs::create_dir_all(self.paths().class_dir.join(id)).unwrap();
    }

    pub fn set_api_info(&self, id: &str, text: &str) {
        std::fs::write(self.rc(id).join("api_info"), text).unwrap();
    }

    pub fn set_events(&self, id: &str, text: &str) {
        std::fs::write(self.rc(id).join("api_event"), text).unwrap();
    }

    pub fn control(&self, id: &str) -> String {
        std::fs::read_to_string(self.rc(id).join("api_control")).unwrap()
    }

    pub fn write_debugfs(&self, id: &str, file: &str, text: &str) {
        std::fs::write(self.paths().device_dir(id).join(file), text).unwrap();
    }

    pub fn read_debugfs(&self, id: &str, file: &str) -> String {
        std::fs::read_to_string(self.paths().device_dir(id).join(file)).unwrap()
    }
}

/// Loopback-only config rooted in `tree`, with a dictionary and short timers.
pub fn test_config(tree: &FakeDevices) -> DaemonConfig {
    let dictionary = tree.root().join("dictionary.zdict");
    std::fs::write(&dictionary, DICT).unwrap();

    DaemonConfig {
        server: ServerConfig {
            hosts: vec!["127.0.0.1".parse().unwrap()],
            port: 0,
            compressed_port: 0,
            send_queue: 64,
        },
        compression: CompressionConfig {
            dictionary: Some(dictionary),
            level: 3,
            buffer_size: 4096,
            timeout: Duration::from_millis(20),
        },
        devices: DevicesConfig {
            paths: tree.paths(),
            poll_interval: Duration::from_millis(20),
        },
        monitor: MonitorConfig {
            bind: "127.0.0.1".parse().unwrap(),
        },
    }
}
