//! Device directory: the wireless PHYs currently exposed by the kernel.
//!
//! Each device lives under `<debugfs>/<id>/rc/` with four files:
//! `api_control` (commands in), `api_event` (events out), `api_info` and
//! `api_phy` (static description and station list).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::DropGuard;
use tracing::debug;

use crate::net;

/// Longest `drv`, `if` or `tpc` value kept from `api_phy`.
pub const MAX_PHY_FIELD: usize = 64;

#[derive(Debug, Clone)]
pub struct DevicePaths {
    pub class_dir: PathBuf,
    pub debugfs_dir: PathBuf,
}

impl DevicePaths {
    pub fn device_dir(&self, id: &str) -> PathBuf {
        self.debugfs_dir.join(id)
    }

    pub fn api_file(&self, id: &str, name: &str) -> PathBuf {
        self.device_dir(id).join("rc").join(name)
    }
}

/// Descriptor of one device as announced to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub driver: String,
    pub interfaces: String,
    pub tpc: String,
    pub stations: Vec<String>,
    pub api_info: Vec<String>,
}

impl DeviceRecord {
    pub fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }

    /// Read `api_phy` and `api_info` for `id`. Missing files leave the
    /// corresponding fields empty.
    pub fn load(paths: &DevicePaths, id: &str) -> Self {
        let mut record = Self::bare(id);

        match std::fs::read_to_string(paths.api_file(id, "api_phy")) {
            Ok(text) => record.parse_phy(&text),
            Err(e) => debug!(device = id, error = %e, "cannot read api_phy"),
        }

        if let Ok(text) = std::fs::read_to_string(paths.api_file(id, "api_info")) {
            record.api_info = text
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
        }

        record
    }

    fn parse_phy(&mut self, text: &str) {
        for line in text.lines() {
            let Some((key, value)) = line.split_once(';') else {
                continue;
            };
            match key {
                "drv" => self.driver = capped(value),
                "if" => self.interfaces = capped(value),
                "tpc" => self.tpc = capped(value),
                "sta" => self.stations.push(value.to_string()),
                _ => {}
            }
        }
    }

    /// `<id>;0;add;<drv>;<if>;<tpc>`
    pub fn add_line(&self) -> String {
        format!(
            "{};0;add;{};{};{}\n",
            self.id, self.driver, self.interfaces, self.tpc
        )
    }

    pub fn remove_line(id: &str) -> String {
        format!("{id};0;remove\n")
    }

    /// One `<id>;0;sta;add;...` line per associated station.
    pub fn station_lines(&self) -> String {
        self.stations
            .iter()
            .map(|sta| format!("{};0;sta;add;{}\n", self.id, sta))
            .collect()
    }

    /// API description lines, broadcast-addressed.
    pub fn preamble(&self) -> String {
        self.api_info
            .iter()
            .map(|line| format!("*;0;{line}\n"))
            .collect()
    }
}

fn capped(value: &str) -> String {
    let mut end = value.len().min(MAX_PHY_FIELD);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

pub struct Device {
    id: String,
    generation: u64,
    control: File,
    _reader: Option<DropGuard>,
}

impl Device {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write a raw command to the device's control file.
    pub fn write_control(&mut self, payload: &str) -> io::Result<()> {
        self.control.write_all(payload.as_bytes())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug)]
pub struct DeviceDirectory {
    paths: DevicePaths,
    devices: BTreeMap<String, Device>,
    next_generation: u64,
}

impl DeviceDirectory {
    pub fn new(paths: DevicePaths) -> Self {
        Self {
            paths,
            devices: BTreeMap::new(),
            next_generation: 1,
        }
    }

    pub fn paths(&self) -> &DevicePaths {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Whether `generation` is the live instance of `id`. Events from a
    /// removed and re-added device carry an older generation.
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.devices
            .get(id)
            .is_some_and(|d| d.generation == generation)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        self.devices.values_mut()
    }

    /// Open the control and event files of `id` and register it.
    ///
    /// Returns the new generation and the event stream for the caller to read.
    pub fn open(&mut self, id: &str) -> io::Result<(u64, File)> {
        let control = OpenOptions::new()
            .write(true)
            .open(self.paths.api_file(id, "api_control"))?;
        let events = net::open_nonblocking(&self.paths.api_file(id, "api_event"))?;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.devices.insert(
            id.to_string(),
            Device {
                id: id.to_string(),
                generation,
                control,
                _reader: None,
            },
        );
        Ok((generation, events))
    }

    /// Tie the lifetime of a reader task to the device entry.
    pub fn attach_reader(&mut self, id: &str, guard: DropGuard) {
        if let Some(dev) = self.devices.get_mut(id) {
            dev._reader = Some(guard);
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Device> {
        self.devices.remove(id)
    }

    /// Forget every device, stopping their readers.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn describe(&self, id: &str) -> Option<DeviceRecord> {
        self.devices
            .contains_key(id)
            .then(|| DeviceRecord::load(&self.paths, id))
    }

    /// Records for every known device, in identifier order.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.devices
            .keys()
            .map(|id| DeviceRecord::load(&self.paths, id))
            .collect()
    }

    /// Resolve a validated file name inside the device's debugfs directory.
    pub fn debugfs_path(&self, id: &str, file: &str) -> PathBuf {
        self.paths.device_dir(id).join(Path::new(file))
    }
}
