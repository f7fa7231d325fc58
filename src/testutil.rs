//! In-memory test doubles for the external collaborators named in spec §1:
//! the index/database, the block finder it hosts, and the network layer.
//! Everything lives behind a `Mutex`/`RwLock` so tests can drive the core
//! without touching real infrastructure.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::activity::DeviceId;
use crate::error::{Result, SyncError};
use crate::index::{FolderState, Finder, Index, Network};
use crate::model::FileRecord;

#[derive(Debug, Default)]
struct FolderData {
    /// What the local device needs, in the order it should be visited.
    need: Vec<FileRecord>,
    local: HashMap<String, FileRecord>,
    global: HashMap<String, FileRecord>,
    availability: HashMap<String, Vec<DeviceId>>,
    state: FolderState,
    remote_local_version: i64,
    invalidated: Option<String>,
}

/// An in-memory `Index` double. Tests seed `need`/`global`/`availability` up
/// front and assert on `local` and `received` afterward.
#[derive(Default)]
pub struct MockIndex {
    folders: Mutex<HashMap<String, FolderData>>,
    received: Mutex<Vec<(String, String)>>,
}

impl MockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_folder<T>(&self, folder: &str, f: impl FnOnce(&mut FolderData) -> T) -> T {
        let mut folders = self.folders.lock().unwrap();
        f(folders.entry(folder.to_string()).or_default())
    }

    /// Seeds one entry of the local device's need set, in call order.
    pub fn push_need(&self, folder: &str, file: FileRecord) {
        self.with_folder(folder, |f| f.need.push(file));
    }

    pub fn set_global(&self, folder: &str, file: FileRecord) {
        self.with_folder(folder, |f| f.global.insert(file.name.clone(), file));
    }

    pub fn set_local(&self, folder: &str, file: FileRecord) {
        self.with_folder(folder, |f| f.local.insert(file.name.clone(), file));
    }

    pub fn set_availability(&self, folder: &str, name: &str, devices: Vec<DeviceId>) {
        self.with_folder(folder, |f| {
            f.availability.insert(name.to_string(), devices);
        });
    }

    pub fn set_remote_local_version(&self, folder: &str, version: i64) {
        self.with_folder(folder, |f| f.remote_local_version = version);
    }

    pub fn state(&self, folder: &str) -> FolderState {
        self.with_folder(folder, |f| f.state)
    }

    pub fn local_file(&self, folder: &str, name: &str) -> Option<FileRecord> {
        self.with_folder(folder, |f| f.local.get(name).cloned())
    }

    pub fn received(&self) -> Vec<(String, String)> {
        self.received.lock().unwrap().clone()
    }

    pub fn invalidated_reason(&self, folder: &str) -> Option<String> {
        self.with_folder(folder, |f| f.invalidated.clone())
    }
}

impl Index for MockIndex {
    fn with_need(&self, _local_device: DeviceId, visit: &mut dyn FnMut(&FileRecord) -> bool) {
        let folders = self.folders.lock().unwrap();
        for data in folders.values() {
            for file in &data.need {
                if !visit(file) {
                    return;
                }
            }
        }
    }

    fn current_folder_file(&self, folder: &str, name: &str) -> Option<FileRecord> {
        self.with_folder(folder, |f| f.local.get(name).cloned())
    }

    fn current_global_file(&self, folder: &str, name: &str) -> Option<FileRecord> {
        self.with_folder(folder, |f| f.global.get(name).cloned())
    }

    fn availability(&self, folder: &str, name: &str) -> Vec<DeviceId> {
        self.with_folder(folder, |f| f.availability.get(name).cloned().unwrap_or_default())
    }

    fn update_local(&self, folder: &str, file: FileRecord) {
        self.with_folder(folder, |f| {
            f.local.insert(file.name.clone(), file);
        });
    }

    fn received_file(&self, folder: &str, name: &str) {
        self.received.lock().unwrap().push((folder.to_string(), name.to_string()));
    }

    fn set_state(&self, folder: &str, state: FolderState) {
        self.with_folder(folder, |f| f.state = state);
    }

    fn invalidate_folder(&self, folder: &str, reason: &str) {
        self.with_folder(folder, |f| f.invalidated = Some(reason.to_string()));
    }

    fn scan_folder(&self, _folder: &str) -> Result<()> {
        Ok(())
    }

    fn remote_local_version(&self, folder: &str) -> i64 {
        self.with_folder(folder, |f| f.remote_local_version)
    }
}

/// An in-memory `Finder` double: a plain map from block hash to candidate
/// locations, in insertion order.
#[derive(Default)]
pub struct MockFinder {
    candidates: RwLock<HashMap<[u8; 32], Vec<(String, String, usize)>>>,
    fixes: Mutex<Vec<(String, String, usize)>>,
}

impl MockFinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_candidate(&self, hash: [u8; 32], folder: &str, file: &str, index: usize) {
        self.candidates
            .write()
            .unwrap()
            .entry(hash)
            .or_default()
            .push((folder.to_string(), file.to_string(), index));
    }

    pub fn fixes(&self) -> Vec<(String, String, usize)> {
        self.fixes.lock().unwrap().clone()
    }
}

impl Finder for MockFinder {
    fn iterate(&self, hash: &[u8; 32], visit: &mut dyn FnMut(&str, &str, usize) -> bool) {
        let candidates = self.candidates.read().unwrap();
        if let Some(list) = candidates.get(hash) {
            for (folder, file, index) in list {
                if visit(folder, file, *index) {
                    return;
                }
            }
        }
    }

    fn fix(&self, folder: &str, file: &str, index: usize, _expected: &[u8; 32], _observed: &[u8; 32]) {
        self.fixes.lock().unwrap().push((folder.to_string(), file.to_string(), index));
    }
}

/// An in-memory `Network` double serving precomputed block bytes, keyed by
/// `(device, folder, name, offset)`; tests can also configure per-device
/// failures.
#[derive(Default)]
pub struct MockNetwork {
    blocks: Mutex<HashMap<(DeviceId, String, String, u64), Vec<u8>>>,
    failing_devices: Mutex<Vec<DeviceId>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block(&self, device: DeviceId, folder: &str, name: &str, offset: u64, data: Vec<u8>) {
        self.blocks
            .lock()
            .unwrap()
            .insert((device, folder.to_string(), name.to_string(), offset), data);
    }

    pub fn fail_device(&self, device: DeviceId) {
        self.failing_devices.lock().unwrap().push(device);
    }
}

impl Network for MockNetwork {
    fn request_global(
        &self,
        device: DeviceId,
        folder: &str,
        name: &str,
        offset: u64,
        _size: u32,
        _hash: &[u8; 32],
    ) -> Result<Vec<u8>> {
        if self.failing_devices.lock().unwrap().contains(&device) {
            return Err(SyncError::Other(format!("device {device} unreachable")));
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&(device, folder.to_string(), name.to_string(), offset))
            .cloned()
            .ok_or_else(|| SyncError::Other("no such block".to_string()))
    }
}

/// Reads a whole file into memory; a small helper for assembling expected
/// content in end-to-end tests.
pub fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_default()
}

pub fn write_file(path: &Path, data: &[u8]) {
    std::fs::write(path, data).unwrap();
}

pub fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Flags, Version};

    fn file(name: &str) -> FileRecord {
        FileRecord {
            name: name.into(),
            flags: Flags::new(0o644),
            modified: 0,
            version: Version::default(),
            blocks: vec![],
        }
    }

    #[test]
    fn mock_index_round_trips_local_updates() {
        let index = MockIndex::new();
        index.update_local("f", file("a"));
        assert_eq!(index.current_folder_file("f", "a").unwrap().name, "a");
    }

    #[test]
    fn mock_finder_stops_at_first_accepted_candidate() {
        let finder = MockFinder::new();
        finder.add_candidate([1; 32], "f", "x", 0);
        finder.add_candidate([1; 32], "f", "y", 0);
        let mut seen = Vec::new();
        finder.iterate(&[1; 32], &mut |folder, file, idx| {
            seen.push((folder.to_string(), file.to_string(), idx));
            true
        });
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "x");
    }

    #[test]
    fn mock_network_serves_configured_block() {
        let net = MockNetwork::new();
        net.set_block(1, "f", "a", 0, b"hello".to_vec());
        let data = net.request_global(1, "f", "a", 0, 5, &[0; 32]).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn mock_network_fails_configured_device() {
        let net = MockNetwork::new();
        net.fail_device(2);
        assert!(net.request_global(2, "f", "a", 0, 5, &[0; 32]).is_err());
    }
}
