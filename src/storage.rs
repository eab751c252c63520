use std::{cell::RefCell, rc::Rc};

use dslab_core::Id;
use dslab_storage::disk::Disk;
use rustc_hash::FxHashMap;
use sugars::{rc, refcell};

use crate::{
    failure::{FailureCause, NetworkOperation},
    platform::IoRequest,
    workflow::FileId,
};

pub type StorageId = u32;

/// File store used by executors to stage, read, write and delete files.
pub trait StorageService {
    fn id(&self) -> StorageId;
    fn name(&self) -> &str;
    /// Network location, transfers to and from the storage start or end here.
    fn location(&self) -> Id;
    fn is_up(&self) -> bool;
    fn capacity(&self) -> u64;
    fn free_space(&self) -> u64;
    fn has_file(&self, file: FileId) -> bool;

    /// Checks that `file` can be read right now.
    fn check_read(&self, file: FileId, operation: NetworkOperation) -> Result<(), FailureCause>;
    /// Checks that `size` bytes of `file` can be written right now.
    fn check_write(&self, file: FileId, size: u64) -> Result<(), FailureCause>;

    /// Starts reading `size` bytes; the completion event is sent to `requester`.
    fn read(&mut self, size: u64, requester: Id) -> IoRequest;
    /// Starts writing `size` bytes; the completion event is sent to `requester`.
    fn write(&mut self, size: u64, requester: Id) -> IoRequest;
    /// Registers `file` whose bytes were written by a completed `write`.
    fn commit_file(&mut self, file: FileId, size: u64) -> Result<(), FailureCause>;
    /// Frees the space taken by a `write` that will not be committed.
    fn discard_write(&mut self, size: u64) -> Result<(), FailureCause>;

    /// Places `file` on the storage without simulating any I/O.
    fn store_file(&mut self, file: FileId, size: u64) -> Result<(), FailureCause>;
    fn delete_file(&mut self, file: FileId) -> Result<(), FailureCause>;

    fn start(&mut self);
    fn stop(&mut self);
    /// Makes every transfer involving this storage fail with a network error.
    fn set_link_failure(&mut self, failed: bool);
}

struct StoredFile {
    size: u64,
    /// The bytes went through the disk, which keeps them accounted.
    written: bool,
}

/// Storage service on top of a single dslab disk.
pub struct SimpleStorageService {
    id: StorageId,
    name: String,
    disk: Rc<RefCell<Disk>>,
    disk_id: Id,
    files: FxHashMap<FileId, StoredFile>,
    /// Bytes of files placed without any disk I/O.
    staged: u64,
    up: bool,
    link_failed: bool,
}

impl SimpleStorageService {
    pub fn new(id: StorageId, name: &str, disk: Rc<RefCell<Disk>>, disk_id: Id) -> Self {
        SimpleStorageService {
            id,
            name: name.to_string(),
            disk,
            disk_id,
            files: FxHashMap::default(),
            staged: 0,
            up: true,
            link_failed: false,
        }
    }

    fn check_reachable(&self, operation: NetworkOperation) -> Result<(), FailureCause> {
        if !self.up {
            return Err(FailureCause::service_down_storage(self.id));
        }
        if self.link_failed {
            return Err(FailureCause::NetworkError {
                operation,
                mailbox: self.name.clone(),
            });
        }
        Ok(())
    }

    fn put(&mut self, file: FileId, stored: StoredFile) -> Result<(), FailureCause> {
        if !stored.written {
            self.staged += stored.size;
        }
        match self.files.insert(file, stored) {
            Some(old) => self.release(old),
            None => Ok(()),
        }
    }

    fn release(&mut self, stored: StoredFile) -> Result<(), FailureCause> {
        if !stored.written {
            self.staged -= stored.size;
            return Ok(());
        }
        self.disk
            .borrow_mut()
            .mark_free(stored.size)
            .map_err(|_| FailureCause::FatalFailure)
    }
}

impl StorageService for SimpleStorageService {
    fn id(&self) -> StorageId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> Id {
        self.disk_id
    }

    fn is_up(&self) -> bool {
        self.up
    }

    fn capacity(&self) -> u64 {
        self.disk.borrow().get_capacity()
    }

    /// Writes still in progress already hold their space.
    fn free_space(&self) -> u64 {
        self.disk.borrow().get_free_space().saturating_sub(self.staged)
    }

    fn has_file(&self, file: FileId) -> bool {
        self.files.contains_key(&file)
    }

    fn check_read(&self, file: FileId, operation: NetworkOperation) -> Result<(), FailureCause> {
        self.check_reachable(operation)?;
        if !self.has_file(file) {
            return Err(FailureCause::FileNotFound {
                file,
                storage: self.id,
            });
        }
        Ok(())
    }

    fn check_write(&self, file: FileId, size: u64) -> Result<(), FailureCause> {
        self.check_reachable(NetworkOperation::Sending)?;
        let reclaimed = self.files.get(&file).map_or(0, |f| f.size);
        if size > self.free_space() + reclaimed {
            return Err(FailureCause::StorageNotEnoughSpace {
                file,
                storage: self.id,
            });
        }
        Ok(())
    }

    fn read(&mut self, size: u64, requester: Id) -> IoRequest {
        let id = self.disk.borrow_mut().read(size, requester);
        IoRequest {
            component: self.disk_id,
            id,
        }
    }

    fn write(&mut self, size: u64, requester: Id) -> IoRequest {
        let id = self.disk.borrow_mut().write(size, requester);
        IoRequest {
            component: self.disk_id,
            id,
        }
    }

    fn commit_file(&mut self, file: FileId, size: u64) -> Result<(), FailureCause> {
        self.put(file, StoredFile { size, written: true })
    }

    fn discard_write(&mut self, size: u64) -> Result<(), FailureCause> {
        self.disk
            .borrow_mut()
            .mark_free(size)
            .map_err(|_| FailureCause::FatalFailure)
    }

    fn store_file(&mut self, file: FileId, size: u64) -> Result<(), FailureCause> {
        self.check_write(file, size)?;
        self.put(file, StoredFile { size, written: false })
    }

    fn delete_file(&mut self, file: FileId) -> Result<(), FailureCause> {
        self.check_reachable(NetworkOperation::Sending)?;
        match self.files.remove(&file) {
            Some(stored) => self.release(stored),
            None => Err(FailureCause::FileNotFound {
                file,
                storage: self.id,
            }),
        }
    }

    fn start(&mut self) {
        self.up = true;
    }

    fn stop(&mut self) {
        self.up = false;
    }

    fn set_link_failure(&mut self, failed: bool) {
        self.link_failed = failed;
    }
}

/// Owns every storage service of a platform and hands out their ids.
#[derive(Default)]
pub struct StorageRegistry {
    storages: Vec<Rc<RefCell<dyn StorageService>>>,
    names: FxHashMap<String, StorageId>,
    locations: FxHashMap<Id, StorageId>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<S, F>(&mut self, build: F) -> StorageId
    where
        S: StorageService + 'static,
        F: FnOnce(StorageId) -> S,
    {
        let id = self.storages.len() as StorageId;
        let storage = build(id);
        self.names.insert(storage.name().to_string(), id);
        self.locations.insert(storage.location(), id);
        self.storages.push(rc!(refcell!(storage)));
        id
    }

    pub fn get(&self, id: StorageId) -> Option<Rc<RefCell<dyn StorageService>>> {
        self.storages.get(id as usize).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<StorageId> {
        self.names.get(name).copied()
    }

    /// Storage whose network location is `location`.
    pub fn by_location(&self, location: Id) -> Option<Rc<RefCell<dyn StorageService>>> {
        self.locations.get(&location).and_then(|id| self.get(*id))
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    pub(crate) fn lookup(&self, id: StorageId) -> Result<Rc<RefCell<dyn StorageService>>, FailureCause> {
        self.get(id).ok_or(FailureCause::FatalFailure)
    }
}

#[cfg(test)]
mod tests {
    use dslab_core::Simulation;
    use dslab_storage::disk::DiskBuilder;

    use super::*;

    fn storage(sim: &mut Simulation, id: StorageId, capacity: u64) -> SimpleStorageService {
        let name = format!("disk-{}", id);
        let ctx = sim.create_context(&name);
        let disk_id = ctx.id();
        let disk = rc!(refcell!(DiskBuilder::simple(capacity, 10., 10.).build(ctx)));
        sim.add_handler(&name, disk.clone());
        SimpleStorageService::new(id, "disk", disk, disk_id)
    }

    #[test]
    fn space_is_accounted_on_store_and_delete() {
        let mut sim = Simulation::new(1);
        let mut storage = storage(&mut sim, 0, 100);
        storage.store_file(1, 60).unwrap();
        assert_eq!(storage.free_space(), 40);
        assert_eq!(
            storage.store_file(2, 50),
            Err(FailureCause::StorageNotEnoughSpace {
                file: 2,
                storage: 0
            })
        );
        storage.store_file(1, 90).unwrap();
        assert_eq!(storage.free_space(), 10);
        assert_eq!(storage.disk.borrow().get_used_space(), 0);
        storage.delete_file(1).unwrap();
        assert_eq!(storage.free_space(), 100);
    }

    #[test]
    fn unreachable_storage_reports_cause() {
        let mut sim = Simulation::new(1);
        let mut storage = storage(&mut sim, 4, 100);
        storage.stop();
        assert_eq!(
            storage.check_read(0, NetworkOperation::Receiving),
            Err(FailureCause::service_down_storage(4))
        );
        storage.start();
        storage.set_link_failure(true);
        assert!(matches!(
            storage.check_read(0, NetworkOperation::Receiving),
            Err(FailureCause::NetworkError { .. })
        ));
    }

    #[test]
    fn written_files_give_their_disk_space_back() {
        let mut sim = Simulation::new(1);
        let mut storage = storage(&mut sim, 0, 100);
        let requester = sim.create_context("client").id();
        // the disk reserves the bytes as soon as the write is issued
        storage.write(70, requester);
        assert_eq!(storage.free_space(), 30);
        storage.commit_file(3, 70).unwrap();
        assert_eq!(storage.free_space(), 30);
        assert_eq!(storage.disk.borrow().get_used_space(), 70);

        storage.delete_file(3).unwrap();
        assert_eq!(storage.free_space(), 100);
        assert_eq!(storage.disk.borrow().get_used_space(), 0);
    }
}
