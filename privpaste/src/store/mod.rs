//! Store engine: items on disk and their lifecycle.
//!
//! Each item lives in two files below the store root: `<id>` holds the
//! content and `<id>.meta` holds the serialized [`Item`].  The metadata
//! file is only written when an upload is committed, so content without
//! metadata is an incomplete upload and is removed when the store is
//! opened.  Ids and owner tokens are checked for their exact format
//! before they are used, so a peer-provided string never becomes an
//! arbitrary path component.
//!
//! The in-memory index is guarded by a read-write lock that is only held
//! for map lookups and updates; all file I/O happens outside of it.

pub mod child;
pub mod token;

use crate::{
    error::Error,
    rpc::{ItemInfo, StoreError},
};
use parking_lot::RwLock;
use privpaste_log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{self, BufReader},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use token::{ID_LENGTH, OWNER_LENGTH};

const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".meta.tmp";

/// Engine limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of an item in bytes.
    pub max_size: u64,
    /// Maximum requested lifetime.
    pub max_lifetime: Duration,
    /// Maximum number of live items, including pending uploads.
    pub max_items: usize,
    /// Time after which an upload that was not committed is reaped.
    pub upload_timeout: Duration,
}

/// A stored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub owner: String,
    pub mime: String,
    pub size: u64,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl Item {
    pub fn info(&self) -> ItemInfo {
        ItemInfo {
            mime: self.mime.clone(),
            size: self.size,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Content is still being written.
    Pending { deadline: SystemTime },
    Committed,
}

#[derive(Debug)]
struct Slot {
    item: Item,
    state: State,
}

impl Slot {
    fn is_stale(&self, now: SystemTime) -> bool {
        match self.state {
            State::Pending { deadline } => now >= deadline,
            State::Committed => self.item.is_expired(now),
        }
    }
}

#[derive(Debug, Default)]
struct Index {
    items: HashMap<String, Slot>,
    owners: HashSet<String>,
}

impl Index {
    fn insert(&mut self, slot: Slot) {
        self.owners.insert(slot.item.owner.clone());
        self.items.insert(slot.item.id.clone(), slot);
    }

    fn remove(&mut self, id: &str) -> Option<Slot> {
        let slot = self.items.remove(id)?;
        self.owners.remove(&slot.item.owner);
        Some(slot)
    }
}

/// The store engine.
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    limits: Limits,
    index: RwLock<Index>,
}

impl Store {
    /// Open the store, reload committed items and clean up the rest.
    pub fn open<P: Into<PathBuf>>(root: P, limits: Limits) -> Result<Self, Error> {
        let root = root.into();
        let now = SystemTime::now();
        let mut index = Index::default();
        let mut content = vec![];
        let mut removed = 0usize;

        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };

            if name.ends_with(TMP_SUFFIX) {
                remove_file(&entry.path());
            } else if let Some(id) = name.strip_suffix(META_SUFFIX) {
                if !token::is_valid(id, ID_LENGTH) {
                    continue;
                }
                match read_meta(&entry.path()) {
                    Ok(item)
                        if item.id == id
                            && !item.is_expired(now)
                            && root.join(id).is_file() =>
                    {
                        index.insert(Slot {
                            item,
                            state: State::Committed,
                        });
                    }
                    Ok(_) => {
                        remove_file(&entry.path());
                        removed += 1;
                    }
                    Err(err) => {
                        warn!("invalid metadata"; "id" => id, "error" => %err);
                        remove_file(&entry.path());
                        removed += 1;
                    }
                }
            } else if token::is_valid(&name, ID_LENGTH) {
                content.push(name.clone());
            }
        }

        for id in content {
            if !index.items.contains_key(&id) {
                remove_file(&root.join(&id));
            }
        }

        info!("store opened";
            "root" => %root.display(),
            "items" => index.items.len(),
            "removed" => removed);

        Ok(Self {
            root,
            limits,
            index: RwLock::new(index),
        })
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Number of live items, including pending uploads.
    pub fn len(&self) -> usize {
        self.index.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate a new item and return its writable content file.
    ///
    /// The declared size is checked here and the actual size is checked
    /// again by [`Store::commit`].
    pub fn create(
        &self,
        size: u64,
        mime: &str,
        lifetime: Duration,
    ) -> Result<(Item, File), Error> {
        let now = SystemTime::now();

        if size > self.limits.max_size {
            return Err(StoreError::SizeExceeded.into());
        }
        if lifetime.is_zero() || lifetime > self.limits.max_lifetime {
            return Err(StoreError::InvalidLifetime.into());
        }
        let expires_at = now
            .checked_add(lifetime)
            .ok_or(StoreError::InvalidLifetime)?;
        let deadline = now
            .checked_add(self.limits.upload_timeout)
            .unwrap_or(expires_at);

        let item = {
            let mut index = self.index.write();
            if index.items.len() >= self.limits.max_items {
                return Err(StoreError::QuotaExceeded.into());
            }

            let id = loop {
                let id = token::generate(ID_LENGTH);
                if !index.items.contains_key(&id) {
                    break id;
                }
            };
            let owner = loop {
                let owner = token::generate(OWNER_LENGTH);
                if !index.owners.contains(&owner) {
                    break owner;
                }
            };

            let item = Item {
                id,
                owner,
                mime: mime.to_string(),
                size,
                created_at: now,
                expires_at,
            };
            index.insert(Slot {
                item: item.clone(),
                state: State::Pending { deadline },
            });
            item
        };

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(self.content_path(&item.id));
        match file {
            Ok(file) => {
                debug!("item created"; "id" => &item.id, "size" => size);
                Ok((item, file))
            }
            Err(err) => {
                self.index.write().remove(&item.id);
                Err(err.into())
            }
        }
    }

    /// Return a committed item and its read-only content file.
    pub fn fetch(&self, id: &str) -> Result<(Item, File), Error> {
        self.fetch_at(id, SystemTime::now())
    }

    pub(crate) fn fetch_at(&self, id: &str, now: SystemTime) -> Result<(Item, File), Error> {
        if !token::is_valid(id, ID_LENGTH) {
            return Err(StoreError::NotFound.into());
        }

        // Expired and unknown items are indistinguishable.
        let item = match self.index.read().items.get(id) {
            Some(Slot {
                item,
                state: State::Committed,
            }) if !item.is_expired(now) => item.clone(),
            _ => return Err(StoreError::NotFound.into()),
        };

        let file = File::open(self.content_path(id)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::Store(StoreError::NotFound)
            } else {
                err.into()
            }
        })?;

        Ok((item, file))
    }

    /// Remove a committed item if `owner` matches its owner token.
    pub fn delete(&self, id: &str, owner: &str) -> Result<(), Error> {
        check_tokens(id, owner)?;
        let now = SystemTime::now();

        {
            let mut index = self.index.write();
            let slot = match index.items.get(id) {
                Some(slot) if slot.state == State::Committed && !slot.item.is_expired(now) => slot,
                _ => return Err(StoreError::NotFound.into()),
            };
            if !token::ct_eq(&slot.item.owner, owner) {
                return Err(StoreError::Forbidden.into());
            }
            index.remove(id);
        }

        self.unlink(id);
        debug!("item deleted"; "id" => id);

        Ok(())
    }

    /// Make a pending upload readable and return its final size.
    ///
    /// The caller must have closed its writable descriptor.
    pub fn commit(&self, id: &str, owner: &str) -> Result<u64, Error> {
        let item = self.pending(id, owner)?;

        let file = File::open(self.content_path(id))?;
        let size = file.metadata()?.len();
        if size > self.limits.max_size {
            self.index.write().remove(id);
            self.unlink(id);
            return Err(StoreError::SizeExceeded.into());
        }
        file.sync_all()?;

        let item = Item { size, ..item };
        self.write_meta(&item)?;

        let found = {
            let mut index = self.index.write();
            match index.items.get_mut(id) {
                Some(slot) => {
                    slot.item.size = size;
                    slot.state = State::Committed;
                    true
                }
                None => false,
            }
        };
        if !found {
            // Aborted or reaped while we were syncing.
            self.unlink(id);
            return Err(StoreError::NotFound.into());
        }

        debug!("item committed"; "id" => id, "size" => size);

        Ok(size)
    }

    /// Discard a pending upload.
    pub fn abort(&self, id: &str, owner: &str) -> Result<(), Error> {
        self.pending(id, owner)?;
        if self.index.write().remove(id).is_some() {
            self.unlink(id);
            debug!("item aborted"; "id" => id);
        }
        Ok(())
    }

    /// Remove expired items and stale uploads.
    pub fn reap(&self) -> usize {
        self.reap_at(SystemTime::now())
    }

    pub(crate) fn reap_at(&self, now: SystemTime) -> usize {
        // Snapshot first; every removal takes the write lock only briefly.
        let stale = self
            .index
            .read()
            .items
            .iter()
            .filter(|(_, slot)| slot.is_stale(now))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        let mut count = 0;
        for id in stale {
            let removed = {
                let mut index = self.index.write();
                let is_stale = index
                    .items
                    .get(&id)
                    .map_or(false, |slot| slot.is_stale(now));
                is_stale && index.remove(&id).is_some()
            };
            if removed {
                self.unlink(&id);
                count += 1;
            }
        }

        if count > 0 {
            info!("reaped items"; "count" => count);
        }

        count
    }

    fn pending(&self, id: &str, owner: &str) -> Result<Item, Error> {
        check_tokens(id, owner)?;
        let index = self.index.read();
        let slot = index.items.get(id).ok_or(StoreError::NotFound)?;
        if !token::ct_eq(&slot.item.owner, owner) {
            return Err(StoreError::Forbidden.into());
        }
        match slot.state {
            State::Pending { .. } => Ok(slot.item.clone()),
            State::Committed => Err(StoreError::NotFound.into()),
        }
    }

    fn write_meta(&self, item: &Item) -> Result<(), Error> {
        let tmp = self.root.join(format!("{}{}", item.id, TMP_SUFFIX));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        bincode::serialize_into(&mut file, item)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, self.meta_path(&item.id))?;
        File::open(&self.root)?.sync_all()?;

        Ok(())
    }

    /// Remove both files of an item; metadata goes first.
    fn unlink(&self, id: &str) {
        remove_file(&self.meta_path(id));
        remove_file(&self.content_path(id));
    }

    fn content_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}{}", id, META_SUFFIX))
    }
}

fn check_tokens(id: &str, owner: &str) -> Result<(), Error> {
    if token::is_valid(id, ID_LENGTH) && token::is_valid(owner, OWNER_LENGTH) {
        Ok(())
    } else {
        Err(StoreError::NotFound.into())
    }
}

fn read_meta(path: &Path) -> io::Result<Item> {
    let file = BufReader::new(File::open(path)?);
    bincode::deserialize_from(file).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn remove_file(path: &Path) {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            warn!("failed to remove file"; "path" => %path.display(), "error" => %err);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fmt::Debug, io::Read, io::Write, sync::Arc, thread};

    const HOUR: Duration = Duration::from_secs(3600);

    fn limits() -> Limits {
        Limits {
            max_size: 1024,
            max_lifetime: HOUR,
            max_items: 20_000,
            upload_timeout: Duration::from_secs(60),
        }
    }

    fn store_error<T: Debug>(result: Result<T, Error>) -> StoreError {
        match result {
            Err(Error::Store(err)) => err,
            other => panic!("expected store error, got {:?}", other),
        }
    }

    fn upload(store: &Store, data: &[u8], lifetime: Duration) -> Item {
        let (item, mut file) = store
            .create(data.len() as u64, "text/plain", lifetime)
            .unwrap();
        file.write_all(data).unwrap();
        drop(file);
        assert_eq!(store.commit(&item.id, &item.owner).unwrap(), data.len() as u64);
        item
    }

    fn files(root: &Path) -> usize {
        fs::read_dir(root).unwrap().count()
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();

        let item = upload(&store, b"hello world", HOUR / 2);
        assert_eq!(item.expires_at, item.created_at + HOUR / 2);
        assert_ne!(item.id, item.owner);

        let (fetched, mut file) = store.fetch(&item.id).unwrap();
        assert_eq!(fetched.mime, "text/plain");
        assert_eq!(fetched.size, 11);
        assert_eq!(fetched.expires_at, item.expires_at);

        let mut content = vec![];
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[test]
    fn test_pending_is_not_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();

        let (item, _file) = store.create(5, "text/plain", HOUR).unwrap();
        assert_eq!(store_error(store.fetch(&item.id)), StoreError::NotFound);
    }

    #[test]
    fn test_boundary_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();

        assert_eq!(
            store_error(store.create(2000, "text/plain", HOUR)),
            StoreError::SizeExceeded
        );
        assert_eq!(
            store_error(store.create(10, "text/plain", HOUR * 2)),
            StoreError::InvalidLifetime
        );
        assert_eq!(
            store_error(store.create(10, "text/plain", Duration::ZERO)),
            StoreError::InvalidLifetime
        );
        assert_eq!(files(dir.path()), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_oversized_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();

        let (item, mut file) = store.create(10, "text/plain", HOUR).unwrap();
        file.write_all(&[0u8; 2000]).unwrap();
        drop(file);

        assert_eq!(
            store_error(store.commit(&item.id, &item.owner)),
            StoreError::SizeExceeded
        );
        assert_eq!(files(dir.path()), 0);
        assert_eq!(store_error(store.fetch(&item.id)), StoreError::NotFound);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();
        let item = upload(&store, b"secret", HOUR);
        let wrong = token::generate(OWNER_LENGTH);

        assert_eq!(
            store_error(store.delete(&item.id, &wrong)),
            StoreError::Forbidden
        );
        assert!(store.fetch(&item.id).is_ok());

        store.delete(&item.id, &item.owner).unwrap();
        assert_eq!(store_error(store.fetch(&item.id)), StoreError::NotFound);
        assert_eq!(
            store_error(store.delete(&item.id, &item.owner)),
            StoreError::NotFound
        );
        assert_eq!(files(dir.path()), 0);
    }

    #[test]
    fn test_invalid_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();
        let item = upload(&store, b"x", HOUR);

        assert_eq!(store_error(store.fetch("../etc/passwd")), StoreError::NotFound);
        assert_eq!(
            store_error(store.delete(&item.id, "short")),
            StoreError::NotFound
        );
        assert!(store.fetch(&item.id).is_ok());
    }

    #[test]
    fn test_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();
        let item = upload(&store, b"expiring", Duration::from_secs(1));

        assert!(store.fetch_at(&item.id, item.created_at).is_ok());
        assert_eq!(
            store_error(store.fetch_at(&item.id, item.expires_at)),
            StoreError::NotFound
        );
        assert_eq!(files(dir.path()), 2);

        assert_eq!(store.reap_at(item.created_at), 0);
        assert_eq!(store.reap_at(item.expires_at), 1);
        assert_eq!(files(dir.path()), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_upload_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();

        let (item, file) = store.create(10, "text/plain", HOUR).unwrap();
        drop(file);
        assert_eq!(store.reap_at(item.created_at), 0);
        assert_eq!(
            store.reap_at(item.created_at + limits().upload_timeout),
            1
        );
        assert_eq!(files(dir.path()), 0);
        assert_eq!(
            store_error(store.commit(&item.id, &item.owner)),
            StoreError::NotFound
        );
    }

    #[test]
    fn test_abort() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), limits()).unwrap();

        let (item, _file) = store.create(10, "text/plain", HOUR).unwrap();
        let wrong = token::generate(OWNER_LENGTH);
        assert_eq!(
            store_error(store.abort(&item.id, &wrong)),
            StoreError::Forbidden
        );
        store.abort(&item.id, &item.owner).unwrap();
        assert_eq!(files(dir.path()), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_quota() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            dir.path(),
            Limits {
                max_items: 2,
                ..limits()
            },
        )
        .unwrap();

        upload(&store, b"a", HOUR);
        upload(&store, b"b", HOUR);
        assert_eq!(
            store_error(store.create(1, "text/plain", HOUR)),
            StoreError::QuotaExceeded
        );
    }

    #[test]
    fn test_concurrent_uniqueness() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1250;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path(), limits()).unwrap());

        let handles = (0..THREADS)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| store.create(1, "text/plain", HOUR).unwrap().0)
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut ids = HashSet::new();
        let mut owners = HashSet::new();
        for handle in handles {
            for item in handle.join().unwrap() {
                assert!(ids.insert(item.id));
                assert!(owners.insert(item.owner));
            }
        }
        assert_eq!(ids.len(), THREADS * PER_THREAD);
        assert_eq!(owners.len(), THREADS * PER_THREAD);
        assert_eq!(store.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (item, pending) = {
            let store = Store::open(dir.path(), limits()).unwrap();
            let item = upload(&store, b"persistent", HOUR);
            let (pending, _file) = store.create(10, "text/plain", HOUR).unwrap();
            (item, pending)
        };
        fs::write(dir.path().join(format!("{}{}", item.id, TMP_SUFFIX)), b"junk").unwrap();
        assert_eq!(files(dir.path()), 4);

        let store = Store::open(dir.path(), limits()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(files(dir.path()), 2);

        let (fetched, mut file) = store.fetch(&item.id).unwrap();
        assert_eq!(fetched, item);
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "persistent");

        assert_eq!(store_error(store.fetch(&pending.id)), StoreError::NotFound);
        store.delete(&item.id, &item.owner).unwrap();
    }
}
