use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{KeyValueStore, expiry_from};
use crate::{
    clock::SharedClock,
    error::{CrawlError, Result},
};

/// Root directory for the on-disk store.
///
/// This is a dedicated directory that `cacache` will manage internally
/// (index + content-addressed blobs).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct StoreRoot(PathBuf);

impl StoreRoot {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for StoreRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StoreRoot").field(&self.0).finish()
    }
}

const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 10;

/// Frames a value as `[version][has_expiry][expiry millis, big endian][payload]`.
fn encode(bytes: &[u8], expires_at: Option<DateTime<Utc>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + bytes.len());
    out.push(FORMAT_VERSION);
    match expires_at {
        Some(at) => {
            out.push(1);
            out.extend_from_slice(&at.timestamp_millis().to_be_bytes());
        }
        None => {
            out.push(0);
            out.extend_from_slice(&0i64.to_be_bytes());
        }
    }
    out.extend_from_slice(bytes);
    out
}

fn decode(mut framed: Vec<u8>) -> Result<(Vec<u8>, Option<DateTime<Utc>>)> {
    if framed.len() < HEADER_LEN || framed[0] != FORMAT_VERSION {
        return Err(CrawlError::Store(
            "stored value has an unknown frame header".into(),
        ));
    }
    let mut millis = [0u8; 8];
    millis.copy_from_slice(&framed[2..HEADER_LEN]);
    let expires_at = if framed[1] == 1 {
        DateTime::<Utc>::from_timestamp_millis(i64::from_be_bytes(millis))
    } else {
        None
    };
    let payload = framed.split_off(HEADER_LEN);
    Ok((payload, expires_at))
}

fn map_cacache_error(key: &str, err: cacache::Error) -> CrawlError {
    match err {
        cacache::Error::EntryNotFound(_, _) => {
            CrawlError::Store(format!("store entry not found: {key}"))
        }
        cacache::Error::IntegrityError(err) => CrawlError::Store(format!(
            "store entry failed integrity check: {key} ({err})"
        )),
        cacache::Error::SizeMismatch(wanted, actual) => CrawlError::Store(format!(
            "store entry size mismatch: key={key}, wanted={wanted}, actual={actual}"
        )),
        cacache::Error::IoError(_, msg) => {
            CrawlError::Store(format!("cacache I/O error: {msg}"))
        }
        cacache::Error::SerdeError(_, msg) => {
            CrawlError::Store(format!("cacache serde error: {msg}"))
        }
    }
}

/// Durable store over `cacache`, used to park `Waiting` items across restarts of a node.
#[derive(Clone)]
pub struct DiskStore {
    root: StoreRoot,
    clock: SharedClock,
}

impl fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskStore")
            .field("root", &self.root)
            .field("clock", &self.clock)
            .finish()
    }
}

impl DiskStore {
    pub fn new(root: StoreRoot, clock: SharedClock) -> Self {
        Self { root, clock }
    }

    pub fn root(&self) -> &StoreRoot {
        &self.root
    }

    async fn remove_entry(&self, key: &str) -> Result<()> {
        let r_opts = cacache::index::RemoveOpts::new().remove_fully(true);
        r_opts
            .remove(self.root.as_path(), key)
            .await
            .map_err(|e| CrawlError::Store(format!("cacache remove failed: {e}")))
    }
}

#[async_trait]
impl KeyValueStore for DiskStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = expiry_from(self.clock.now(), ttl);
        cacache::write(self.root.as_path(), key, encode(&value, expires_at))
            .await
            .map_err(|e| CrawlError::Store(format!("cacache write failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let framed = match cacache::read(self.root.as_path(), key).await {
            Ok(framed) => framed,
            Err(cacache::Error::EntryNotFound(_, _)) => return Ok(None),
            Err(err) => return Err(map_cacache_error(key, err)),
        };

        let (payload, expires_at) = decode(framed)?;
        if expires_at.is_some_and(|at| at <= self.clock.now()) {
            self.remove_entry(key).await?;
            return Ok(None);
        }
        Ok(Some(payload))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let existed = self.get(key).await?.is_some();
        if existed {
            self.remove_entry(key).await?;
        }
        Ok(existed)
    }
}
