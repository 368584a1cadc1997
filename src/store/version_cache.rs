use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::{Error, Message, Result};
use crate::model::{Content, ContentVersionInfo, Id, PrimaryKey, Version};

#[derive(Debug, Clone)]
struct CacheEntry {
    content: Content,
    last_accessed: u64,
}

#[derive(Debug)]
struct Inner {
    info: ContentVersionInfo,
    versions: BTreeMap<i32, CacheEntry>,
    tick: u64,
}

impl Inner {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn resolve(&self, pk: &PrimaryKey) -> Option<i32> {
        match pk.version {
            Version::Number(n) => Some(n),
            Version::Max => self.info.max_version(),
            Version::Live => self.info.live_version,
        }
    }
}

/// Thread-safe container for the cached versions of one logical instance
#[derive(Debug)]
pub struct CachedContentContainer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl CachedContentContainer {
    pub fn new(info: ContentVersionInfo, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                info,
                versions: BTreeMap::new(),
                tick: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn id(&self) -> Id {
        self.inner.lock().info.id
    }

    pub fn info(&self) -> ContentVersionInfo {
        self.inner.lock().info.clone()
    }

    /// Replace the version info; cached versions it no longer lists are dropped.
    pub fn update_info(&self, info: ContentVersionInfo) {
        let mut inner = self.inner.lock();
        inner.versions.retain(|v, _| info.versions.contains_key(v));
        inner.info = info;
    }

    /// Cache a concrete version, evicting the least recently used old version when full.
    pub fn add(&self, content: Content) -> Result<()> {
        let mut inner = self.inner.lock();
        if content.pk.id != inner.info.id {
            return Err(Error::invalid(
                Message::new("ex.content.cache.idMismatch")
                    .arg(content.pk)
                    .arg(inner.info.id),
            ));
        }
        let Version::Number(version) = content.pk.version else {
            return Err(Error::invalid(
                Message::new("ex.content.cache.version.notDistinct").arg(content.pk),
            ));
        };
        let tick = inner.touch();
        inner.versions.insert(
            version,
            CacheEntry {
                content,
                last_accessed: tick,
            },
        );

        while inner.versions.len() > self.capacity {
            let pinned = [inner.info.max_version(), inner.info.live_version];
            let victim = inner
                .versions
                .iter()
                .filter(|(v, _)| !pinned.contains(&Some(**v)))
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(v, _)| *v);
            match victim {
                Some(v) => {
                    inner.versions.remove(&v);
                    log::debug!("evicted version {} of content {}", v, inner.info.id);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Cached copy of `pk`; MAX and LIVE resolve through the version info.
    pub fn get(&self, pk: &PrimaryKey) -> Option<Content> {
        let mut inner = self.inner.lock();
        let version = inner.resolve(pk)?;
        let tick = inner.touch();
        let entry = inner.versions.get_mut(&version)?;
        entry.last_accessed = tick;
        Some(entry.content.clone())
    }

    pub fn contains(&self, pk: &PrimaryKey) -> bool {
        let inner = self.inner.lock();
        inner
            .resolve(pk)
            .map_or(false, |v| inner.versions.contains_key(&v))
    }

    pub fn remove(&self, version: i32) -> Option<Content> {
        self.inner.lock().versions.remove(&version).map(|e| e.content)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
