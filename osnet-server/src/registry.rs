//! Registry of open remote stream handles.
//!
//! Every handle belongs to the session that opened it. Lookups from another
//! session see `UnknownHandle`, and all handles of a session are released
//! when its connection ends.

use crate::config::StreamsConfig;
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::resource::{Locator, Resource, SharedBuffer};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use osnet_protocol::{Capabilities, OpenMode, SeekOrigin, StreamDescriptor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Operation checked against a handle's capabilities.
#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
    Seek,
}

/// Mutable state of one open handle.
#[derive(Debug)]
pub(crate) struct StreamHandle {
    resource: Resource,
    capabilities: Capabilities,
    position: u64,
}

impl StreamHandle {
    fn require(&self, handle_id: u32, access: Access) -> Result<(), ServerError> {
        let (allowed, operation) = match access {
            Access::Read => (self.capabilities.readable, "read"),
            Access::Write => (self.capabilities.writable, "write"),
            Access::Seek => (self.capabilities.seekable, "seek"),
        };
        if allowed {
            Ok(())
        } else {
            Err(ServerError::CapabilityDenied {
                handle_id,
                operation,
            })
        }
    }
}

struct OpenHandle {
    owner: String,
    /// Set for `file:` handles, whose I/O blocks.
    file_backed: bool,
    state: Mutex<StreamHandle>,
}

/// Server-side table of open stream handles.
pub struct StreamRegistry {
    config: StreamsConfig,
    handles: DashMap<u32, Arc<OpenHandle>>,
    /// Named `mem:` buffers. They outlive the handles opened on them.
    buffers: DashMap<String, SharedBuffer>,
    session_counts: DashMap<String, usize>,
    next_id: AtomicU32,
    metrics: Option<Arc<Metrics>>,
}

impl StreamRegistry {
    pub fn new(config: StreamsConfig) -> Self {
        Self {
            config,
            handles: DashMap::new(),
            buffers: DashMap::new(),
            session_counts: DashMap::new(),
            next_id: AtomicU32::new(1),
            metrics: None,
        }
    }

    /// Attaches metrics for handle counts and byte totals.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.config
    }

    /// Opens the resource named by `locator` for `owner`.
    pub fn open(
        &self,
        owner: &str,
        locator: &str,
        mode: OpenMode,
    ) -> Result<StreamDescriptor, ServerError> {
        // Checked before touching the resource so Create does not truncate for nothing
        self.check_limit(owner)?;

        let resource = match Locator::parse(locator)? {
            Locator::Memory(name) => self.open_buffer(name, mode)?,
            Locator::File(relative) => {
                let root = self.config.root_dir.as_ref().ok_or_else(|| {
                    ServerError::ResourceUnavailable("file streams are not enabled".to_string())
                })?;
                let path = root.join(relative);
                if mode == OpenMode::Create {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            ServerError::ResourceUnavailable(format!("{}: {}", locator, e))
                        })?;
                    }
                }
                Resource::open_file(&path, mode)
                    .map_err(|e| ServerError::ResourceUnavailable(format!("{}: {}", locator, e)))?
            }
            Locator::Scratch => Resource::memory(Vec::new()),
        };

        let capabilities = Capabilities::from_mode(mode, resource.is_seekable());
        let handle_id = self.register(owner, resource, capabilities)?;
        tracing::debug!(handle_id, locator, ?mode, "Opened stream");
        self.info(owner, handle_id)
    }

    fn open_buffer(&self, name: String, mode: OpenMode) -> Result<Resource, ServerError> {
        if mode == OpenMode::Create {
            let buffer = self.buffers.entry(name).or_default().clone();
            buffer.write().clear();
            return Ok(Resource::Memory(buffer));
        }

        self.buffers
            .get(&name)
            .map(|buffer| Resource::Memory(buffer.clone()))
            .ok_or_else(|| ServerError::ResourceUnavailable(format!("no buffer named '{}'", name)))
    }

    fn check_limit(&self, owner: &str) -> Result<(), ServerError> {
        let limit = self.config.max_handles_per_session;
        if self.session_handle_count(owner) >= limit {
            return Err(ServerError::HandleLimit { limit });
        }
        Ok(())
    }

    /// Registers an already opened resource and returns its handle id.
    pub fn register(
        &self,
        owner: &str,
        resource: Resource,
        capabilities: Capabilities,
    ) -> Result<u32, ServerError> {
        {
            let limit = self.config.max_handles_per_session;
            let mut count = self.session_counts.entry(owner.to_string()).or_insert(0);
            if *count >= limit {
                return Err(ServerError::HandleLimit { limit });
            }
            *count += 1;
        }

        let handle = Arc::new(OpenHandle {
            owner: owner.to_string(),
            file_backed: matches!(resource, Resource::File(_)),
            state: Mutex::new(StreamHandle {
                resource,
                capabilities,
                position: 0,
            }),
        });

        let handle_id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.handles.entry(id) {
                slot.insert(handle);
                break id;
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.stream_handles_open.inc();
        }
        Ok(handle_id)
    }

    fn lookup(&self, owner: &str, handle_id: u32) -> Result<Arc<OpenHandle>, ServerError> {
        match self.handles.get(&handle_id) {
            Some(handle) if handle.owner == owner => Ok(handle.clone()),
            _ => Err(ServerError::UnknownHandle(handle_id)),
        }
    }

    /// Reads at the handle's position.
    pub fn read(&self, owner: &str, handle_id: u32, len: u32) -> Result<Bytes, ServerError> {
        let handle = self.lookup(owner, handle_id)?;
        let mut state = handle.state.lock();
        let offset = state.position;
        self.read_locked(&mut state, handle_id, offset, len)
    }

    /// Reads up to `len` bytes at `offset` and moves the position past them.
    ///
    /// The length is clamped to `max_read_chunk`. Empty means end of stream.
    pub fn read_at(
        &self,
        owner: &str,
        handle_id: u32,
        offset: u64,
        len: u32,
    ) -> Result<Bytes, ServerError> {
        let handle = self.lookup(owner, handle_id)?;
        let mut state = handle.state.lock();
        self.read_locked(&mut state, handle_id, offset, len)
    }

    fn read_locked(
        &self,
        state: &mut StreamHandle,
        handle_id: u32,
        offset: u64,
        len: u32,
    ) -> Result<Bytes, ServerError> {
        state.require(handle_id, Access::Read)?;

        let len = len.min(self.config.max_read_chunk) as usize;
        let data = state.resource.read_at(offset, len)?;
        state.position = offset + data.len() as u64;

        if let Some(metrics) = &self.metrics {
            metrics.stream_bytes_read_total.inc_by(data.len() as f64);
        }
        Ok(data)
    }

    /// Writes at the handle's position.
    pub fn write(&self, owner: &str, handle_id: u32, data: &[u8]) -> Result<u32, ServerError> {
        let handle = self.lookup(owner, handle_id)?;
        let mut state = handle.state.lock();
        let offset = state.position;
        self.write_locked(&mut state, handle_id, offset, data)
    }

    /// Writes `data` at `offset` and moves the position past it.
    pub fn write_at(
        &self,
        owner: &str,
        handle_id: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, ServerError> {
        let handle = self.lookup(owner, handle_id)?;
        let mut state = handle.state.lock();
        self.write_locked(&mut state, handle_id, offset, data)
    }

    fn write_locked(
        &self,
        state: &mut StreamHandle,
        handle_id: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, ServerError> {
        state.require(handle_id, Access::Write)?;
        let written = u32::try_from(data.len())
            .map_err(|_| ServerError::InvalidRequest("write larger than 4 GiB".to_string()))?;
        offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| ServerError::InvalidRequest("write past end of addressable range".to_string()))?;

        state.resource.write_at(offset, data)?;
        state.position = offset + data.len() as u64;

        if let Some(metrics) = &self.metrics {
            metrics.stream_bytes_written_total.inc_by(data.len() as f64);
        }
        Ok(written)
    }

    /// Seeks relative to the handle's own position.
    pub fn seek(
        &self,
        owner: &str,
        handle_id: u32,
        offset: i64,
        origin: SeekOrigin,
    ) -> Result<u64, ServerError> {
        let handle = self.lookup(owner, handle_id)?;
        let mut state = handle.state.lock();
        let cursor = state.position;
        Self::seek_locked(&mut state, handle_id, origin, offset, cursor)
    }

    /// Seeks with `Current` resolved against `cursor`, the caller's position.
    pub fn seek_from(
        &self,
        owner: &str,
        handle_id: u32,
        origin: SeekOrigin,
        offset: i64,
        cursor: u64,
    ) -> Result<u64, ServerError> {
        let handle = self.lookup(owner, handle_id)?;
        let mut state = handle.state.lock();
        Self::seek_locked(&mut state, handle_id, origin, offset, cursor)
    }

    fn seek_locked(
        state: &mut StreamHandle,
        handle_id: u32,
        origin: SeekOrigin,
        offset: i64,
        cursor: u64,
    ) -> Result<u64, ServerError> {
        state.require(handle_id, Access::Seek)?;

        let base = match origin {
            SeekOrigin::Start => 0,
            SeekOrigin::Current => cursor,
            SeekOrigin::End => state.resource.len()?,
        };
        let target = i128::from(base) + i128::from(offset);
        let position = u64::try_from(target).map_err(|_| {
            ServerError::InvalidSeek(format!(
                "{:?}{:+} resolves to {}, outside the stream",
                origin, offset, target
            ))
        })?;

        state.position = position;
        Ok(position)
    }

    /// Describes an open handle.
    pub fn info(&self, owner: &str, handle_id: u32) -> Result<StreamDescriptor, ServerError> {
        let handle = self.lookup(owner, handle_id)?;
        let state = handle.state.lock();
        Ok(StreamDescriptor {
            handle_id,
            capabilities: state.capabilities,
            length: state.resource.len()?,
            position: state.position,
        })
    }

    /// Closes a handle and releases its resource.
    pub fn close(&self, owner: &str, handle_id: u32) -> Result<(), ServerError> {
        self.handles
            .remove_if(&handle_id, |_, handle| handle.owner == owner)
            .ok_or(ServerError::UnknownHandle(handle_id))?;
        self.release_slot(owner);
        tracing::debug!(handle_id, "Closed stream");
        Ok(())
    }

    fn release_slot(&self, owner: &str) {
        if let Entry::Occupied(mut count) = self.session_counts.entry(owner.to_string()) {
            let remaining = count.get().saturating_sub(1);
            if remaining == 0 {
                count.remove();
            } else {
                *count.get_mut() = remaining;
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.stream_handles_open.dec();
        }
    }

    /// Closes every handle owned by `owner` and returns how many there were.
    pub fn close_session(&self, owner: &str) -> usize {
        let ids: Vec<u32> = self
            .handles
            .iter()
            .filter(|entry| entry.owner == owner)
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter()
            .filter(|id| self.close(owner, *id).is_ok())
            .count()
    }

    /// Whether `handle_id` is served from a file. Unknown ids report false.
    pub fn is_file_backed(&self, handle_id: u32) -> bool {
        self.handles
            .get(&handle_id)
            .map(|handle| handle.file_backed)
            .unwrap_or(false)
    }

    /// Number of open handles across all sessions.
    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    pub fn session_handle_count(&self, owner: &str) -> usize {
        self.session_counts.get(owner).map(|c| *c).unwrap_or(0)
    }
}
