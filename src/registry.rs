//! Registry of open device sessions.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::session::{DeviceSession, SessionConfig};
use crate::transport::Transport;

type Session<T> = DeviceSession<<T as Transport>::Link>;

/// Owns one [`DeviceSession`] per discovered device.
///
/// The lock only guards the open/close transition and index lookups;
/// each session synchronizes its own transfer state. Callers should not
/// race [`close`](Self::close) against operations on the same sessions:
/// a session fetched before `close` stays usable as a handle but rejects
/// every call with [`Error::Closed`].
pub struct SessionRegistry<T: Transport> {
    transport: T,
    config: SessionConfig,
    sessions: RwLock<Option<Vec<Arc<Session<T>>>>>,
}

impl<T: Transport> SessionRegistry<T> {
    /// Creates an empty registry.
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            sessions: RwLock::new(None),
        }
    }

    /// The transport used for discovery.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Discovers devices and opens a session for each.
    ///
    /// Returns the number of open sessions. Calling `open` again without
    /// an intervening [`close`](Self::close) does not rescan; it returns the
    /// count from the first call. Devices that fail to open are skipped.
    pub fn open(&self) -> Result<usize> {
        let mut sessions = self.write();
        if let Some(existing) = sessions.as_ref() {
            debug!("registry already open with {} device(s)", existing.len());
            return Ok(existing.len());
        }

        let links = self.transport.enumerate()?;
        let mut opened = Vec::with_capacity(links.len());
        for link in links {
            let index = opened.len();
            match DeviceSession::open(index, link, self.config.clone()) {
                Ok(session) => opened.push(Arc::new(session)),
                Err(e) => warn!("skipping device that failed to open: {}", e),
            }
        }

        debug!("registry opened {} device(s)", opened.len());
        let count = opened.len();
        *sessions = Some(opened);
        Ok(count)
    }

    /// Closes every session and empties the registry.
    ///
    /// Safe with transfers in flight: each session cancels its own.
    pub fn close(&self) {
        let sessions = self.write().take();
        if let Some(sessions) = sessions {
            debug!("registry closing {} device(s)", sessions.len());
            for session in &sessions {
                session.close();
            }
        }
    }

    /// Returns true between [`open`](Self::open) and [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        self.read().is_some()
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.read().as_ref().map_or(0, Vec::len)
    }

    /// Returns true if no sessions are open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the session at `index`.
    pub fn get(&self, index: usize) -> Result<Arc<Session<T>>> {
        self.read()
            .as_ref()
            .and_then(|sessions| sessions.get(index).cloned())
            .ok_or(Error::NotFound { index })
    }

    /// All open sessions, in index order.
    pub fn sessions(&self) -> Vec<Arc<Session<T>>> {
        self.read().as_ref().cloned().unwrap_or_default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Vec<Arc<Session<T>>>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Vec<Arc<Session<T>>>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> Drop for SessionRegistry<T> {
    fn drop(&mut self) {
        self.close();
    }
}
