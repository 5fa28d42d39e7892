//! Staged-detection sessions
//!
//! A session is a source image plus the evolving response produced from
//! it. Callers stage a detection once, then ask for recognition of
//! individual blocks later; the broker re-crops from the stored image so
//! the image never travels twice.
//!
//! The cache is bounded and evicts FIFO by original insertion order.
//! Re-staging an existing id replaces its contents without moving it in
//! the queue: a session's lifetime is decided by when its id first
//! appeared, not by how busy it is.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;
use tracing::info;

use crate::protocol::RecognitionResponse;

/// A staged source image with its evolving response.
///
/// The image is shared: backend calls borrow it from a blocking thread
/// while the cache entry stays put.
pub struct Session {
    pub image: Arc<DynamicImage>,
    pub response: RecognitionResponse,
}

impl Session {
    pub fn new(image: Arc<DynamicImage>, response: RecognitionResponse) -> Self {
        Self { image, response }
    }

    /// Clone of the current response, for handing to a caller.
    pub fn snapshot(&self) -> RecognitionResponse {
        self.response.clone()
    }
}

/// Handle to one session. The async lock serializes concurrent selective
/// recognition for the same id; it is held across backend calls.
pub type SharedSession = Arc<tokio::sync::Mutex<Session>>;

/// Bounded store of staged sessions.
pub struct SessionCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    sessions: HashMap<String, SharedSession>,
    order: VecDeque<String>,
}

impl SessionCache {
    pub const DEFAULT_CAPACITY: usize = 20;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Insert a session, replacing any previous one under the same id
    /// while keeping that id's eviction position. Inserting a new id past
    /// capacity evicts the earliest-inserted session.
    ///
    /// A replaced or evicted session detaches: holders of its handle
    /// finish against it, but the cache no longer knows the id (or maps it
    /// to the replacement).
    pub fn insert(&self, id: &str, session: Session) -> SharedSession {
        let handle: SharedSession = Arc::new(tokio::sync::Mutex::new(session));
        let mut inner = self.inner.lock();
        if inner
            .sessions
            .insert(id.to_string(), Arc::clone(&handle))
            .is_none()
        {
            inner.order.push_back(id.to_string());
            while inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.sessions.remove(&evicted);
                    info!(id = %evicted, "evicting oldest staged session");
                }
            }
        }
        handle
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.inner.lock().sessions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
