//! Output sessions and the session store
//!
//! A session is the output sink of one run. The store groups live sessions by
//! invocation key and applies the reuse policy before a new run creates its
//! session. Removal from the store and disposal always happen together.

use crate::stream::OutputChunk;
use crate::protocol::OutputStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskgate_core::events::{EventEmitter, SessionEvent};
use taskgate_core::{InvocationKey, ReusePolicy};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output sink bound to one run.
pub trait OutputSession: Send + Sync {
    fn id(&self) -> SessionId;

    fn write(&self, chunk: &OutputChunk);

    /// Release the sink. Writes after disposal are dropped.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}

/// Creates the session for a new run.
pub trait SessionFactory: Send + Sync {
    fn create(&self, key: &InvocationKey) -> Arc<dyn OutputSession>;
}

/// Session that keeps everything written to it in memory.
pub struct BufferedSession {
    id: SessionId,
    key: InvocationKey,
    chunks: Mutex<Vec<OutputChunk>>,
    disposed: AtomicBool,
}

impl BufferedSession {
    pub fn new(key: InvocationKey) -> Self {
        Self {
            id: SessionId::new(),
            key,
            chunks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &InvocationKey {
        &self.key
    }

    pub fn chunks(&self) -> Vec<OutputChunk> {
        self.chunks.lock().clone()
    }

    /// Everything written to `stream`, lossily decoded.
    pub fn text(&self, stream: OutputStream) -> String {
        let bytes: Vec<u8> = self
            .chunks
            .lock()
            .iter()
            .filter(|chunk| chunk.stream == stream)
            .flat_map(|chunk| chunk.bytes.iter().copied())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl OutputSession for BufferedSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn write(&self, chunk: &OutputChunk) {
        if !self.is_disposed() {
            self.chunks.lock().push(chunk.clone());
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Factory for [`BufferedSession`]s that remembers what it created.
#[derive(Default)]
pub struct BufferedSessionFactory {
    created: Mutex<Vec<Arc<BufferedSession>>>,
}

impl BufferedSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<Arc<BufferedSession>> {
        self.created.lock().clone()
    }
}

impl SessionFactory for BufferedSessionFactory {
    fn create(&self, key: &InvocationKey) -> Arc<dyn OutputSession> {
        let session = Arc::new(BufferedSession::new(key.clone()));
        self.created.lock().push(session.clone());
        session
    }
}

/// Session that copies output to the process's stdout and stderr.
pub struct ConsoleSession {
    id: SessionId,
    disposed: AtomicBool,
}

impl ConsoleSession {
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            disposed: AtomicBool::new(false),
        }
    }
}

impl Default for ConsoleSession {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSession for ConsoleSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn write(&self, chunk: &OutputChunk) {
        if self.is_disposed() {
            return;
        }
        let written = match chunk.stream {
            OutputStream::Out => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&chunk.bytes).and_then(|()| stdout.flush())
            }
            OutputStream::Err => {
                let mut stderr = std::io::stderr().lock();
                stderr.write_all(&chunk.bytes).and_then(|()| stderr.flush())
            }
        };
        if let Err(e) = written {
            warn!(session = %self.id, error = %e, "failed to write task output");
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct ConsoleSessionFactory;

impl SessionFactory for ConsoleSessionFactory {
    fn create(&self, _key: &InvocationKey) -> Arc<dyn OutputSession> {
        Arc::new(ConsoleSession::new())
    }
}

/// Live sessions grouped by invocation key.
pub struct SessionStore {
    sessions: Mutex<HashMap<InvocationKey, Vec<Arc<dyn OutputSession>>>>,
    events: Arc<EventEmitter>,
}

impl SessionStore {
    pub fn new(events: Arc<EventEmitter>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn live(sessions: &HashMap<InvocationKey, Vec<Arc<dyn OutputSession>>>) -> usize {
        sessions.values().map(Vec::len).sum()
    }

    /// Dispose sessions that are out of the map. Callers remove them under
    /// the lock first so no query can observe a disposed session.
    fn finish(&self, key: Option<InvocationKey>, removed: Vec<Arc<dyn OutputSession>>, live: usize) {
        if removed.is_empty() {
            return;
        }
        for session in &removed {
            session.dispose();
        }
        debug!(disposed = removed.len(), live, "sessions disposed");
        self.events.emit(SessionEvent::SetChanged {
            key,
            live_sessions: live,
        });
    }

    /// Apply `policy` before a new session is created for `key`. Returns the
    /// number of disposed sessions.
    pub fn before_launch(&self, key: &InvocationKey, policy: ReusePolicy) -> usize {
        match policy {
            ReusePolicy::Off => 0,
            ReusePolicy::PerTask => self.dispose_all(key),
            ReusePolicy::Global => self.dispose_everything(),
        }
    }

    pub fn track(&self, key: InvocationKey, session: Arc<dyn OutputSession>) {
        let live = {
            let mut sessions = self.sessions.lock();
            sessions.entry(key.clone()).or_default().push(session.clone());
            Self::live(&sessions)
        };
        debug!(session = %session.id(), task = %key, live, "session tracked");
        self.events.emit(SessionEvent::SetChanged {
            key: Some(key),
            live_sessions: live,
        });
    }

    /// Drop a session that was closed externally, whichever key holds it.
    pub fn remove(&self, id: SessionId) -> bool {
        let (key, removed, live) = {
            let mut sessions = self.sessions.lock();
            let Some((key, position)) = sessions.iter().find_map(|(key, list)| {
                list.iter()
                    .position(|session| session.id() == id)
                    .map(|position| (key.clone(), position))
            }) else {
                return false;
            };

            let mut removed = Vec::new();
            if let Some(list) = sessions.get_mut(&key) {
                removed.push(list.remove(position));
                if list.is_empty() {
                    sessions.remove(&key);
                }
            }
            (key, removed, Self::live(&sessions))
        };
        self.finish(Some(key), removed, live);
        true
    }

    pub fn dispose_all(&self, key: &InvocationKey) -> usize {
        let (removed, live) = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(key).unwrap_or_default();
            (removed, Self::live(&sessions))
        };
        let count = removed.len();
        self.finish(Some(key.clone()), removed, live);
        count
    }

    pub fn dispose_everything(&self) -> usize {
        let removed: Vec<_> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().flat_map(|(_, list)| list).collect()
        };
        let count = removed.len();
        self.finish(None, removed, 0);
        count
    }

    pub fn sessions_for(&self, key: &InvocationKey) -> Vec<Arc<dyn OutputSession>> {
        self.sessions.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        Self::live(&self.sessions.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgate_core::TaskIdentity;

    fn key(task: &str, args: &str) -> InvocationKey {
        InvocationKey {
            identity: TaskIdentity::new("/p", task, ""),
            args: args.to_string(),
        }
    }

    fn launch(
        store: &SessionStore,
        factory: &BufferedSessionFactory,
        key: &InvocationKey,
        policy: ReusePolicy,
    ) -> Arc<dyn OutputSession> {
        store.before_launch(key, policy);
        let session = factory.create(key);
        store.track(key.clone(), session.clone());
        session
    }

    fn store() -> (SessionStore, BufferedSessionFactory) {
        (
            SessionStore::new(Arc::new(EventEmitter::default())),
            BufferedSessionFactory::new(),
        )
    }

    #[test]
    fn test_off_keeps_sessions_side_by_side() {
        let (store, factory) = store();
        let build = key("build", "");

        let first = launch(&store, &factory, &build, ReusePolicy::Off);
        let second = launch(&store, &factory, &build, ReusePolicy::Off);

        assert_eq!(store.sessions_for(&build).len(), 2);
        assert!(!first.is_disposed());
        assert!(!second.is_disposed());
    }

    #[test]
    fn test_per_task_disposes_only_same_key() {
        let (store, factory) = store();
        let build = key("build", "");
        let test = key("test", "");
        let build_info = key("build", "--info");

        let old_build = launch(&store, &factory, &build, ReusePolicy::Off);
        let other = launch(&store, &factory, &test, ReusePolicy::Off);
        let other_args = launch(&store, &factory, &build_info, ReusePolicy::Off);

        let new_build = launch(&store, &factory, &build, ReusePolicy::PerTask);

        assert!(old_build.is_disposed());
        assert!(!other.is_disposed());
        assert!(!other_args.is_disposed());
        let tracked = store.sessions_for(&build);
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].id(), new_build.id());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_global_disposes_every_key() {
        let (store, factory) = store();
        let a = launch(&store, &factory, &key("build", ""), ReusePolicy::Off);
        let b = launch(&store, &factory, &key("test", ""), ReusePolicy::Off);

        let c = launch(&store, &factory, &key("lint", ""), ReusePolicy::Global);

        assert!(a.is_disposed());
        assert!(b.is_disposed());
        assert!(!c.is_disposed());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_scans_all_keys() {
        let (store, factory) = store();
        let build = key("build", "");
        let keep = launch(&store, &factory, &build, ReusePolicy::Off);
        let closed = launch(&store, &factory, &key("test", ""), ReusePolicy::Off);

        assert!(store.remove(closed.id()));
        assert!(closed.is_disposed());
        assert!(!store.remove(closed.id()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.sessions_for(&build)[0].id(), keep.id());
    }

    #[test]
    fn test_no_disposed_session_remains_tracked() {
        let (store, factory) = store();
        for task in ["a", "b", "a", "c"] {
            launch(&store, &factory, &key(task, ""), ReusePolicy::PerTask);
        }
        store.dispose_all(&key("b", ""));

        for created in factory.created() {
            let tracked = store
                .sessions_for(created.key())
                .iter()
                .any(|session| session.id() == created.id());
            assert_ne!(tracked, created.is_disposed());
        }
        assert_eq!(store.dispose_everything(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn test_buffered_session_drops_writes_after_dispose() {
        let session = BufferedSession::new(key("build", ""));
        session.write(&OutputChunk::new(OutputStream::Out, "one "));
        session.write(&OutputChunk::new(OutputStream::Err, "warn"));
        session.write(&OutputChunk::new(OutputStream::Out, "two"));
        session.dispose();
        session.write(&OutputChunk::new(OutputStream::Out, "three"));

        assert_eq!(session.text(OutputStream::Out), "one two");
        assert_eq!(session.text(OutputStream::Err), "warn");
        assert_eq!(session.chunks().len(), 3);
    }
}
