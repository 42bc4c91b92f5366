//! Off-critical-data-path observer dispatch: after every commit, the shard
//! hands the committed object to whichever registered observers match its
//! pool prefix, on a worker pool separate from the delivery thread.
//! Observers call back into the store through `EmitSink`, which
//! normal/trigger-put commits satisfy via ordinary fire-and-forget puts —
//! the dispatcher never touches store internals directly, only the same
//! client interface any other caller would use.
//!
//! Workers are plain `std::sync::mpsc` consumers, one pool shared across
//! observers plus one dedicated worker per declared thread-affinity class.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;

use crate::fnv::fnv1a64;
use crate::object::Object;

/// User-defined data-path logic invoked after every committed object whose
/// key falls under a registered pool prefix.
pub trait OffCriticalDataPathObserver: Send + Sync {
    fn handle(&self, pathname: &str, key: &str, object: &Object, emit: &dyn EmitSink);
}

/// The observer's hook back into the store. `version = INVALID_VERSION`
/// requests a freshly assigned version; an explicit value is still subject
/// to the normal put validation.
pub trait EmitSink: Send + Sync {
    fn emit(&self, key: &str, version: i64, ts_us: u64, previous_version: i64, previous_version_by_key: i64, blob: Vec<u8>);
}

struct NoopEmitSink;

impl EmitSink for NoopEmitSink {
    fn emit(&self, key: &str, _version: i64, _ts_us: u64, _previous_version: i64, _previous_version_by_key: i64, _blob: Vec<u8>) {
        log::warn!("OCDPO emit for key {} dropped: dispatcher has no emit sink wired yet", key);
    }
}

/// An observer that requires single-threaded execution (e.g. an embedded
/// interpreter) declares a thread-affinity class; the dispatcher keeps one
/// dedicated worker per distinct class.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ThreadAffinity {
    Shared,
    Class(String),
}

struct Registration {
    prefix: String,
    observer: Arc<dyn OffCriticalDataPathObserver>,
    affinity: ThreadAffinity,
}

struct WorkItem {
    pathname: String,
    key: String,
    object: Object,
    observer: Arc<dyn OffCriticalDataPathObserver>,
}

/// Dispatches committed objects to registered observers on a worker pool.
/// `notify_commit` is synchronous and non-blocking: it only enqueues.
pub struct Dispatcher {
    registrations: RwLock<Vec<Registration>>,
    shared_pool: RwLock<Vec<Sender<WorkItem>>>,
    affinity_workers: Mutex<HashMap<String, Sender<WorkItem>>>,
    emit_sink: Arc<OnceLock<Arc<dyn EmitSink>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// `shared_pool_size` workers service observers with `ThreadAffinity::Shared`;
    /// same-key commits always land on the same worker (hashed), so
    /// per-key commit order is preserved even though different keys run
    /// concurrently.
    pub fn new(shared_pool_size: usize) -> Arc<Self> {
        let shared_pool_size = shared_pool_size.max(1);
        let emit_sink: Arc<OnceLock<Arc<dyn EmitSink>>> = Arc::new(OnceLock::new());
        let mut shared_pool = Vec::with_capacity(shared_pool_size);
        let mut handles = Vec::with_capacity(shared_pool_size);

        for _ in 0..shared_pool_size {
            let (tx, rx) = mpsc::channel::<WorkItem>();
            let sink = emit_sink.clone();
            handles.push(std::thread::spawn(move || run_worker(rx, sink)));
            shared_pool.push(tx);
        }

        Arc::new(Self {
            registrations: RwLock::new(Vec::new()),
            shared_pool: RwLock::new(shared_pool),
            affinity_workers: Mutex::new(HashMap::new()),
            emit_sink,
            handles: Mutex::new(handles),
        })
    }

    /// Wires the store's emit implementation in once, after both the
    /// dispatcher and the store it dispatches into have been constructed
    /// (the two are built in two phases to break the construction cycle).
    pub fn set_emit_sink(&self, sink: Arc<dyn EmitSink>) {
        if self.emit_sink.set(sink).is_err() {
            log::warn!("Dispatcher::set_emit_sink called more than once; ignoring");
        }
    }

    pub fn register(&self, prefix: impl Into<String>, observer: Arc<dyn OffCriticalDataPathObserver>, affinity: ThreadAffinity) {
        if let ThreadAffinity::Class(name) = &affinity {
            self.ensure_affinity_worker(name.clone());
        }
        self.registrations.write().unwrap().push(Registration { prefix: prefix.into(), observer, affinity });
    }

    fn ensure_affinity_worker(&self, class: String) {
        let mut workers = self.affinity_workers.lock().unwrap();
        if workers.contains_key(&class) {
            return;
        }
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let sink = self.emit_sink.clone();
        self.handles.lock().unwrap().push(std::thread::spawn(move || run_worker(rx, sink)));
        workers.insert(class, tx);
    }

    /// Enqueues `object` for every observer registered on a prefix of its
    /// key. At-least-once: a send failure (a dead worker) is logged and the
    /// commit continues — ordering is never blocked on observer dispatch.
    pub fn notify_commit(&self, object: Object) {
        let registrations = self.registrations.read().unwrap();
        for reg in registrations.iter() {
            if !object.key.starts_with(reg.prefix.as_str()) {
                continue;
            }
            let item = WorkItem {
                pathname: reg.prefix.clone(),
                key: object.key.clone(),
                object: object.clone(),
                observer: reg.observer.clone(),
            };
            match &reg.affinity {
                ThreadAffinity::Shared => {
                    let pool = self.shared_pool.read().unwrap();
                    if pool.is_empty() {
                        continue;
                    }
                    let idx = (fnv1a64(object.key.as_bytes()) as usize) % pool.len();
                    if pool[idx].send(item).is_err() {
                        log::error!("OCDPO shared worker is gone; commit for {} not dispatched", object.key);
                    }
                }
                ThreadAffinity::Class(name) => {
                    let workers = self.affinity_workers.lock().unwrap();
                    match workers.get(name) {
                        Some(sender) if sender.send(item).is_ok() => {}
                        _ => log::error!(
                            "OCDPO worker for affinity class {} is gone; commit for {} not dispatched",
                            name,
                            object.key
                        ),
                    }
                }
            }
        }
    }

    /// Closes every worker's queue (dropping the senders so each worker's
    /// `recv` loop exits once its queue drains) and joins them. Best-effort:
    /// a worker stuck inside a misbehaving observer still blocks this call,
    /// since `JoinHandle::join` has no timeout to race against. Safe to
    /// call once at shutdown.
    pub fn shutdown(&self) {
        self.shared_pool.write().unwrap().clear();
        self.affinity_workers.lock().unwrap().clear();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_worker(rx: mpsc::Receiver<WorkItem>, emit_sink: Arc<OnceLock<Arc<dyn EmitSink>>>) {
    while let Ok(item) = rx.recv() {
        let sink = emit_sink.get().cloned();
        let observer = item.observer.clone();
        let pathname = item.pathname.clone();
        let key = item.key.clone();
        let object = item.object.clone();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if let Some(sink) = sink.as_deref() {
                observer.handle(&pathname, &key, &object, sink);
            } else {
                observer.handle(&pathname, &key, &object, &NoopEmitSink);
            }
        }));
        if outcome.is_err() {
            log::error!("OCDPO observer panicked handling commit for pathname {}", pathname);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct RecordingObserver {
        seen: Arc<Mutex<Vec<(String, i64)>>>,
    }

    impl OffCriticalDataPathObserver for RecordingObserver {
        fn handle(&self, _pathname: &str, key: &str, object: &Object, _emit: &dyn EmitSink) {
            self.seen.lock().unwrap().push((key.to_string(), object.version));
        }
    }

    struct PanickingObserver;

    impl OffCriticalDataPathObserver for PanickingObserver {
        fn handle(&self, _pathname: &str, _key: &str, _object: &Object, _emit: &dyn EmitSink) {
            panic!("boom");
        }
    }

    struct CountingEmitSink {
        count: Arc<AtomicUsize>,
    }

    impl EmitSink for CountingEmitSink {
        fn emit(&self, _key: &str, _version: i64, _ts_us: u64, _previous_version: i64, _previous_version_by_key: i64, _blob: Vec<u8>) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn sample_object(key: &str, version: i64) -> Object {
        let mut obj = Object::new(key, b"v".to_vec());
        obj.version = version;
        obj
    }

    #[test]
    fn dispatches_only_to_matching_prefix() {
        let dispatcher = Dispatcher::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register("/pool/a", Arc::new(RecordingObserver { seen: seen.clone() }), ThreadAffinity::Shared);

        dispatcher.notify_commit(sample_object("/pool/a/1", 1));
        dispatcher.notify_commit(sample_object("/other/1", 1));
        std::thread::sleep(Duration::from_millis(50));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "/pool/a/1");
    }

    #[test]
    fn preserves_per_key_commit_order() {
        let dispatcher = Dispatcher::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register("/pool/a", Arc::new(RecordingObserver { seen: seen.clone() }), ThreadAffinity::Shared);

        for v in 0..50 {
            dispatcher.notify_commit(sample_object("/pool/a/same-key", v));
        }
        std::thread::sleep(Duration::from_millis(100));

        let seen = seen.lock().unwrap();
        let versions: Vec<i64> = seen.iter().map(|(_, v)| *v).collect();
        assert_eq!(versions, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_observer_is_caught_and_logged() {
        let dispatcher = Dispatcher::new(1);
        dispatcher.register("/pool/a", Arc::new(PanickingObserver), ThreadAffinity::Shared);
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register("/pool/a", Arc::new(RecordingObserver { seen: seen.clone() }), ThreadAffinity::Shared);

        dispatcher.notify_commit(sample_object("/pool/a/1", 1));
        std::thread::sleep(Duration::from_millis(50));

        // The panicking observer didn't take down the worker: the
        // second registration for the same commit still ran.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn emit_sink_wired_after_construction_is_used() {
        let dispatcher = Dispatcher::new(1);
        let count = Arc::new(AtomicUsize::new(0));
        struct Emitter {
            count: Arc<AtomicUsize>,
        }
        impl OffCriticalDataPathObserver for Emitter {
            fn handle(&self, _pathname: &str, key: &str, object: &Object, emit: &dyn EmitSink) {
                emit.emit(key, object.version, object.timestamp_us, -1, -1, object.blob.clone());
            }
        }
        dispatcher.register("/pool/a", Arc::new(Emitter { count: count.clone() }), ThreadAffinity::Shared);
        dispatcher.set_emit_sink(Arc::new(CountingEmitSink { count: count.clone() }));

        dispatcher.notify_commit(sample_object("/pool/a/1", 1));
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_affinity_class_gets_dedicated_worker() {
        let dispatcher = Dispatcher::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(
            "/pool/a",
            Arc::new(RecordingObserver { seen: seen.clone() }),
            ThreadAffinity::Class("interpreter".to_string()),
        );

        dispatcher.notify_commit(sample_object("/pool/a/1", 1));
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
