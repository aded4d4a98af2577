//! Revision Ledger
//!
//! Sequences the revisions a store publishes and keeps each one alive while
//! anything pins it: the head tag, a named tag, or a consumer holding a
//! `Lease`. Retention is count based; an old revision survives as long as
//! one pin remains, regardless of how far the head has moved.

use crate::domain::ports::{Store, Subscription};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback run after the ledger has moved its head.
pub type LedgerListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by `RevisionLedger::register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ledger bookkeeping errors. Both are fatal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("pin count underflow for revision sequence={sequence}")]
    PinUnderflow { sequence: u64 },
    #[error("revision sequence={sequence} is not retained")]
    NotRetained { sequence: u64 },
}

/// A store revision and its position in the ledger.
pub struct LinearRevision<R> {
    snapshot: R,
    sequence: u64,
}

impl<R> LinearRevision<R> {
    pub fn snapshot(&self) -> &R {
        &self.snapshot
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl<R> fmt::Debug for LinearRevision<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearRevision")
            .field("sequence", &self.sequence)
            .finish()
    }
}

struct Pinned<R> {
    revision: Arc<LinearRevision<R>>,
    pins: usize,
}

struct PinIndex<R> {
    revisions: BTreeMap<u64, Pinned<R>>,
    next_sequence: u64,
}

struct Pins<R> {
    index: Mutex<PinIndex<R>>,
}

impl<R> Pins<R> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            index: Mutex::new(PinIndex {
                revisions: BTreeMap::new(),
                next_sequence: 1,
            }),
        })
    }

    /// Assign the next sequence number to `snapshot` and pin it once.
    fn admit(self: &Arc<Self>, snapshot: R) -> Lease<R> {
        let mut index = self.index.lock();
        let sequence = index.next_sequence;
        index.next_sequence += 1;
        let revision = Arc::new(LinearRevision { snapshot, sequence });
        index.revisions.insert(
            sequence,
            Pinned {
                revision: revision.clone(),
                pins: 1,
            },
        );
        Lease {
            pins: Some(self.clone()),
            revision,
        }
    }

    fn pin(&self, sequence: u64) -> Result<(), LedgerError> {
        let mut index = self.index.lock();
        let pinned = index
            .revisions
            .get_mut(&sequence)
            .ok_or(LedgerError::NotRetained { sequence })?;
        pinned.pins += 1;
        Ok(())
    }

    fn release(&self, sequence: u64) -> Result<(), LedgerError> {
        let mut index = self.index.lock();
        match index.revisions.get_mut(&sequence) {
            Some(pinned) if pinned.pins > 0 => {
                pinned.pins -= 1;
                if pinned.pins == 0 {
                    index.revisions.remove(&sequence);
                    tracing::trace!("ledger evicted revision sequence={}", sequence);
                }
                Ok(())
            }
            _ => Err(LedgerError::PinUnderflow { sequence }),
        }
    }

    /// Lease the lowest retained revision with a sequence above `sequence`.
    fn first_after(self: &Arc<Self>, sequence: u64) -> Option<Lease<R>> {
        let mut index = self.index.lock();
        let (_, pinned) = index.revisions.range_mut(sequence + 1..).next()?;
        pinned.pins += 1;
        Some(Lease {
            pins: Some(self.clone()),
            revision: pinned.revision.clone(),
        })
    }

    fn retained(&self) -> Vec<u64> {
        self.index.lock().revisions.keys().copied().collect()
    }
}

/// A pin on a ledger revision, released when dropped.
///
/// Cloning a lease adds a pin. The tail lease pins nothing; the tail is
/// retained for the ledger's lifetime.
pub struct Lease<R> {
    pins: Option<Arc<Pins<R>>>,
    revision: Arc<LinearRevision<R>>,
}

impl<R> Deref for Lease<R> {
    type Target = LinearRevision<R>;

    fn deref(&self) -> &LinearRevision<R> {
        &self.revision
    }
}

impl<R> Clone for Lease<R> {
    fn clone(&self) -> Self {
        if let Some(pins) = &self.pins {
            if let Err(e) = pins.pin(self.revision.sequence) {
                tracing::error!("ledger invariant violated: {}", e);
                panic!("ledger invariant violated: {e}");
            }
        }
        Self {
            pins: self.pins.clone(),
            revision: self.revision.clone(),
        }
    }
}

impl<R> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(pins) = self.pins.take() {
            if let Err(e) = pins.release(self.revision.sequence) {
                tracing::error!("ledger invariant violated: {}", e);
                panic!("ledger invariant violated: {e}");
            }
        }
    }
}

impl<R> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("sequence", &self.revision.sequence)
            .finish()
    }
}

struct Tags<R> {
    head: Lease<R>,
    named: HashMap<String, Lease<R>>,
}

/// Sequences and retains the revisions of one store.
pub struct RevisionLedger<S: Store> {
    store: Arc<S>,
    pins: Arc<Pins<S::Revision>>,
    tail: Lease<S::Revision>,
    tags: Mutex<Tags<S::Revision>>,
    listeners: RwLock<Vec<(ListenerId, LedgerListener)>>,
    next_listener: AtomicU64,
    subscription: Mutex<Option<Subscription>>,
}

impl<S: Store> RevisionLedger<S> {
    /// Start sequencing `store`. Its current head becomes sequence 1; the
    /// empty tail is sequence 0.
    pub fn new(store: Arc<S>) -> Arc<Self> {
        Arc::new_cyclic(|ledger: &Weak<Self>| {
            let weak = ledger.clone();
            let subscription = store.register_listener(Arc::new(move || {
                if let Some(ledger) = weak.upgrade() {
                    ledger.advance();
                }
            }));

            let pins = Pins::new();
            let tail = Lease {
                pins: None,
                revision: Arc::new(LinearRevision {
                    snapshot: store.empty(),
                    sequence: 0,
                }),
            };
            let head = pins.admit(store.head());
            tracing::debug!("ledger started head_sequence={}", head.sequence());

            Self {
                store,
                pins,
                tail,
                tags: Mutex::new(Tags {
                    head,
                    named: HashMap::new(),
                }),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                subscription: Mutex::new(Some(subscription)),
            }
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The genesis revision: the empty snapshot at sequence 0.
    pub fn tail(&self) -> Lease<S::Revision> {
        self.tail.clone()
    }

    /// The latest revision.
    pub fn head(&self) -> Lease<S::Revision> {
        self.tags.lock().head.clone()
    }

    /// The lowest retained revision after `cursor`, if any.
    pub fn next(&self, cursor: &LinearRevision<S::Revision>) -> Option<Lease<S::Revision>> {
        self.pins.first_after(cursor.sequence)
    }

    /// Pin the current head under `key`, releasing whatever `key` pinned.
    pub fn set_tag(&self, key: impl Into<String>) {
        let key = key.into();
        let previous = {
            let mut tags = self.tags.lock();
            let head = tags.head.clone();
            tracing::debug!("ledger tag set key={} sequence={}", key, head.sequence());
            tags.named.insert(key, head)
        };
        drop(previous);
    }

    /// Release the pin held by `key`. Returns whether the tag existed.
    pub fn remove_tag(&self, key: &str) -> bool {
        let previous = self.tags.lock().named.remove(key);
        previous.is_some()
    }

    pub fn tag(&self, key: &str) -> Option<Lease<S::Revision>> {
        self.tags.lock().named.get(key).cloned()
    }

    /// Sequence numbers of all pinned revisions, ascending.
    pub fn retained(&self) -> Vec<u64> {
        self.pins.retained()
    }

    /// Run `listener` after every head change.
    pub fn register(&self, listener: LedgerListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(i, _)| *i != id);
        listeners.len() != before
    }

    fn advance(&self) {
        let previous = {
            let mut tags = self.tags.lock();
            let lease = self.pins.admit(self.store.head());
            tracing::debug!("ledger advanced head sequence={}", lease.sequence());
            std::mem::replace(&mut tags.head, lease)
        };
        drop(previous);

        let listeners: Vec<LedgerListener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener();
        }
    }
}

impl<S: Store> Drop for RevisionLedger<S> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.cancel();
        }
    }
}
