//! Wire Contexts
//!
//! Per-stream state for the object protocol: the output or input buffer,
//! the class ids sent so far, and the objects already seen so repeats can
//! be written as back-references.

use crate::wire::registry::{Codec, Registry};
use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A shareable, type-erased value. Two slots holding clones of the same
/// `Object` are encoded once and decode to one instance.
pub type Object = Arc<dyn Any + Send + Sync>;

pub(crate) fn object_key(object: &Object) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// Encoding side of a stream.
pub struct WriteContext {
    pub out: BytesMut,
    pub(crate) registry: Arc<Registry>,
    pub(crate) class_ids: HashMap<&'static str, u32>,
    /// Holds a clone of each object so its address is not reused
    pub(crate) object_ids: HashMap<usize, (u32, Object)>,
    /// Shared by class and object ids
    pub(crate) next_id: u32,
}

impl WriteContext {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            out: BytesMut::new(),
            registry,
            class_ids: HashMap::new(),
            object_ids: HashMap::new(),
            next_id: 0,
        }
    }

    /// Take everything written so far.
    pub fn take(&mut self) -> Bytes {
        self.out.split().freeze()
    }

    /// Forget previously written objects. Class ids stay known.
    pub fn clear_objects(&mut self) {
        self.object_ids.clear();
    }

    /// Record the class table and id counter before a write that may be
    /// abandoned.
    pub(crate) fn mark(&self) -> WriteMark {
        WriteMark {
            class_ids: self.class_ids.clone(),
            next_id: self.next_id,
        }
    }

    /// Undo everything written since `mark`, as if the write never
    /// happened. Pending output is dropped.
    pub(crate) fn rollback(&mut self, mark: WriteMark) {
        self.out.clear();
        self.object_ids.clear();
        self.class_ids = mark.class_ids;
        self.next_id = mark.next_id;
    }

    pub(crate) fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

/// Class state saved by `WriteContext::mark`.
pub(crate) struct WriteMark {
    class_ids: HashMap<&'static str, u32>,
    next_id: u32,
}

impl Default for WriteContext {
    fn default() -> Self {
        Self::new(Registry::standard())
    }
}

/// Decoding side of a stream.
pub struct ReadContext {
    pub input: Bytes,
    pub(crate) registry: Arc<Registry>,
    pub(crate) classes: HashMap<u32, Codec>,
    pub(crate) objects: HashMap<u32, Object>,
}

impl ReadContext {
    pub fn new(registry: Arc<Registry>, input: Bytes) -> Self {
        Self {
            input,
            registry,
            classes: HashMap::new(),
            objects: HashMap::new(),
        }
    }

    /// Replace the input, keeping known classes and objects.
    pub fn feed(&mut self, input: Bytes) {
        self.input = input;
    }

    pub fn clear_objects(&mut self) {
        self.objects.clear();
    }

    pub fn is_exhausted(&self) -> bool {
        self.input.is_empty()
    }
}

impl From<Bytes> for ReadContext {
    fn from(input: Bytes) -> Self {
        Self::new(Registry::standard(), input)
    }
}
