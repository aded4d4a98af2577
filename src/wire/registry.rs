//! Codec Registry
//!
//! Maps Rust types to wire classes. Writers resolve by exact `TypeId`
//! first, then by the first capability probe that accepts the value; a
//! probe hit is cached for the type by swapping in a new map. Readers
//! resolve by class name.

use crate::wire::context::{Object, ReadContext, WriteContext};
use crate::wire::protocol::CodecError;
use crate::wire::varint::{read_string, write_str};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// A type with a wire class.
pub trait Wire: Any + Send + Sync + Sized {
    /// Name sent in class definitions.
    const CLASS_NAME: &'static str;

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError>;

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError>;
}

pub type WriteFn = fn(&mut WriteContext, &dyn Any) -> Result<(), CodecError>;
pub type ReadFn = fn(&mut ReadContext) -> Result<Object, CodecError>;

/// Accepts values a capability codec can write.
pub type Probe = fn(&dyn Any) -> bool;

/// Serializer and deserializer for one wire class.
#[derive(Clone, Copy)]
pub struct Codec {
    name: &'static str,
    write: WriteFn,
    read: ReadFn,
}

impl Codec {
    pub fn new(name: &'static str, write: WriteFn, read: ReadFn) -> Self {
        Self { name, write, read }
    }

    pub fn of<T: Wire>() -> Self {
        Self::new(T::CLASS_NAME, write_erased::<T>, read_erased::<T>)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn write(&self, ctx: &mut WriteContext, value: &dyn Any) -> Result<(), CodecError> {
        (self.write)(ctx, value)
    }

    pub(crate) fn read(&self, ctx: &mut ReadContext) -> Result<Object, CodecError> {
        (self.read)(ctx)
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Codec").field(&self.name).finish()
    }
}

fn write_erased<T: Wire>(ctx: &mut WriteContext, value: &dyn Any) -> Result<(), CodecError> {
    value
        .downcast_ref::<T>()
        .ok_or(CodecError::TypeMismatch(T::CLASS_NAME))?
        .write_to(ctx)
}

fn read_erased<T: Wire>(ctx: &mut ReadContext) -> Result<Object, CodecError> {
    Ok(Arc::new(T::read_from(ctx)?))
}

pub struct Registry {
    exact: RwLock<Arc<HashMap<TypeId, Codec>>>,
    named: HashMap<&'static str, Codec>,
    capabilities: Vec<(Probe, Codec)>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// The shared registry holding every built-in class.
    pub fn standard() -> Arc<Registry> {
        static STANDARD: OnceLock<Arc<Registry>> = OnceLock::new();
        STANDARD
            .get_or_init(|| Arc::new(RegistryBuilder::standard().build()))
            .clone()
    }

    /// Find the codec for `value`.
    pub fn resolve(&self, value: &dyn Any) -> Result<Codec, CodecError> {
        let type_id = value.type_id();
        let exact = self.exact.read().clone();
        if let Some(codec) = exact.get(&type_id) {
            return Ok(*codec);
        }

        let (_, codec) = self
            .capabilities
            .iter()
            .find(|(probe, _)| probe(value))
            .ok_or_else(|| CodecError::UnregisteredType(format!("{:?}", type_id)))?;

        let mut guard = self.exact.write();
        let mut cached = HashMap::clone(&guard);
        cached.insert(type_id, *codec);
        *guard = Arc::new(cached);
        tracing::trace!("codec resolution cached class={}", codec.name());
        Ok(*codec)
    }

    pub fn by_name(&self, name: &str) -> Result<Codec, CodecError> {
        self.named
            .get(name)
            .copied()
            .ok_or_else(|| CodecError::UnknownClass(name.to_string()))
    }

    /// Number of types resolved without a probe.
    pub fn cached_types(&self) -> usize {
        self.exact.read().len()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    exact: HashMap<TypeId, Codec>,
    named: HashMap<&'static str, Codec>,
    capabilities: Vec<(Probe, Codec)>,
}

impl RegistryBuilder {
    /// A builder preloaded with the built-in classes.
    pub fn standard() -> Self {
        let builder = crate::wire::builtins::register(Self::default());
        crate::wire::message::register(builder)
    }

    pub fn register<T: Wire>(mut self) -> Self {
        let codec = Codec::of::<T>();
        self.exact.insert(TypeId::of::<T>(), codec);
        self.named.insert(codec.name(), codec);
        self
    }

    /// Add a codec chosen by `probe` for types with no exact entry.
    pub fn capability(mut self, probe: Probe, codec: Codec) -> Self {
        self.named.insert(codec.name(), codec);
        self.capabilities.push((probe, codec));
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            exact: RwLock::new(Arc::new(self.exact)),
            named: self.named,
            capabilities: self.capabilities,
        }
    }
}

// ==================== Text capability ====================

pub(crate) const TEXT: &str = "text";

pub(crate) fn is_text(value: &dyn Any) -> bool {
    value.is::<String>() || value.is::<Box<str>>() || value.is::<&'static str>()
}

pub(crate) fn write_text(ctx: &mut WriteContext, value: &dyn Any) -> Result<(), CodecError> {
    let text: &str = if let Some(s) = value.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = value.downcast_ref::<Box<str>>() {
        &**s
    } else if let Some(s) = value.downcast_ref::<&'static str>() {
        *s
    } else {
        return Err(CodecError::TypeMismatch(TEXT));
    };
    write_str(&mut ctx.out, text);
    Ok(())
}

/// Text always decodes as `String`.
pub(crate) fn read_text(ctx: &mut ReadContext) -> Result<Object, CodecError> {
    Ok(Arc::new(read_string(&mut ctx.input)?))
}
