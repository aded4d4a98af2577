//! Object Protocol
//!
//! Every value on the wire starts with a one-byte tag:
//!
//! - `6` class definition: new class id, class name, object id, payload
//! - `7` class reference: known class id, object id, payload
//! - `8` reference: id of an object already sent on this stream
//!
//! Class ids and object ids come from one counter per stream.

use crate::wire::context::{object_key, Object, ReadContext, WriteContext};
use crate::wire::registry::Codec;
use crate::wire::varint::{read_i32, read_string, read_u8, write_i32, write_str};
use bytes::BufMut;
use std::any::{type_name, Any};
use std::sync::Arc;

pub const CLASS_DEFINITION: u8 = 6;
pub const CLASS_REFERENCE: u8 = 7;
pub const REFERENCE: u8 = 8;

/// Encode and decode failures. All of them end the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("unknown tag {0}")]
    UnknownTag(u8),
    #[error("unknown class id {0}")]
    MissingClassId(u32),
    #[error("unknown object id {0}")]
    MissingObjectId(u32),
    #[error("unknown class {0}")]
    UnknownClass(String),
    #[error("no serializer for {0}")]
    UnregisteredType(String),
    #[error("expected a value of type {0}")]
    TypeMismatch(&'static str),
    #[error("invalid utf-8")]
    InvalidUtf8,
    #[error("varint overflow")]
    VarintOverflow,
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Write `object`, or a back-reference if it was written before.
pub fn write(ctx: &mut WriteContext, object: &Object) -> Result<(), CodecError> {
    let key = object_key(object);
    if let Some((id, _)) = ctx.object_ids.get(&key) {
        let id = *id;
        ctx.out.put_u8(REFERENCE);
        write_i32(&mut ctx.out, id as i32);
        return Ok(());
    }

    let codec = ctx.registry.resolve(&**object)?;
    match ctx.class_ids.get(codec.name()) {
        Some(class_id) => {
            let class_id = *class_id;
            ctx.out.put_u8(CLASS_REFERENCE);
            write_i32(&mut ctx.out, class_id as i32);
        }
        None => {
            let class_id = ctx.allocate_id();
            ctx.out.put_u8(CLASS_DEFINITION);
            write_i32(&mut ctx.out, class_id as i32);
            write_str(&mut ctx.out, codec.name());
            ctx.class_ids.insert(codec.name(), class_id);
        }
    }

    let id = ctx.allocate_id();
    write_i32(&mut ctx.out, id as i32);
    codec.write(ctx, &**object)?;
    ctx.object_ids.insert(key, (id, object.clone()));
    Ok(())
}

/// Read the next object.
pub fn read(ctx: &mut ReadContext) -> Result<Object, CodecError> {
    match read_u8(&mut ctx.input)? {
        CLASS_DEFINITION => {
            let class_id = read_i32(&mut ctx.input)? as u32;
            let name = read_string(&mut ctx.input)?;
            let codec = ctx.registry.by_name(&name)?;
            ctx.classes.insert(class_id, codec);
            read_definition(ctx, codec)
        }
        CLASS_REFERENCE => {
            let class_id = read_i32(&mut ctx.input)? as u32;
            let codec = *ctx
                .classes
                .get(&class_id)
                .ok_or(CodecError::MissingClassId(class_id))?;
            read_definition(ctx, codec)
        }
        REFERENCE => {
            let id = read_i32(&mut ctx.input)? as u32;
            ctx.objects
                .get(&id)
                .cloned()
                .ok_or(CodecError::MissingObjectId(id))
        }
        tag => Err(CodecError::UnknownTag(tag)),
    }
}

fn read_definition(ctx: &mut ReadContext, codec: Codec) -> Result<Object, CodecError> {
    let id = read_i32(&mut ctx.input)? as u32;
    let object = codec.read(ctx)?;
    ctx.objects.insert(id, object.clone());
    Ok(object)
}

/// Write a plain value as a fresh object.
pub fn write_value<T: Any + Send + Sync + Clone>(
    ctx: &mut WriteContext,
    value: &T,
) -> Result<(), CodecError> {
    let object: Object = Arc::new(value.clone());
    write(ctx, &object)
}

/// Read an object and clone it out as `T`.
pub fn read_value<T: Any + Send + Sync + Clone>(ctx: &mut ReadContext) -> Result<T, CodecError> {
    read(ctx)?
        .downcast_ref::<T>()
        .cloned()
        .ok_or(CodecError::TypeMismatch(type_name::<T>()))
}

/// Read an object as a shared `T`, keeping its identity.
pub fn read_shared<T: Any + Send + Sync>(ctx: &mut ReadContext) -> Result<Arc<T>, CodecError> {
    read(ctx)?
        .downcast::<T>()
        .map_err(|_| CodecError::TypeMismatch(type_name::<T>()))
}
