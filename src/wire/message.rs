//! Replication Messages
//!
//! The messages peers exchange, and `DiffBody`, a structural diff captured
//! from a store so it can be shipped and replayed elsewhere.

use crate::domain::diff::{DiffEvent, DuplicateKeyResolution};
use crate::domain::ports::{DiffCursor, RevisionBuilder, StoreError};
use crate::domain::value_objects::Value;
use crate::replication::NodeKey;
use crate::wire::context::{Object, ReadContext, WriteContext};
use crate::wire::protocol::{read_value, write_value, CodecError};
use crate::wire::registry::{RegistryBuilder, Wire};
use crate::wire::varint::{read_i64, read_string, read_u8, write_i64, write_str};
use bytes::BufMut;
use std::sync::Arc;
use uuid::Uuid;

const END: u8 = 0;
const DESCEND: u8 = 1;
const ASCEND: u8 = 2;
const KEY: u8 = 3;
const DELETE: u8 = 4;
const INSERT: u8 = 5;

pub(crate) fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register::<Hello>()
        .register::<SyncRequest>()
        .register::<Ack>()
        .register::<Diff>()
}

/// First message on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub instance: Uuid,
}

/// Asks the peer to send everything it has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub instance: Uuid,
}

/// Confirms that `acknowledger` applied the diff `diff_origin` ended at
/// `diff_sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub acknowledger: NodeKey,
    pub acknowledger_sequence: u64,
    pub diff_origin: NodeKey,
    pub diff_sequence: u64,
}

/// Changes made by `origin` between two of its sequence numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub origin: NodeKey,
    pub start_sequence: u64,
    pub end_sequence: u64,
    pub body: DiffBody,
}

/// One step of a captured diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffOp {
    Descend,
    Ascend,
    /// A key present in the newer revision
    Key(Value),
    /// A key and everything below it removed
    Delete(Value),
    /// A cell value under the current key
    Insert(Value),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffBody {
    ops: Vec<DiffOp>,
}

impl DiffBody {
    /// Drain `cursor`, which must include values.
    pub fn capture(cursor: &mut dyn DiffCursor) -> Result<Self, StoreError> {
        let mut ops = Vec::new();
        loop {
            match cursor.next()? {
                DiffEvent::End => return Ok(Self { ops }),
                DiffEvent::Descend => ops.push(DiffOp::Descend),
                DiffEvent::Ascend => ops.push(DiffOp::Ascend),
                DiffEvent::Key {
                    fork: Some(fork), ..
                } => ops.push(DiffOp::Key(fork)),
                DiffEvent::Key {
                    base: Some(base),
                    fork: None,
                } => {
                    ops.push(DiffOp::Delete(base));
                    cursor.skip();
                }
                DiffEvent::Key {
                    base: None,
                    fork: None,
                } => {
                    return Err(StoreError::InvalidPath(
                        "diff key with neither side".to_string(),
                    ))
                }
                DiffEvent::Value(value) => ops.push(DiffOp::Insert(value)),
            }
        }
    }

    pub fn ops(&self) -> &[DiffOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Replay onto `builder`. A key whose branch closes without any
    /// column, child or delete under it is inserted on its own.
    pub fn apply<B: RevisionBuilder + ?Sized>(&self, builder: &mut B) -> Result<(), StoreError> {
        let mut path: Vec<Value> = Vec::new();
        let mut depth = 0usize;
        let mut visited = true;

        for op in &self.ops {
            match op {
                DiffOp::Descend => {
                    visited = true;
                    depth += 1;
                }
                DiffOp::Ascend => {
                    if !visited {
                        visited = true;
                        insert_key(builder, &path, depth)?;
                    }
                    path.truncate(depth);
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| malformed("ascend above the root"))?;
                }
                DiffOp::Key(key) => {
                    if visited {
                        visited = false;
                    } else {
                        insert_key(builder, &path, depth)?;
                    }
                    set(&mut path, depth, key)?;
                }
                DiffOp::Delete(key) => {
                    visited = true;
                    set(&mut path, depth, key)?;
                    builder.delete(&path)?;
                }
                DiffOp::Insert(value) => {
                    visited = true;
                    set(&mut path, depth + 1, value)?;
                    builder.insert(DuplicateKeyResolution::Overwrite, &path)?;
                }
            }
        }
        Ok(())
    }
}

fn malformed(reason: &str) -> StoreError {
    StoreError::InvalidPath(format!("malformed diff body: {}", reason))
}

fn set(path: &mut Vec<Value>, index: usize, value: &Value) -> Result<(), StoreError> {
    path.truncate(index);
    if path.len() != index {
        return Err(malformed("key below an unset level"));
    }
    path.push(value.clone());
    Ok(())
}

fn insert_key<B: RevisionBuilder + ?Sized>(
    builder: &mut B,
    path: &[Value],
    depth: usize,
) -> Result<(), StoreError> {
    // A bare table is not an insertable path.
    if depth == 0 {
        return Ok(());
    }
    let key = path.get(..=depth).ok_or_else(|| malformed("key path too short"))?;
    builder.insert(DuplicateKeyResolution::Overwrite, key)
}

// ==================== Wire encoding ====================

fn write_key(ctx: &mut WriteContext, key: &NodeKey) {
    write_str(&mut ctx.out, &key.to_string());
}

fn read_key(ctx: &mut ReadContext) -> Result<NodeKey, CodecError> {
    let s = read_string(&mut ctx.input)?;
    s.parse()
        .map_err(|_| CodecError::InvalidValue(format!("node key {}", s)))
}

fn read_uuid(ctx: &mut ReadContext) -> Result<Uuid, CodecError> {
    let s = read_string(&mut ctx.input)?;
    Uuid::parse_str(&s).map_err(|_| CodecError::InvalidValue(format!("uuid {}", s)))
}

impl Wire for Hello {
    const CLASS_NAME: &'static str = "hello";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_str(&mut ctx.out, &self.instance.to_string());
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        Ok(Self {
            instance: read_uuid(ctx)?,
        })
    }
}

impl Wire for SyncRequest {
    const CLASS_NAME: &'static str = "sync";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_str(&mut ctx.out, &self.instance.to_string());
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        Ok(Self {
            instance: read_uuid(ctx)?,
        })
    }
}

impl Wire for Ack {
    const CLASS_NAME: &'static str = "ack";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_key(ctx, &self.acknowledger);
        write_i64(&mut ctx.out, self.acknowledger_sequence as i64);
        write_key(ctx, &self.diff_origin);
        write_i64(&mut ctx.out, self.diff_sequence as i64);
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        Ok(Self {
            acknowledger: read_key(ctx)?,
            acknowledger_sequence: read_i64(&mut ctx.input)? as u64,
            diff_origin: read_key(ctx)?,
            diff_sequence: read_i64(&mut ctx.input)? as u64,
        })
    }
}

impl Wire for Diff {
    const CLASS_NAME: &'static str = "diff";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_key(ctx, &self.origin);
        write_i64(&mut ctx.out, self.start_sequence as i64);
        write_i64(&mut ctx.out, self.end_sequence as i64);
        for op in &self.body.ops {
            match op {
                DiffOp::Descend => ctx.out.put_u8(DESCEND),
                DiffOp::Ascend => ctx.out.put_u8(ASCEND),
                DiffOp::Key(key) => {
                    ctx.out.put_u8(KEY);
                    write_value(ctx, key)?;
                }
                DiffOp::Delete(key) => {
                    ctx.out.put_u8(DELETE);
                    write_value(ctx, key)?;
                }
                DiffOp::Insert(value) => {
                    ctx.out.put_u8(INSERT);
                    write_value(ctx, value)?;
                }
            }
        }
        ctx.out.put_u8(END);
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        let origin = read_key(ctx)?;
        let start_sequence = read_i64(&mut ctx.input)? as u64;
        let end_sequence = read_i64(&mut ctx.input)? as u64;

        let mut ops = Vec::new();
        let mut depth = 0usize;
        loop {
            let op = match read_u8(&mut ctx.input)? {
                END if depth == 0 => break,
                END => {
                    return Err(CodecError::InvalidValue(format!(
                        "diff body ended at depth {}",
                        depth
                    )))
                }
                DESCEND => {
                    depth += 1;
                    DiffOp::Descend
                }
                ASCEND => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        CodecError::InvalidValue("diff body ascends above the root".to_string())
                    })?;
                    DiffOp::Ascend
                }
                KEY => DiffOp::Key(read_value(ctx)?),
                DELETE => DiffOp::Delete(read_value(ctx)?),
                INSERT => DiffOp::Insert(read_value(ctx)?),
                flag => return Err(CodecError::UnknownTag(flag)),
            };
            ops.push(op);
        }

        Ok(Self {
            origin,
            start_sequence,
            end_sequence,
            body: DiffBody { ops },
        })
    }
}

/// Any replication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Sync(SyncRequest),
    Ack(Ack),
    Diff(Diff),
}

impl Message {
    /// Identify a decoded object.
    pub fn from_object(object: Object) -> Result<Self, CodecError> {
        if let Some(m) = object.downcast_ref::<Hello>() {
            return Ok(Message::Hello(m.clone()));
        }
        if let Some(m) = object.downcast_ref::<SyncRequest>() {
            return Ok(Message::Sync(m.clone()));
        }
        if let Some(m) = object.downcast_ref::<Ack>() {
            return Ok(Message::Ack(m.clone()));
        }
        if let Some(m) = object.downcast_ref::<Diff>() {
            return Ok(Message::Diff(m.clone()));
        }
        Err(CodecError::TypeMismatch("message"))
    }

    pub fn into_object(self) -> Object {
        match self {
            Message::Hello(m) => Arc::new(m),
            Message::Sync(m) => Arc::new(m),
            Message::Ack(m) => Arc::new(m),
            Message::Diff(m) => Arc::new(m),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello(_) => Hello::CLASS_NAME,
            Message::Sync(_) => SyncRequest::CLASS_NAME,
            Message::Ack(_) => Ack::CLASS_NAME,
            Message::Diff(_) => Diff::CLASS_NAME,
        }
    }
}
