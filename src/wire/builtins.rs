//! Built-in Wire Classes
//!
//! Primitives, lists and the domain value objects.

use crate::domain::value_objects::{Column, ForeignKey, Table, Value};
use crate::replication::NodeId;
use crate::wire::context::{Object, ReadContext, WriteContext};
use crate::wire::protocol::{read, read_value, write, write_value, CodecError};
use crate::wire::registry::{is_text, read_text, write_text, Codec, RegistryBuilder, Wire, TEXT};
use crate::wire::varint::{
    read_bool, read_bytes, read_f32, read_i32, read_i64, read_string, read_u8, write_bool,
    write_bytes, write_f32, write_i32, write_i64, write_str,
};
use bytes::BufMut;

pub(crate) fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register::<bool>()
        .register::<i32>()
        .register::<i64>()
        .register::<f32>()
        .register::<Vec<u8>>()
        .register::<Vec<Object>>()
        .register::<Column>()
        .register::<Table>()
        .register::<ForeignKey>()
        .register::<Value>()
        .register::<NodeId>()
        .capability(is_text, Codec::new(TEXT, write_text, read_text))
}

impl Wire for bool {
    const CLASS_NAME: &'static str = "bool";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_bool(&mut ctx.out, *self);
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        read_bool(&mut ctx.input)
    }
}

impl Wire for i32 {
    const CLASS_NAME: &'static str = "int";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_i32(&mut ctx.out, *self);
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        read_i32(&mut ctx.input)
    }
}

impl Wire for i64 {
    const CLASS_NAME: &'static str = "long";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_i64(&mut ctx.out, *self);
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        read_i64(&mut ctx.input)
    }
}

impl Wire for f32 {
    const CLASS_NAME: &'static str = "float";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_f32(&mut ctx.out, *self);
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        read_f32(&mut ctx.input)
    }
}

impl Wire for Vec<u8> {
    const CLASS_NAME: &'static str = "bytes";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_bytes(&mut ctx.out, self);
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        Ok(read_bytes(&mut ctx.input)?.to_vec())
    }
}

/// Elements are full objects, so shared elements stay shared.
impl Wire for Vec<Object> {
    const CLASS_NAME: &'static str = "list";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_len(ctx, self.len())?;
        for element in self {
            write(ctx, element)?;
        }
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        let len = read_len(ctx)?;
        let mut list = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            list.push(read(ctx)?);
        }
        Ok(list)
    }
}

impl Wire for Column {
    const CLASS_NAME: &'static str = "column";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_str(&mut ctx.out, self.id());
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        Ok(Column::new(read_string(&mut ctx.input)?))
    }
}

impl Wire for Table {
    const CLASS_NAME: &'static str = "table";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_str(&mut ctx.out, self.id());
        write_len(ctx, self.primary_key().len())?;
        for column in self.primary_key() {
            write_value(ctx, column)?;
        }
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        let id = read_string(&mut ctx.input)?;
        let len = read_len(ctx)?;
        let mut columns = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            columns.push(read_value::<Column>(ctx)?);
        }
        Ok(Table::new(id, columns))
    }
}

impl Wire for ForeignKey {
    const CLASS_NAME: &'static str = "foreign-key";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        if self.referer_columns.len() != self.referent_columns.len() {
            return Err(CodecError::InvalidValue(format!(
                "foreign key {} -> {} has mismatched columns",
                self.referer, self.referent
            )));
        }
        write_value(ctx, &self.referer)?;
        write_value(ctx, &self.referent)?;
        write_len(ctx, self.referer_columns.len())?;
        for (referer, referent) in self.referer_columns.iter().zip(&self.referent_columns) {
            write_value(ctx, referer)?;
            write_value(ctx, referent)?;
        }
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        let referer = read_value::<Table>(ctx)?;
        let referent = read_value::<Table>(ctx)?;
        let len = read_len(ctx)?;
        let mut referer_columns = Vec::with_capacity(len.min(64));
        let mut referent_columns = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            referer_columns.push(read_value::<Column>(ctx)?);
            referent_columns.push(read_value::<Column>(ctx)?);
        }
        Ok(ForeignKey::new(
            referer,
            referer_columns,
            referent,
            referent_columns,
        ))
    }
}

const VALUE_NULL: u8 = 0;
const VALUE_BOOL: u8 = 1;
const VALUE_INT: u8 = 2;
const VALUE_TEXT: u8 = 3;
const VALUE_BYTES: u8 = 4;
const VALUE_TABLE: u8 = 5;
const VALUE_COLUMN: u8 = 6;

impl Wire for Value {
    const CLASS_NAME: &'static str = "value";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        match self {
            Value::Null => ctx.out.put_u8(VALUE_NULL),
            Value::Bool(b) => {
                ctx.out.put_u8(VALUE_BOOL);
                write_bool(&mut ctx.out, *b);
            }
            Value::Int(i) => {
                ctx.out.put_u8(VALUE_INT);
                write_i64(&mut ctx.out, *i);
            }
            Value::Text(s) => {
                ctx.out.put_u8(VALUE_TEXT);
                write_str(&mut ctx.out, s);
            }
            Value::Bytes(b) => {
                ctx.out.put_u8(VALUE_BYTES);
                write_bytes(&mut ctx.out, b);
            }
            Value::Table(t) => {
                ctx.out.put_u8(VALUE_TABLE);
                write_value(ctx, t)?;
            }
            Value::Column(c) => {
                ctx.out.put_u8(VALUE_COLUMN);
                write_value(ctx, c)?;
            }
        }
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        Ok(match read_u8(&mut ctx.input)? {
            VALUE_NULL => Value::Null,
            VALUE_BOOL => Value::Bool(read_bool(&mut ctx.input)?),
            VALUE_INT => Value::Int(read_i64(&mut ctx.input)?),
            VALUE_TEXT => Value::Text(read_string(&mut ctx.input)?),
            VALUE_BYTES => Value::Bytes(read_bytes(&mut ctx.input)?.to_vec()),
            VALUE_TABLE => Value::Table(read_value(ctx)?),
            VALUE_COLUMN => Value::Column(read_value(ctx)?),
            kind => return Err(CodecError::InvalidValue(format!("value kind {}", kind))),
        })
    }
}

impl Wire for NodeId {
    const CLASS_NAME: &'static str = "node-id";

    fn write_to(&self, ctx: &mut WriteContext) -> Result<(), CodecError> {
        write_str(&mut ctx.out, self.as_str());
        Ok(())
    }

    fn read_from(ctx: &mut ReadContext) -> Result<Self, CodecError> {
        Ok(NodeId::new(read_string(&mut ctx.input)?))
    }
}

fn write_len(ctx: &mut WriteContext, len: usize) -> Result<(), CodecError> {
    let len = i32::try_from(len)
        .map_err(|_| CodecError::InvalidValue(format!("length {} too large", len)))?;
    write_i32(&mut ctx.out, len);
    Ok(())
}

fn read_len(ctx: &mut ReadContext) -> Result<usize, CodecError> {
    let len = read_i32(&mut ctx.input)?;
    usize::try_from(len).map_err(|_| CodecError::InvalidValue(format!("negative length {}", len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn round_trip<T: Wire + Clone>(value: &T) -> T {
        let mut writer = WriteContext::default();
        write_value(&mut writer, value).unwrap();
        read_value(&mut ReadContext::from(writer.take())).unwrap()
    }

    #[test]
    fn test_primitives() {
        assert!(round_trip(&true));
        assert_eq!(round_trip(&i32::MIN), i32::MIN);
        assert_eq!(round_trip(&i64::MAX), i64::MAX);
        assert_eq!(round_trip(&-0.25f32), -0.25);
        assert_eq!(round_trip(&vec![0u8, 255]), vec![0u8, 255]);
        assert_eq!(round_trip(&NodeId::new("n1")), NodeId::new("n1"));
    }

    #[test]
    fn test_foreign_key() {
        let orders = Table::new("orders", vec![Column::new("id")]);
        let lines = Table::new("lines", vec![Column::new("order"), Column::new("n")]);
        let fk = ForeignKey::new(lines, vec![Column::new("order")], orders, vec![Column::new("id")]);

        let decoded = round_trip(&fk);
        assert_eq!(decoded, fk);
        assert_eq!(decoded.referer.primary_key().len(), 2);
    }

    #[test]
    fn test_mismatched_foreign_key_is_rejected() {
        let t = Table::new("t", vec![Column::new("id")]);
        let fk = ForeignKey::new(t.clone(), vec![], t, vec![Column::new("id")]);
        let mut writer = WriteContext::default();
        assert!(matches!(
            write_value(&mut writer, &fk),
            Err(CodecError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_list_keeps_shared_elements_shared() {
        let shared: Object = Arc::new(Value::from("same"));
        let list: Object = Arc::new(vec![shared.clone(), Arc::new(1i32) as Object, shared]);

        let mut writer = WriteContext::default();
        write(&mut writer, &list).unwrap();
        let decoded = read(&mut ReadContext::from(writer.take())).unwrap();
        let decoded = decoded.downcast_ref::<Vec<Object>>().unwrap();

        assert_eq!(decoded.len(), 3);
        assert!(Arc::ptr_eq(&decoded[0], &decoded[2]));
        assert_eq!(decoded[1].downcast_ref::<i32>(), Some(&1));
    }

    #[test]
    fn test_invalid_value_kind() {
        let mut writer = WriteContext::default();
        write_value(&mut writer, &Value::Null).unwrap();
        let mut bytes = writer.take().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 42;

        let mut reader = ReadContext::from(bytes::Bytes::from(bytes));
        assert!(matches!(
            read(&mut reader),
            Err(CodecError::InvalidValue(_))
        ));
    }
}
