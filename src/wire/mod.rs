//! Wire Codec
//!
//! Identity-preserving object serialization. Class metadata is sent once
//! per stream and objects already written are sent as back-references, so
//! shared structure survives a round trip.
//!
//! ```rust,ignore
//! use revflow::wire::{read, write, Object, ReadContext, WriteContext};
//!
//! let shared: Object = Arc::new(Value::from("x"));
//! let list: Object = Arc::new(vec![shared.clone(), shared]);
//!
//! let mut out = WriteContext::default();
//! write(&mut out, &list)?;
//! let decoded = read(&mut ReadContext::from(out.take()))?;
//! ```

mod builtins;
mod context;
mod message;
mod protocol;
mod registry;
mod varint;

pub use context::{Object, ReadContext, WriteContext};
pub use message::{Ack, Diff, DiffBody, DiffOp, Hello, Message, SyncRequest};
pub use protocol::{
    read, read_shared, read_value, write, write_value, CodecError, CLASS_DEFINITION,
    CLASS_REFERENCE, REFERENCE,
};
pub use registry::{Codec, Probe, ReadFn, Registry, RegistryBuilder, Wire, WriteFn};
pub use varint::{
    read_bool, read_bytes, read_f32, read_i32, read_i64, read_string, write_bool, write_bytes,
    write_f32, write_i32, write_i64, write_str,
};
