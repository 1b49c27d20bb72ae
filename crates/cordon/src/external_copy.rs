//! Detached value snapshots.
//!
//! An [`ExternalCopy`] owns an independent serialized snapshot of a value.
//! It has no owning isolate and can be materialized into any live context,
//! always producing a brand-new value with no aliasing to the original.
//! The payload format is CBOR.

use std::convert::Infallible;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    error::{Error, Result},
    value::{PlainValue, Value},
};

#[derive(Clone, Debug)]
pub struct ExternalCopy {
    payload: Bytes,
    byte_size: usize,
}

impl ExternalCopy {
    /// Snapshot a value.
    ///
    /// # Errors
    /// Fails with [`Error::NotClonable`] if the value transitively contains a
    /// live reference; references are capabilities, not data.
    pub fn of(value: &Value) -> Result<Self> {
        let plain = value.to_plain()?;
        let mut serializer = minicbor_serde::Serializer::new(PayloadWriter::default());
        plain
            .serialize(serializer.serialize_unit_as_null(true))
            .map_err(|e| Error::Engine(anyhow::anyhow!(e)))?;
        Ok(Self {
            payload: serializer.into_encoder().into_writer().freeze(),
            byte_size: value.byte_size(),
        })
    }

    /// Materialize the snapshot host-side.
    ///
    /// # Errors
    /// Fails if the payload cannot be decoded.
    pub fn copy(&self) -> Result<Value> {
        let mut deserializer = minicbor_serde::Deserializer::new(&self.payload);
        let plain = PlainValue::deserialize(&mut deserializer)
            .map_err(|e| Error::Engine(anyhow::anyhow!(e)))?;
        Ok(Value::from_plain(plain))
    }

    /// Materialize the snapshot as a fresh value for `context`.
    ///
    /// The result does not alias the original in any way. Heap residency is
    /// charged when the value is installed into the context (for example via
    /// [`Reference::set`](crate::reference::Reference::set)), not here.
    ///
    /// # Errors
    /// Fails with [`Error::Disposed`] if the context's isolate is gone.
    pub fn copy_into(&self, context: &Context) -> Result<Value> {
        let _core = context.core()?;
        self.copy()
    }

    /// Accounted footprint the snapshot will occupy once materialized.
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        self.byte_size
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Deep-clone a value through the snapshot format, guaranteeing the result
/// shares no structure with the input. This is the marshaling step every
/// bridge argument and return value goes through.
pub(crate) fn detach(value: &Value) -> Result<Value> {
    ExternalCopy::of(value)?.copy()
}

#[derive(Default)]
struct PayloadWriter(BytesMut);

impl PayloadWriter {
    fn freeze(self) -> Bytes {
        self.0.freeze()
    }
}

impl minicbor::encode::Write for PayloadWriter {
    type Error = Infallible;

    fn write_all(&mut self, buf: &[u8]) -> core::result::Result<(), Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(())
    }
}
