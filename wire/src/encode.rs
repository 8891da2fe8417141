//! The typed writing surface shared by all output streams.
//!
//! Streams implement [`std::io::Write`] for raw byte output; this module
//! layers the typed surface on top. Plain values and flat arrays go out as
//! their byte image (peers are assumed same-endian for those, as for the rest
//! of the wire format); counted containers carry a little-endian `u64` element
//! count. Nested values implement [`Encode`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Write;

use uuid::Uuid;
use zerocopy::AsBytes;

/// A value that can serialise itself into an output stream.
///
/// The element layout must match the symmetric decode on the receiver; the
/// stream itself never validates content.
pub trait Encode {
    /// Writes the wire form of `self` to `out`.
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()>;
}

macro_rules! impl_encode_le {
    ($($t:ty),*) => {
        $(impl Encode for $t {
            fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
                out.write_all(&self.to_le_bytes())
            }
        })*
    };
}

impl_encode_le!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Encode for bool {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(&[u8::from(*self)])
    }
}

impl Encode for Uuid {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(self.as_bytes())
    }
}

impl Encode for str {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write_count(out, self.len())?;
        out.write_all(self.as_bytes())
    }
}

impl Encode for String {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        self.as_str().encode(out)
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write_count(out, self.len())?;
        for item in self {
            item.encode(out)?;
        }
        Ok(())
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write_entries(out, self.len(), self.iter())
    }
}

impl<K: Encode, V: Encode> Encode for HashMap<K, V> {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write_entries(out, self.len(), self.iter())
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write_count(out, self.len())?;
        for item in self {
            item.encode(out)?;
        }
        Ok(())
    }
}

impl<T: Encode> Encode for HashSet<T> {
    fn encode(&self, out: &mut dyn Write) -> std::io::Result<()> {
        write_count(out, self.len())?;
        for item in self {
            item.encode(out)?;
        }
        Ok(())
    }
}

fn write_count(out: &mut dyn Write, count: usize) -> std::io::Result<()> {
    out.write_all(&(count as u64).to_le_bytes())
}

fn write_entries<'a, K: Encode + 'a, V: Encode + 'a>(
    out: &mut dyn Write,
    count: usize,
    entries: impl Iterator<Item = (&'a K, &'a V)>,
) -> std::io::Result<()> {
    write_count(out, count)?;
    for (key, value) in entries {
        key.encode(out)?;
        value.encode(out)?;
    }
    Ok(())
}

/// Typed writing shorthands for any byte sink.
pub trait WireWriteExt: Write {
    /// Writes a plain trivially-copyable value as its byte image.
    fn put<T: AsBytes>(&mut self, value: &T) -> std::io::Result<()>
    where
        Self: Sized,
    {
        self.write_all(value.as_bytes())
    }

    /// Writes a contiguous array of trivially-copyable values as its byte
    /// image, without a count.
    fn put_array<T: AsBytes>(&mut self, values: &[T]) -> std::io::Result<()>
    where
        Self: Sized,
    {
        self.write_all(values.as_bytes())
    }

    /// Writes a contiguous array of non-trivial values element by element,
    /// without a count.
    fn put_items<T: Encode>(&mut self, values: &[T]) -> std::io::Result<()>
    where
        Self: Sized,
    {
        for item in values {
            item.encode(self)?;
        }
        Ok(())
    }

    /// Writes an ordered sequence: `u64` count, then the elements.
    fn put_seq<T: Encode>(&mut self, values: &[T]) -> std::io::Result<()>
    where
        Self: Sized,
    {
        write_count(self, values.len())?;
        self.put_items(values)
    }

    /// Flat fast path of [`WireWriteExt::put_seq`] for trivially-copyable
    /// element types: `u64` count, then the byte image.
    fn put_pod_seq<T: AsBytes>(&mut self, values: &[T]) -> std::io::Result<()>
    where
        Self: Sized,
    {
        write_count(self, values.len())?;
        self.write_all(values.as_bytes())
    }

    /// Writes a length-prefixed UTF-8 string.
    fn put_str(&mut self, value: &str) -> std::io::Result<()>
    where
        Self: Sized,
    {
        value.encode(self)
    }

    /// Writes any [`Encode`] value.
    fn put_value<T: Encode + ?Sized>(&mut self, value: &T) -> std::io::Result<()>
    where
        Self: Sized,
    {
        value.encode(self)
    }

    /// Writes the stable identifier of a nested object.
    ///
    /// The caller must have registered or mapped the object beforehand; the
    /// stream does not validate the reference.
    fn put_object_ref(&mut self, id: &Uuid) -> std::io::Result<()>
    where
        Self: Sized,
    {
        self.write_all(id.as_bytes())
    }
}

impl<W: Write + ?Sized> WireWriteExt for W {}
