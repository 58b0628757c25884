//! AtomicAssets attribute serialization.
//!
//! A serialized attribute blob is a sequence of `(id, value)` pairs:
//!
//! ```text
//! id     varint   attribute position in the schema + 4
//! value  by type  intN   zigzag varint
//!                 uintN  varint
//!                 fixedN N/8 bytes, little endian
//!                 float  4 bytes LE, double 8 bytes LE
//!                 string / image  varint length + UTF-8
//!                 ipfs   varint length + multihash bytes (base58 text)
//!                 bytes  varint length + raw bytes (hex text)
//!                 bool   1 byte (0 or 1)
//!                 T[]    varint count + count × T
//! ```
//!
//! Attributes missing from an object are simply not written; ids below 4 are
//! reserved.

use shipindex_core::codec::{AttributeMap, AttributeValue, PayloadCodec};
use shipindex_core::error::DecodeError;
use shipindex_core::schema::{AttributeType, SchemaSpec};

/// Offset added to an attribute's schema position to form its wire id.
pub const RESERVED_IDS: u64 = 4;

/// The AtomicAssets attribute codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicCodec;

impl PayloadCodec for AtomicCodec {
    fn decode(&self, bytes: &[u8], spec: &SchemaSpec) -> Result<AttributeMap, DecodeError> {
        let mut reader = Reader::new(bytes);
        let mut out = AttributeMap::new();
        while !reader.is_empty() {
            let id = reader.varint()?;
            let descriptor = id
                .checked_sub(RESERVED_IDS)
                .and_then(|index| spec.attribute(index as usize))
                .ok_or_else(|| DecodeError::UnknownAttributeIndex {
                    schema: spec.name.clone(),
                    index: id,
                })?;
            let value = reader.value(&descriptor.ty)?;
            out.insert(descriptor.name.clone(), value);
        }
        Ok(out)
    }

    fn encode(&self, values: &AttributeMap, spec: &SchemaSpec) -> Result<Vec<u8>, DecodeError> {
        if let Some(unknown) = values.keys().find(|k| spec.position(k).is_none()) {
            return Err(DecodeError::UnknownAttribute(unknown.clone()));
        }
        let mut out = Vec::new();
        for (index, descriptor) in spec.attributes.iter().enumerate() {
            let Some(value) = values.get(&descriptor.name) else {
                continue;
            };
            write_varint(&mut out, index as u64 + RESERVED_IDS);
            write_value(&mut out, &descriptor.name, &descriptor.ty, value)?;
        }
        Ok(out)
    }
}

// ─── Decoding ────────────────────────────────────────────────────────────────

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.bytes.len() - self.pos;
        if n > remaining {
            return Err(DecodeError::Truncated { needed: n, remaining });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.take(1)?[0];
            if shift == 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow);
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow);
            }
        }
    }

    fn fixed(&mut self, bits: u8) -> Result<u64, DecodeError> {
        let bytes = self.take(usize::from(bits / 8))?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.varint()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.blob()?.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn value(&mut self, ty: &AttributeType) -> Result<AttributeValue, DecodeError> {
        Ok(match ty {
            AttributeType::Int(bits) => {
                let v = unzigzag(self.varint()?);
                if !int_fits(v, *bits) {
                    return Err(DecodeError::OutOfRange { ty: ty.to_string() });
                }
                AttributeValue::Int(v)
            }
            AttributeType::Uint(bits) => {
                let v = self.varint()?;
                if !uint_fits(v, *bits) {
                    return Err(DecodeError::OutOfRange { ty: ty.to_string() });
                }
                AttributeValue::Uint(v)
            }
            AttributeType::Fixed(bits) => AttributeValue::Uint(self.fixed(*bits)?),
            AttributeType::Float => {
                let raw = self.fixed(32)? as u32;
                AttributeValue::Float(f64::from(f32::from_bits(raw)))
            }
            AttributeType::Double => AttributeValue::Float(f64::from_bits(self.fixed(64)?)),
            AttributeType::String | AttributeType::Image => AttributeValue::Str(self.string()?),
            AttributeType::Ipfs => AttributeValue::Str(bs58::encode(self.blob()?).into_string()),
            AttributeType::Bytes => AttributeValue::Str(hex::encode(self.blob()?)),
            AttributeType::Bool => match self.take(1)?[0] {
                0 => AttributeValue::Bool(false),
                1 => AttributeValue::Bool(true),
                _ => return Err(DecodeError::OutOfRange { ty: ty.to_string() }),
            },
            AttributeType::Array(inner) => {
                let count = self.varint()? as usize;
                // Every element takes at least one byte.
                if count > self.bytes.len() - self.pos {
                    return Err(DecodeError::Truncated {
                        needed: count,
                        remaining: self.bytes.len() - self.pos,
                    });
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.value(inner)?);
                }
                AttributeValue::Array(items)
            }
        })
    }
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn int_fits(v: i64, bits: u8) -> bool {
    bits >= 64 || {
        let limit = 1i64 << (bits - 1);
        (-limit..limit).contains(&v)
    }
}

fn uint_fits(v: u64, bits: u8) -> bool {
    bits >= 64 || v < (1u64 << bits)
}

// ─── Encoding ────────────────────────────────────────────────────────────────

fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn mismatch(attribute: &str, ty: &AttributeType) -> DecodeError {
    DecodeError::TypeMismatch {
        attribute: attribute.to_string(),
        expected: ty.to_string(),
    }
}

fn write_value(
    out: &mut Vec<u8>,
    name: &str,
    ty: &AttributeType,
    value: &AttributeValue,
) -> Result<(), DecodeError> {
    let out_of_range = || DecodeError::OutOfRange { ty: ty.to_string() };
    match (ty, value) {
        (AttributeType::Int(bits), _) => {
            let v = match value {
                AttributeValue::Int(i) => *i,
                AttributeValue::Uint(u) => i64::try_from(*u).map_err(|_| out_of_range())?,
                _ => return Err(mismatch(name, ty)),
            };
            if !int_fits(v, *bits) {
                return Err(out_of_range());
            }
            write_varint(out, zigzag(v));
        }
        (AttributeType::Uint(bits) | AttributeType::Fixed(bits), _) => {
            let v = match value {
                AttributeValue::Uint(u) => *u,
                AttributeValue::Int(i) => u64::try_from(*i).map_err(|_| out_of_range())?,
                _ => return Err(mismatch(name, ty)),
            };
            if !uint_fits(v, *bits) {
                return Err(out_of_range());
            }
            if matches!(ty, AttributeType::Fixed(_)) {
                out.extend_from_slice(&v.to_le_bytes()[..usize::from(bits / 8)]);
            } else {
                write_varint(out, v);
            }
        }
        (AttributeType::Float, AttributeValue::Float(f)) => {
            out.extend_from_slice(&(*f as f32).to_le_bytes());
        }
        (AttributeType::Double, AttributeValue::Float(f)) => {
            out.extend_from_slice(&f.to_le_bytes());
        }
        (AttributeType::String | AttributeType::Image, AttributeValue::Str(s)) => {
            write_blob(out, s.as_bytes());
        }
        (AttributeType::Ipfs, AttributeValue::Str(s)) => {
            let hash = bs58::decode(s).into_vec().map_err(|_| mismatch(name, ty))?;
            write_blob(out, &hash);
        }
        (AttributeType::Bytes, AttributeValue::Str(s)) => {
            let raw = hex::decode(s).map_err(|_| mismatch(name, ty))?;
            write_blob(out, &raw);
        }
        (AttributeType::Bool, AttributeValue::Bool(b)) => out.push(u8::from(*b)),
        (AttributeType::Array(inner), AttributeValue::Array(items)) => {
            write_varint(out, items.len() as u64);
            for item in items {
                write_value(out, name, inner, item)?;
            }
        }
        _ => return Err(mismatch(name, ty)),
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
