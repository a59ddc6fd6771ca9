//! Table schemas, typed values, and the tuple wire format.
//!
//! A tuple is serialized as the catenation of the fixed-size fields in
//! declaration order, padded to 4-byte alignment, followed by each
//! variable-size field as a 4-byte little-endian length prefix plus bytes
//! padded to 4-byte alignment, with the whole tuple padded to 8 bytes.

use serde::{Deserialize, Serialize};

use verso_error::{Result, VersoError};

/// Round `n` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// The type of a single schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Smallint,
    Int,
    Bigint,
    Float,
    Double,
    Text,
    Blob,
}

impl FieldType {
    /// The in-tuple byte width for fixed-size types, `None` for
    /// variable-size types.
    #[inline]
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Smallint => Some(2),
            Self::Int => Some(4),
            Self::Bigint | Self::Double => Some(8),
            Self::Float => Some(4),
            Self::Text | Self::Blob => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_fixed(self) -> bool {
        self.fixed_size().is_some()
    }
}

/// A named, typed schema field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// An ordered list of typed, named fields plus the derived layout facts the
/// storage layer needs: per-fixed-field offsets, the fixed region size, and
/// the variable field count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
    /// Byte offset of each fixed-size field inside the fixed region, in
    /// declaration order of the fixed fields.
    fixed_offsets: Vec<usize>,
    /// Unpadded sum of the fixed-size field widths.
    fixed_len: usize,
    var_count: usize,
}

impl Schema {
    /// Build a schema, validating field names are unique and non-empty.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        if fields.is_empty() {
            return Err(VersoError::InvalidTuple {
                reason: "schema has no fields",
            });
        }
        for (i, f) in fields.iter().enumerate() {
            if f.name.is_empty() {
                return Err(VersoError::InvalidTuple {
                    reason: "empty field name",
                });
            }
            if fields[..i].iter().any(|g| g.name == f.name) {
                return Err(VersoError::InvalidTuple {
                    reason: "duplicate field name",
                });
            }
        }
        let mut fixed_offsets = Vec::new();
        let mut fixed_len = 0usize;
        let mut var_count = 0usize;
        for f in &fields {
            match f.field_type.fixed_size() {
                Some(sz) => {
                    fixed_offsets.push(fixed_len);
                    fixed_len += sz;
                }
                None => var_count += 1,
            }
        }
        Ok(Self {
            fields,
            fixed_offsets,
            fixed_len,
            var_count,
        })
    }

    #[inline]
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Widths of the fixed-size fields in declaration order.
    pub fn fixed_field_lens(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .filter_map(|f| f.field_type.fixed_size())
    }

    /// `(offset, width)` of each fixed-size field inside the fixed region,
    /// in declaration order.
    pub fn fixed_field_layout(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.fixed_offsets
            .iter()
            .copied()
            .zip(self.fixed_field_lens())
    }

    /// Unpadded size of the fixed region.
    #[inline]
    #[must_use]
    pub fn fixed_len(&self) -> usize {
        self.fixed_len
    }

    /// Offset of the variable region inside a serialized tuple.
    #[inline]
    #[must_use]
    pub fn var_offset(&self) -> usize {
        align_up(self.fixed_len, 4)
    }

    #[inline]
    #[must_use]
    pub fn var_field_count(&self) -> usize {
        self.var_count
    }

    /// The fixed region of a serialized tuple.
    #[inline]
    #[must_use]
    pub fn fixed_region<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[..self.fixed_len]
    }

    /// The variable region of a serialized tuple: every length-prefixed
    /// variable field, without the trailing tuple pad.
    #[must_use]
    pub fn var_region<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.var_offset();
        let mut cursor = start;
        for _ in 0..self.var_count {
            let len = read_u32(data, cursor);
            cursor += 4 + align_up(len as usize, 4);
        }
        &data[start..cursor]
    }

    /// Iterate the variable fields of a serialized tuple as
    /// `(offset_in_tuple, value_bytes)` pairs; `offset_in_tuple` points at
    /// the 4-byte length prefix.
    pub fn var_fields<'a>(&self, data: &'a [u8]) -> VarFieldIter<'a> {
        VarFieldIter {
            data,
            cursor: self.var_offset(),
            remaining: self.var_count,
        }
    }

    /// Check that `data` is a well-formed tuple for this schema.
    pub fn validate(&self, data: &[u8]) -> Result<()> {
        let mut cursor = self.var_offset();
        if data.len() < cursor {
            return Err(VersoError::InvalidTuple {
                reason: "tuple shorter than fixed region",
            });
        }
        for _ in 0..self.var_count {
            if data.len() < cursor + 4 {
                return Err(VersoError::InvalidTuple {
                    reason: "truncated variable field length",
                });
            }
            let len = read_u32(data, cursor) as usize;
            cursor += 4;
            if data.len() < cursor + len {
                return Err(VersoError::InvalidTuple {
                    reason: "truncated variable field data",
                });
            }
            cursor += align_up(len, 4);
        }
        if data.len() != align_up(cursor, 8) {
            return Err(VersoError::InvalidTuple {
                reason: "tuple length does not match schema",
            });
        }
        Ok(())
    }

    /// Serialize one typed value per field, in declaration order.
    pub fn serialize(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(VersoError::InvalidTuple {
                reason: "value count does not match schema",
            });
        }
        for (f, v) in self.fields.iter().zip(values) {
            if !v.matches(f.field_type) {
                return Err(VersoError::InvalidTuple {
                    reason: "value type does not match field type",
                });
            }
        }
        let mut out = Vec::with_capacity(self.fixed_len + 16);
        for v in values.iter().filter(|v| v.is_fixed()) {
            v.write_fixed(&mut out);
        }
        pad_to(&mut out, 4);
        for v in values.iter().filter(|v| !v.is_fixed()) {
            let bytes = v.var_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
            pad_to(&mut out, 4);
        }
        pad_to(&mut out, 8);
        Ok(out)
    }
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    buf.resize(align_up(buf.len(), align), 0);
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().expect("4-byte slice"))
}

/// Iterator over the variable fields of a serialized tuple.
pub struct VarFieldIter<'a> {
    data: &'a [u8],
    cursor: usize,
    remaining: usize,
}

impl<'a> Iterator for VarFieldIter<'a> {
    /// `(offset of the length prefix, value bytes)`.
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let at = self.cursor;
        let len = read_u32(self.data, at) as usize;
        let value = &self.data[at + 4..at + 4 + len];
        self.cursor = at + 4 + align_up(len, 4);
        Some((at, value))
    }
}

/// A typed field value, used to build tuples without hand-encoding bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Smallint(i16),
    Int(i32),
    Bigint(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn matches(&self, t: FieldType) -> bool {
        matches!(
            (self, t),
            (Self::Smallint(_), FieldType::Smallint)
                | (Self::Int(_), FieldType::Int)
                | (Self::Bigint(_), FieldType::Bigint)
                | (Self::Float(_), FieldType::Float)
                | (Self::Double(_), FieldType::Double)
                | (Self::Text(_), FieldType::Text)
                | (Self::Blob(_), FieldType::Blob)
        )
    }

    #[must_use]
    fn is_fixed(&self) -> bool {
        !matches!(self, Self::Text(_) | Self::Blob(_))
    }

    fn write_fixed(&self, out: &mut Vec<u8>) {
        match self {
            Self::Smallint(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Bigint(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Text(_) | Self::Blob(_) => unreachable!("variable value in fixed writer"),
        }
    }

    #[must_use]
    fn var_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Blob(b) => b,
            _ => unreachable!("fixed value in variable writer"),
        }
    }
}
