use bytes::{Buf, BufMut};

use crate::error::{ProtoError, Result};
use crate::iotype::{ArrayLayout, IoBuffer};
use crate::param::ParamType;

const CODE_INT: u8 = 1;
const CODE_FLOAT: u8 = 2;
const CODE_DOUBLE: u8 = 3;
const CODE_CHAR: u8 = 4;
const CODE_BIN: u8 = 5;

/// Type code plus little-endian element count.
const HEADER_LEN: usize = 5;

/// One block of typed samples moved through an I/O type.
///
/// In a buffer each slice is a record: a type code, the element count, then
/// the elements little-endian. `Char` and `Bin` count bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSlice {
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Char(String),
    Bin(Vec<u8>),
}

impl DataSlice {
    pub fn data_type(&self) -> ParamType {
        match self {
            DataSlice::Int(_) => ParamType::Int,
            DataSlice::Float(_) => ParamType::Float,
            DataSlice::Double(_) => ParamType::Double,
            DataSlice::Char(_) => ParamType::Char,
            DataSlice::Bin(_) => ParamType::Bin,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataSlice::Int(v) => v.len(),
            DataSlice::Float(v) => v.len(),
            DataSlice::Double(v) => v.len(),
            DataSlice::Char(text) => text.len(),
            DataSlice::Bin(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn code(&self) -> u8 {
        match self {
            DataSlice::Int(_) => CODE_INT,
            DataSlice::Float(_) => CODE_FLOAT,
            DataSlice::Double(_) => CODE_DOUBLE,
            DataSlice::Char(_) => CODE_CHAR,
            DataSlice::Bin(_) => CODE_BIN,
        }
    }

    /// Append this slice to `buffer` as one record.
    pub fn write_to(&self, buffer: &mut IoBuffer) -> Result<()> {
        let count = u32::try_from(self.len()).map_err(|_| {
            ProtoError::InvalidArgument(format!("data slice of {} elements is too long", self.len()))
        })?;
        let width = element_width(self.code()).unwrap_or(1);
        let mut record = Vec::new();
        record
            .try_reserve(HEADER_LEN + self.len() * width)
            .map_err(|_| ProtoError::Capacity(HEADER_LEN + self.len() * width))?;
        record.put_u8(self.code());
        record.put_u32_le(count);
        match self {
            DataSlice::Int(v) => v.iter().for_each(|x| record.put_i32_le(*x)),
            DataSlice::Float(v) => v.iter().for_each(|x| record.put_f32_le(*x)),
            DataSlice::Double(v) => v.iter().for_each(|x| record.put_f64_le(*x)),
            DataSlice::Char(text) => record.put_slice(text.as_bytes()),
            DataSlice::Bin(bytes) => record.put_slice(bytes),
        }
        buffer.extend(&record)
    }

    /// Decode the record at the front of `bytes`. Returns the slice and the
    /// number of bytes it took up.
    pub fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut header = bytes;
        if header.remaining() < HEADER_LEN {
            return Err(ProtoError::InvalidArgument(format!(
                "data record header needs {HEADER_LEN} bytes, {} left",
                header.remaining()
            )));
        }
        let code = header.get_u8();
        let count = header.get_u32_le() as usize;
        let width = element_width(code).ok_or_else(|| {
            ProtoError::InvalidArgument(format!("unknown data type code {code}"))
        })?;
        let size = count
            .checked_mul(width)
            .filter(|size| *size <= header.remaining())
            .ok_or_else(|| {
                ProtoError::InvalidArgument(format!(
                    "data record of {count} elements overruns the buffer"
                ))
            })?;

        let payload = &header[..size];
        let mut elements = payload;
        let slice = match code {
            CODE_INT => DataSlice::Int((0..count).map(|_| elements.get_i32_le()).collect()),
            CODE_FLOAT => DataSlice::Float((0..count).map(|_| elements.get_f32_le()).collect()),
            CODE_DOUBLE => DataSlice::Double((0..count).map(|_| elements.get_f64_le()).collect()),
            CODE_CHAR => DataSlice::Char(String::from_utf8(payload.to_vec()).map_err(|_| {
                ProtoError::InvalidArgument("character data is not valid UTF-8".into())
            })?),
            _ => DataSlice::Bin(payload.to_vec()),
        };
        Ok((slice, HEADER_LEN + size))
    }

    /// Reorder a numeric slice holding exactly one block of `layout`.
    ///
    /// Slices of another length, and character or binary data, are returned
    /// as they are.
    pub fn reordered(self, layout: &ArrayLayout) -> Result<Self> {
        if self.len() != layout.element_count() {
            return Ok(self);
        }
        Ok(match self {
            DataSlice::Int(v) => DataSlice::Int(layout.reorder(&v)?),
            DataSlice::Float(v) => DataSlice::Float(layout.reorder(&v)?),
            DataSlice::Double(v) => DataSlice::Double(layout.reorder(&v)?),
            other => other,
        })
    }
}

fn element_width(code: u8) -> Option<usize> {
    match code {
        CODE_INT | CODE_FLOAT => Some(4),
        CODE_DOUBLE => Some(8),
        CODE_CHAR | CODE_BIN => Some(1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iotype::ArrayOrdering;

    fn read_all(bytes: &[u8]) -> Vec<DataSlice> {
        let mut out = Vec::new();
        let mut at = 0;
        while at < bytes.len() {
            let (slice, used) = DataSlice::read_from(&bytes[at..]).unwrap();
            out.push(slice);
            at += used;
        }
        out
    }

    #[test]
    fn records_follow_each_other_in_a_buffer() {
        let slices = vec![
            DataSlice::Int(vec![-1, 0, 7]),
            DataSlice::Double(vec![0.25, -1e300]),
            DataSlice::Char("héllo".into()),
            DataSlice::Float(Vec::new()),
            DataSlice::Bin(vec![0, 255, 10]),
        ];
        let mut buffer = IoBuffer::default();
        for slice in &slices {
            slice.write_to(&mut buffer).unwrap();
        }
        assert_eq!(read_all(buffer.as_slice()), slices);
    }

    #[test]
    fn record_layout_is_little_endian() {
        let mut buffer = IoBuffer::default();
        DataSlice::Int(vec![0x0102_0304]).write_to(&mut buffer).unwrap();
        assert_eq!(buffer.as_slice(), &[1, 1, 0, 0, 0, 4, 3, 2, 1]);
    }

    #[test]
    fn damaged_records_are_rejected() {
        assert!(DataSlice::read_from(&[1, 0]).is_err());
        assert!(DataSlice::read_from(&[9, 0, 0, 0, 0]).is_err());
        // claims two ints, carries one
        assert!(DataSlice::read_from(&[1, 2, 0, 0, 0, 1, 0, 0, 0]).is_err());
        assert!(DataSlice::read_from(&[1, 255, 255, 255, 255]).is_err());
        assert!(DataSlice::read_from(&[4, 1, 0, 0, 0, 0xff]).is_err());
    }

    #[test]
    fn only_whole_numeric_blocks_are_reordered() {
        let layout =
            ArrayLayout::new(ArrayOrdering::ColumnMajor, [2, 2, 1], [2, 2, 1], [0, 0, 0]).unwrap();

        let block = DataSlice::Double(vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(
            block.reordered(&layout).unwrap(),
            DataSlice::Double(vec![0.0, 2.0, 1.0, 3.0])
        );

        let short = DataSlice::Int(vec![1, 2, 3]);
        assert_eq!(short.clone().reordered(&layout).unwrap(), short);
        let text = DataSlice::Char("abcd".into());
        assert_eq!(text.clone().reordered(&layout).unwrap(), text);
    }
}
