use std::fmt;
use std::str::FromStr;

use crate::error::{ProtoError, Result};
use crate::handle::Handle;
use crate::message::{ChkDef, IoDef};
use crate::param::SharedValue;
use crate::table::{validate_label, Labeled};

/// Direction of an I/O or checkpoint type, seen from the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    In,
    Out,
    InOut,
}

impl IoDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            IoDirection::In => "IN",
            IoDirection::Out => "OUT",
            IoDirection::InOut => "INOUT",
        }
    }

    pub fn emits(self) -> bool {
        matches!(self, IoDirection::Out | IoDirection::InOut)
    }

    pub fn consumes(self) -> bool {
        matches!(self, IoDirection::In | IoDirection::InOut)
    }
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IoDirection {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IN" => Ok(IoDirection::In),
            "OUT" => Ok(IoDirection::Out),
            "INOUT" => Ok(IoDirection::InOut),
            other => Err(ProtoError::InvalidArgument(format!(
                "unknown direction '{other}'"
            ))),
        }
    }
}

/// Staging buffer for data moved by one I/O type.
#[derive(Debug, Clone, Default)]
pub struct IoBuffer {
    data: Vec<u8>,
}

impl IoBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Append bytes, growing the buffer if needed.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        self.data
            .try_reserve(bytes.len())
            .map_err(|_| ProtoError::Capacity(self.data.len() + bytes.len()))?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn occupied(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Element order of a 3-D array block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOrdering {
    /// First index varies fastest (Fortran order).
    ColumnMajor,
    /// Last index varies fastest (C order).
    RowMajor,
}

impl ArrayOrdering {
    pub fn flipped(self) -> Self {
        match self {
            ArrayOrdering::ColumnMajor => ArrayOrdering::RowMajor,
            ArrayOrdering::RowMajor => ArrayOrdering::ColumnMajor,
        }
    }
}

/// Shape of a local block within a global 3-D array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout {
    pub ordering: ArrayOrdering,
    pub global: [usize; 3],
    pub local: [usize; 3],
    pub origin: [usize; 3],
}

impl ArrayLayout {
    pub fn new(
        ordering: ArrayOrdering,
        global: [usize; 3],
        local: [usize; 3],
        origin: [usize; 3],
    ) -> Result<Self> {
        for dim in 0..3 {
            let end = origin[dim].checked_add(local[dim]);
            if end.is_none_or(|end| end > global[dim]) {
                return Err(ProtoError::InvalidArgument(format!(
                    "local block exceeds global extent in dimension {dim}"
                )));
            }
        }
        Ok(Self {
            ordering,
            global,
            local,
            origin,
        })
    }

    pub fn element_count(&self) -> usize {
        self.local.iter().product()
    }

    /// Copy `data` (laid out per `self.ordering`) into the opposite ordering.
    pub fn reorder<T: Copy>(&self, data: &[T]) -> Result<Vec<T>> {
        if data.len() != self.element_count() {
            return Err(ProtoError::InvalidArgument(format!(
                "array block has {} elements, layout expects {}",
                data.len(),
                self.element_count()
            )));
        }

        let [nx, ny, nz] = self.local;
        let col = |i: usize, j: usize, k: usize| i + nx * (j + ny * k);
        let row = |i: usize, j: usize, k: usize| k + nz * (j + ny * i);

        let mut out = data.to_vec();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    match self.ordering {
                        ArrayOrdering::ColumnMajor => out[row(i, j, k)] = data[col(i, j, k)],
                        ArrayOrdering::RowMajor => out[col(i, j, k)] = data[row(i, j, k)],
                    }
                }
            }
        }
        Ok(out)
    }

    /// The layout describing the output of [`ArrayLayout::reorder`].
    pub fn reordered(&self) -> Self {
        Self {
            ordering: self.ordering.flipped(),
            ..*self
        }
    }
}

/// A registered I/O channel (sample emission or consumption).
#[derive(Debug)]
pub struct IoTypeEntry {
    label: String,
    direction: IoDirection,
    frequency: SharedValue<i32>,
    freq_param: Handle,
    enabled: bool,
    buffer: IoBuffer,
    layout: Option<ArrayLayout>,
}

impl IoTypeEntry {
    pub fn new(label: impl Into<String>, direction: IoDirection, frequency: i32) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        if frequency < 0 {
            return Err(ProtoError::InvalidArgument(format!(
                "negative frequency {frequency} for '{label}'"
            )));
        }
        Ok(Self {
            label,
            direction,
            frequency: SharedValue::new(frequency),
            freq_param: Handle::NOT_SET,
            enabled: true,
            buffer: IoBuffer::default(),
            layout: None,
        })
    }

    pub fn from_def(def: &IoDef) -> Result<Self> {
        let mut entry = Self::new(def.label.clone(), def.direction, def.frequency.max(0))?;
        entry.freq_param = def.freq_handle;
        Ok(entry)
    }

    pub fn to_def(&self, handle: Handle) -> IoDef {
        IoDef {
            handle,
            label: self.label.clone(),
            direction: self.direction,
            frequency: self.frequency(),
            freq_handle: self.freq_param,
        }
    }

    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    pub fn frequency(&self) -> i32 {
        self.frequency.get()
    }

    /// The cell shared with the `<label>_FREQ` parameter.
    pub fn frequency_cell(&self) -> &SharedValue<i32> {
        &self.frequency
    }

    pub fn freq_param(&self) -> Handle {
        self.freq_param
    }

    pub fn set_freq_param(&mut self, handle: Handle) {
        self.freq_param = handle;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether an automatic emission is due at `seq_num`.
    pub fn is_due(&self, seq_num: i64) -> bool {
        let freq = self.frequency();
        self.enabled && self.direction.emits() && freq > 0 && seq_num % i64::from(freq) == 0
    }

    pub fn buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut IoBuffer {
        &mut self.buffer
    }

    pub fn layout(&self) -> Option<&ArrayLayout> {
        self.layout.as_ref()
    }

    pub fn set_layout(&mut self, layout: Option<ArrayLayout>) {
        self.layout = layout;
    }
}

impl Labeled for IoTypeEntry {
    fn label(&self) -> &str {
        &self.label
    }
}

/// A registered checkpoint type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkTypeEntry {
    label: String,
    direction: IoDirection,
}

impl ChkTypeEntry {
    pub fn new(label: impl Into<String>, direction: IoDirection) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self { label, direction })
    }

    pub fn from_def(def: &ChkDef) -> Result<Self> {
        Self::new(def.label.clone(), def.direction)
    }

    pub fn to_def(&self, handle: Handle) -> ChkDef {
        ChkDef {
            handle,
            label: self.label.clone(),
            direction: self.direction,
        }
    }

    pub fn direction(&self) -> IoDirection {
        self.direction
    }
}

impl Labeled for ChkTypeEntry {
    fn label(&self) -> &str {
        &self.label
    }
}
