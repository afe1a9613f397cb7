use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::handle::Handle;
use crate::message::ParamDef;
use crate::table::{validate_label, Labeled};

/// Declared type of a steered parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Int,
    Float,
    Double,
    Char,
    Bin,
    Bool,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Double => "double",
            ParamType::Char => "char",
            ParamType::Bin => "bin",
            ParamType::Bool => "bool",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ParamType::Int | ParamType::Float | ParamType::Double)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamType {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int" => Ok(ParamType::Int),
            "float" => Ok(ParamType::Float),
            "double" => Ok(ParamType::Double),
            "char" => Ok(ParamType::Char),
            "bin" => Ok(ParamType::Bin),
            "bool" => Ok(ParamType::Bool),
            other => Err(ProtoError::InvalidArgument(format!(
                "unknown parameter type '{other}'"
            ))),
        }
    }
}

/// A typed parameter value, as read from or written to the program.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Double(f64),
    Char(String),
    Bin(Vec<u8>),
    Bool(bool),
}

impl ParamValue {
    pub fn kind(&self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Double(_) => ParamType::Double,
            ParamValue::Char(_) => ParamType::Char,
            ParamValue::Bin(_) => ParamType::Bin,
            ParamValue::Bool(_) => ParamType::Bool,
        }
    }

    /// Canonical wire text. Floats keep at least two fractional digits.
    pub fn to_text(&self) -> String {
        match self {
            ParamValue::Int(v) => v.to_string(),
            ParamValue::Float(v) => pad_fraction(v.to_string()),
            ParamValue::Double(v) => format_float(*v),
            ParamValue::Char(v) => v.clone(),
            ParamValue::Bin(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
            ParamValue::Bool(v) => v.to_string(),
        }
    }

    /// Parse wire text as a value of `kind`.
    pub fn parse(kind: ParamType, text: &str) -> Result<Self> {
        let bad = || ProtoError::InvalidArgument(format!("'{text}' is not a valid {kind} value"));
        let trimmed = text.trim();
        match kind {
            ParamType::Int => trimmed.parse().map(ParamValue::Int).map_err(|_| bad()),
            ParamType::Float => trimmed.parse().map(ParamValue::Float).map_err(|_| bad()),
            ParamType::Double => trimmed.parse().map(ParamValue::Double).map_err(|_| bad()),
            ParamType::Char => Ok(ParamValue::Char(text.to_string())),
            ParamType::Bin => decode_hex(trimmed).map(ParamValue::Bin).ok_or_else(bad),
            ParamType::Bool => match trimmed {
                "true" | "1" => Ok(ParamValue::Bool(true)),
                "false" | "0" => Ok(ParamValue::Bool(false)),
                _ => Err(bad()),
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(f64::from(*v)),
            ParamValue::Float(v) => Some(f64::from(*v)),
            ParamValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

/// Shortest round-trip decimal, padded to at least two fractional digits.
pub fn format_float(value: f64) -> String {
    pad_fraction(value.to_string())
}

fn pad_fraction(mut text: String) -> String {
    match text.find('.') {
        Some(dot) => {
            let digits = text.len() - dot - 1;
            for _ in digits..2 {
                text.push('0');
            }
        }
        None if text.bytes().all(|b| b.is_ascii_digit() || b == b'-') => text.push_str(".00"),
        None => {}
    }
    text
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

/// A program value shared between the simulation and its parameter binding.
///
/// Cloning shares the same cell.
#[derive(Debug, Default)]
pub struct SharedValue<T>(Arc<Mutex<T>>);

impl<T> Clone for SharedValue<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Clone> SharedValue<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> T {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, value: T) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

/// Rust types that map onto one [`ParamType`].
pub trait BindValue: Clone + Send + 'static {
    const KIND: ParamType;

    fn into_param(self) -> ParamValue;
    fn from_param(value: ParamValue) -> Option<Self>;
}

macro_rules! bind_value {
    ($ty:ty, $variant:ident) => {
        impl BindValue for $ty {
            const KIND: ParamType = ParamType::$variant;

            fn into_param(self) -> ParamValue {
                ParamValue::$variant(self)
            }

            fn from_param(value: ParamValue) -> Option<Self> {
                match value {
                    ParamValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

bind_value!(i32, Int);
bind_value!(f32, Float);
bind_value!(f64, Double);
bind_value!(String, Char);
bind_value!(Vec<u8>, Bin);
bind_value!(bool, Bool);

type ReadFn = Box<dyn Fn() -> ParamValue + Send>;
type WriteFn = Box<dyn FnMut(ParamValue) + Send>;

/// Accessors linking a parameter entry to the live program value it mirrors.
///
/// The table never touches program memory directly: it reads through `read`
/// when refreshing and writes through `write` when a steerer edits the value.
pub struct ParamBinding {
    read: ReadFn,
    write: Option<WriteFn>,
}

impl ParamBinding {
    pub fn new(
        read: impl Fn() -> ParamValue + Send + 'static,
        write: impl FnMut(ParamValue) + Send + 'static,
    ) -> Self {
        Self {
            read: Box::new(read),
            write: Some(Box::new(write)),
        }
    }

    /// A binding for a monitored value; writes are refused.
    pub fn read_only(read: impl Fn() -> ParamValue + Send + 'static) -> Self {
        Self {
            read: Box::new(read),
            write: None,
        }
    }

    /// Bind to a [`SharedValue`] cell.
    pub fn shared<T: BindValue>(cell: &SharedValue<T>) -> Self {
        let reader = cell.clone();
        let writer = cell.clone();
        Self::new(
            move || reader.get().into_param(),
            move |value| {
                if let Some(v) = T::from_param(value) {
                    writer.set(v);
                }
            },
        )
    }

    pub fn read(&self) -> ParamValue {
        (self.read)()
    }

    pub fn is_writable(&self) -> bool {
        self.write.is_some()
    }

    pub fn write(&mut self, value: ParamValue) -> Result<()> {
        match self.write.as_mut() {
            Some(write) => {
                write(value);
                Ok(())
            }
            None => Err(ProtoError::InvalidArgument(
                "binding is read-only".to_string(),
            )),
        }
    }
}

/// Optional numeric limits on steered values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// One registered parameter.
///
/// Used on both sides of a link: the application's entries carry a binding
/// to live program state, a steerer's mirror entries carry only the cached
/// text it was last sent.
pub struct ParamEntry {
    label: String,
    steerable: bool,
    kind: ParamType,
    binding: Option<ParamBinding>,
    value: String,
    modified: bool,
    internal: bool,
    bounds: Bounds,
    history: Option<History>,
}

struct History {
    capacity: usize,
    values: VecDeque<String>,
}

impl ParamEntry {
    pub fn new(label: impl Into<String>, steerable: bool, kind: ParamType) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        Ok(Self {
            label,
            steerable,
            kind,
            binding: None,
            value: String::new(),
            modified: false,
            internal: false,
            bounds: Bounds::default(),
            history: None,
        })
    }

    /// Attach a binding and take its current value as the cached text.
    pub fn with_binding(mut self, binding: ParamBinding) -> Result<Self> {
        let current = binding.read();
        if current.kind() != self.kind {
            return Err(ProtoError::InvalidArgument(format!(
                "parameter '{}' declared {} but bound to a {} value",
                self.label,
                self.kind,
                current.kind()
            )));
        }
        self.value = current.to_text();
        self.binding = Some(binding);
        Ok(self)
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Result<Self> {
        if bounds == Bounds::default() {
            return Ok(self);
        }
        if !self.kind.is_numeric() {
            return Err(ProtoError::InvalidArgument(format!(
                "bounds given for non-numeric parameter '{}'",
                self.label
            )));
        }
        if let (Some(min), Some(max)) = (bounds.min, bounds.max) {
            if min > max {
                return Err(ProtoError::InvalidArgument(format!(
                    "min {min} exceeds max {max} for '{}'",
                    self.label
                )));
            }
        }
        self.bounds = bounds;
        Ok(self)
    }

    /// Mark as library-owned (hidden from snapshots, flagged in definitions).
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Rebuild a mirror entry from a received definition.
    pub fn from_def(def: &ParamDef) -> Result<Self> {
        let parse_bound = |text: &Option<String>| -> Result<Option<f64>> {
            match text {
                Some(t) => t.trim().parse().map(Some).map_err(|_| {
                    ProtoError::InvalidArgument(format!("bad bound '{t}' for '{}'", def.label))
                }),
                None => Ok(None),
            }
        };
        let mut entry = Self::new(def.label.clone(), def.steerable, def.kind)?;
        entry.value = def.value.clone();
        entry.internal = def.internal;
        entry.bounds = Bounds {
            min: parse_bound(&def.min)?,
            max: parse_bound(&def.max)?,
        };
        Ok(entry)
    }

    pub fn to_def(&self, handle: Handle) -> ParamDef {
        ParamDef {
            handle,
            label: self.label.clone(),
            steerable: self.steerable,
            kind: self.kind,
            value: self.value.clone(),
            internal: self.internal,
            min: self.bounds.min.map(format_float),
            max: self.bounds.max.map(format_float),
        }
    }

    pub fn steerable(&self) -> bool {
        self.steerable
    }

    pub fn kind(&self) -> ParamType {
        self.kind
    }

    /// Last known value as wire text.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Re-read the bound program value. Returns true if the text changed.
    pub fn refresh(&mut self) -> bool {
        let Some(binding) = &self.binding else {
            return false;
        };
        let text = binding.read().to_text();
        if text == self.value {
            return false;
        }
        self.value = text;
        true
    }

    /// Apply an edit received from a steerer.
    ///
    /// The text is parsed as the declared type, checked against the bounds
    /// and written through the binding. Stores the canonical text and sets
    /// the modified flag. Nothing changes on error.
    pub fn apply_edit(&mut self, text: &str) -> Result<()> {
        if !self.steerable {
            return Err(ProtoError::InvalidArgument(format!(
                "parameter '{}' is monitored, not steerable",
                self.label
            )));
        }
        let value = ParamValue::parse(self.kind, text)?;
        if let Some(v) = value.as_f64() {
            if !self.bounds.contains(v) {
                return Err(ProtoError::InvalidArgument(format!(
                    "{text} is outside the bounds of '{}'",
                    self.label
                )));
            }
        }
        let canonical = value.to_text();
        if let Some(binding) = self.binding.as_mut() {
            binding.write(value)?;
        }
        self.value = canonical;
        self.modified = true;
        Ok(())
    }

    /// Overwrite the cached text (mirror side).
    pub fn set_cached(&mut self, text: impl Into<String>) {
        self.value = text.into();
    }

    /// Read and clear the modified flag.
    pub fn take_modified(&mut self) -> bool {
        std::mem::take(&mut self.modified)
    }

    /// Keep the last `capacity` values seen by [`ParamEntry::record_history`].
    pub fn enable_history(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(ProtoError::InvalidArgument(
                "history capacity must be positive".to_string(),
            ));
        }
        match self.history.as_mut() {
            Some(history) => {
                history.capacity = capacity;
                while history.values.len() > capacity {
                    history.values.pop_front();
                }
            }
            None => {
                self.history = Some(History {
                    capacity,
                    values: VecDeque::with_capacity(capacity),
                })
            }
        }
        Ok(())
    }

    /// Push the current value onto the history ring, if enabled.
    pub fn record_history(&mut self) {
        if let Some(history) = self.history.as_mut() {
            if history.values.len() == history.capacity {
                history.values.pop_front();
            }
            history.values.push_back(self.value.clone());
        }
    }

    /// Past values, oldest first.
    pub fn history(&self) -> Option<Vec<String>> {
        self.history
            .as_ref()
            .map(|h| h.values.iter().cloned().collect())
    }

    /// Replace the history with values received from the application.
    pub fn set_history(&mut self, values: Vec<String>) {
        let capacity = values.len().max(1);
        self.history = Some(History {
            capacity,
            values: values.into(),
        });
    }
}

impl Labeled for ParamEntry {
    fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for ParamEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamEntry")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("steerable", &self.steerable)
            .field("value", &self.value)
            .field("internal", &self.internal)
            .field("bound", &self.binding.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_text_keeps_two_decimals() {
        assert_eq!(ParamValue::Float(55.6).to_text(), "55.60");
        assert_eq!(ParamValue::Double(72.1).to_text(), "72.10");
        assert_eq!(ParamValue::Double(3.0).to_text(), "3.00");
        assert_eq!(ParamValue::Double(0.125).to_text(), "0.125");
        assert_eq!(ParamValue::Double(-2.5).to_text(), "-2.50");
    }

    #[test]
    fn float_text_parses_back_exactly() {
        for v in [55.6f64, 1.0 / 3.0, 1e-7, 123456.789] {
            let text = ParamValue::Double(v).to_text();
            assert_eq!(ParamValue::parse(ParamType::Double, &text).unwrap(), ParamValue::Double(v));
        }
    }

    #[test]
    fn parse_by_type() {
        assert_eq!(ParamValue::parse(ParamType::Int, " 42 ").unwrap(), ParamValue::Int(42));
        assert_eq!(ParamValue::parse(ParamType::Bool, "1").unwrap(), ParamValue::Bool(true));
        assert_eq!(
            ParamValue::parse(ParamType::Bin, "00ff10").unwrap(),
            ParamValue::Bin(vec![0, 255, 16])
        );
        assert_eq!(
            ParamValue::parse(ParamType::Char, " spaced ").unwrap(),
            ParamValue::Char(" spaced ".to_string())
        );
        assert!(ParamValue::parse(ParamType::Int, "4.5").is_err());
        assert!(ParamValue::parse(ParamType::Bin, "abc").is_err());
    }

    #[test]
    fn binding_reads_initial_value() {
        let temp = SharedValue::new(55.6f32);
        let entry = ParamEntry::new("TEMP", true, ParamType::Float)
            .unwrap()
            .with_binding(ParamBinding::shared(&temp))
            .unwrap();
        assert_eq!(entry.value(), "55.60");
    }

    #[test]
    fn binding_type_mismatch_rejected() {
        let steps = SharedValue::new(10i32);
        let result = ParamEntry::new("STEPS", true, ParamType::Double)
            .unwrap()
            .with_binding(ParamBinding::shared(&steps));
        assert!(matches!(result, Err(ProtoError::InvalidArgument(_))));
    }

    #[test]
    fn edit_writes_through_binding() {
        let temp = SharedValue::new(55.6f32);
        let mut entry = ParamEntry::new("TEMP", true, ParamType::Float)
            .unwrap()
            .with_binding(ParamBinding::shared(&temp))
            .unwrap();

        entry.apply_edit("72.1").unwrap();
        assert_eq!(temp.get(), 72.1f32);
        assert_eq!(entry.value(), "72.10");
        assert!(entry.take_modified());
        assert!(!entry.take_modified());
    }

    #[test]
    fn edit_rejected_for_monitored_param() {
        let mut entry = ParamEntry::new("ENERGY", false, ParamType::Double).unwrap();
        assert!(entry.apply_edit("1.0").is_err());
        assert!(!entry.is_modified());
    }

    #[test]
    fn edit_outside_bounds_rejected() {
        let cell = SharedValue::new(5i32);
        let mut entry = ParamEntry::new("NPROC", true, ParamType::Int)
            .unwrap()
            .with_binding(ParamBinding::shared(&cell))
            .unwrap()
            .with_bounds(Bounds {
                min: Some(1.0),
                max: Some(8.0),
            })
            .unwrap();

        assert!(entry.apply_edit("9").is_err());
        assert_eq!(cell.get(), 5);
        entry.apply_edit("8").unwrap();
        assert_eq!(cell.get(), 8);
    }

    #[test]
    fn bounds_need_numeric_type() {
        let result = ParamEntry::new("NAME", true, ParamType::Char)
            .unwrap()
            .with_bounds(Bounds {
                min: Some(0.0),
                max: None,
            });
        assert!(result.is_err());
    }

    #[test]
    fn refresh_tracks_program_changes() {
        let cell = SharedValue::new(1.5f64);
        let mut entry = ParamEntry::new("DT", false, ParamType::Double)
            .unwrap()
            .with_binding(ParamBinding::shared(&cell))
            .unwrap();

        assert!(!entry.refresh());
        cell.set(2.25);
        assert!(entry.refresh());
        assert_eq!(entry.value(), "2.25");
    }

    #[test]
    fn read_only_binding_refuses_writes() {
        let mut entry = ParamEntry::new("WALL", true, ParamType::Int)
            .unwrap()
            .with_binding(ParamBinding::read_only(|| ParamValue::Int(3)))
            .unwrap();
        assert!(entry.apply_edit("4").is_err());
        assert_eq!(entry.value(), "3");
    }

    #[test]
    fn history_ring_is_bounded() {
        let cell = SharedValue::new(0i32);
        let mut entry = ParamEntry::new("STEP", false, ParamType::Int)
            .unwrap()
            .with_binding(ParamBinding::shared(&cell))
            .unwrap();
        assert!(entry.history().is_none());

        entry.enable_history(3).unwrap();
        for i in 0..5 {
            cell.set(i);
            entry.refresh();
            entry.record_history();
        }
        assert_eq!(entry.history().unwrap(), vec!["2", "3", "4"]);
        assert!(entry.enable_history(0).is_err());
    }

    #[test]
    fn def_roundtrip_through_mirror() {
        let entry = ParamEntry::new("TEMP", true, ParamType::Float)
            .unwrap()
            .with_bounds(Bounds {
                min: Some(0.0),
                max: Some(100.5),
            })
            .unwrap();
        let def = entry.to_def(Handle::new(3));
        assert_eq!(def.min.as_deref(), Some("0.00"));
        assert_eq!(def.max.as_deref(), Some("100.50"));

        let mirror = ParamEntry::from_def(&def).unwrap();
        assert_eq!(mirror.to_def(Handle::new(3)), def);
        assert!(!mirror.is_bound());
    }
}
