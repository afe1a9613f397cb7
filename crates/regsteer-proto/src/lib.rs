//! Steering state shared by applications and steerers.
//!
//! Handle tables for parameters, I/O types, checkpoint types and supported
//! commands; the activity log replayed to late-attaching steerers; the
//! message model with its tag codec; and the typed data slices I/O types
//! carry.

pub mod codec;
pub mod command;
pub mod error;
pub mod handle;
pub mod iotype;
pub mod log;
pub mod message;
pub mod param;
pub mod slice;
pub mod table;

pub use codec::{decode, encode, peek_kind};
pub use command::{command_name, SupportedCommand};
pub use error::{ProtoError, Result};
pub use handle::Handle;
pub use iotype::{
    ArrayLayout, ArrayOrdering, ChkTypeEntry, IoBuffer, IoDirection, IoTypeEntry,
};
pub use log::{ActivityLog, LogKind, LogRecord};
pub use message::{
    ChkDef, CommandArg, CommandDef, CommandInvocation, ControlMsg, IoDataMsg, IoDef, LogMsg,
    Message, MessageKind, ParamDef, ParamHistory, ParamUpdate, StatusMsg,
};
pub use param::{
    format_float, BindValue, Bounds, ParamBinding, ParamEntry, ParamType, ParamValue,
    SharedValue,
};
pub use slice::DataSlice;
pub use table::{validate_label, HandleTable, Labeled, TableConfig};
