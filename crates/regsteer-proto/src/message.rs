use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handle::Handle;
use crate::iotype::IoDirection;
use crate::log::LogRecord;
use crate::param::ParamType;

/// Closed set of message kinds exchanged over a steering link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    IoDefs,
    ChkDefs,
    ParamDefs,
    SupportedCommands,
    Status,
    Control,
    Log,
    IoData,
    Error,
    NotSet,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::IoDefs => "IO_DEFS",
            MessageKind::ChkDefs => "CHK_DEFS",
            MessageKind::ParamDefs => "PARAM_DEFS",
            MessageKind::SupportedCommands => "SUPP_CMDS",
            MessageKind::Status => "STATUS",
            MessageKind::Control => "CONTROL",
            MessageKind::Log => "STEER_LOG",
            MessageKind::IoData => "IO_DATA",
            MessageKind::Error => "MSG_ERROR",
            MessageKind::NotSet => "MSG_NOTSET",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of one parameter as sent to a steerer.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub handle: Handle,
    pub label: String,
    pub steerable: bool,
    pub kind: ParamType,
    pub value: String,
    pub internal: bool,
    pub min: Option<String>,
    pub max: Option<String>,
}

/// Definition of one I/O type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoDef {
    pub handle: Handle,
    pub label: String,
    pub direction: IoDirection,
    pub frequency: i32,
    /// Handle of the `<label>_FREQ` parameter steering `frequency`.
    pub freq_handle: Handle,
}

/// Definition of one checkpoint type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkDef {
    pub handle: Handle,
    pub label: String,
    pub direction: IoDirection,
}

/// A supported command and the arguments it accepts.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDef {
    pub id: i32,
    pub params: Vec<ParamDef>,
}

/// A parameter value keyed by handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamUpdate {
    pub handle: Handle,
    pub value: String,
}

impl ParamUpdate {
    pub fn new(handle: Handle, value: impl Into<String>) -> Self {
        Self {
            handle,
            value: value.into(),
        }
    }
}

/// A command issued to (or echoed by) the application, with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandInvocation {
    pub id: i32,
    pub args: Vec<CommandArg>,
}

impl CommandInvocation {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push(CommandArg {
            label: label.into(),
            value: value.into(),
        });
        self
    }

    pub fn arg(&self, label: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|a| a.label == label)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandArg {
    pub label: String,
    pub value: String,
}

/// Application status: sequence number, current values, commands echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusMsg {
    pub seq_num: i64,
    pub params: Vec<ParamUpdate>,
    pub commands: Vec<CommandInvocation>,
}

impl StatusMsg {
    pub fn has_command(&self, id: i32) -> bool {
        self.commands.iter().any(|c| c.id == id)
    }
}

/// Steerer-issued parameter edits and commands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlMsg {
    pub params: Vec<ParamUpdate>,
    pub commands: Vec<CommandInvocation>,
}

impl ControlMsg {
    pub fn has_command(&self, id: i32) -> bool {
        self.commands.iter().any(|c| c.id == id)
    }
}

/// Recent values of one parameter, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamHistory {
    pub handle: Handle,
    pub values: Vec<String>,
}

/// Activity-log entries and parameter histories.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogMsg {
    pub entries: Vec<LogRecord>,
    pub histories: Vec<ParamHistory>,
}

/// One emitted block of an I/O type: the buffered data-slice records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoDataMsg {
    pub handle: Handle,
    pub seq_num: i64,
    pub data: Vec<u8>,
}

/// One decoded steering message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    IoDefs(Vec<IoDef>),
    ChkDefs(Vec<ChkDef>),
    ParamDefs(Vec<ParamDef>),
    SupportedCommands(Vec<CommandDef>),
    Status(StatusMsg),
    Control(ControlMsg),
    Log(LogMsg),
    IoData(IoDataMsg),
    Error(String),
    NotSet,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::IoDefs(_) => MessageKind::IoDefs,
            Message::ChkDefs(_) => MessageKind::ChkDefs,
            Message::ParamDefs(_) => MessageKind::ParamDefs,
            Message::SupportedCommands(_) => MessageKind::SupportedCommands,
            Message::Status(_) => MessageKind::Status,
            Message::Control(_) => MessageKind::Control,
            Message::Log(_) => MessageKind::Log,
            Message::IoData(_) => MessageKind::IoData,
            Message::Error(_) => MessageKind::Error,
            Message::NotSet => MessageKind::NotSet,
        }
    }
}
