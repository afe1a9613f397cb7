use crate::error::Result;
use crate::handle::Handle;
use crate::message::CommandDef;
use crate::param::ParamEntry;
use crate::table::{HandleTable, Labeled, TableConfig};

pub const STOP: i32 = 1;
pub const PAUSE: i32 = 2;
pub const RESUME: i32 = 3;
pub const DETACH: i32 = 4;
pub const EMIT_PARAM_LOG: i32 = 5;
pub const PAUSE_INTERNAL: i32 = 6;
pub const RESTART: i32 = 7;

/// Argument of `RESTART`: tag of the checkpoint to restart from.
pub const ARG_CHK_TAG: &str = "CHK_TAG";
/// Argument of `EMIT_PARAM_LOG`: handle of the parameter whose history is wanted.
pub const ARG_PARAM_HANDLE: &str = "PARAM_HANDLE";

/// Human-readable name of a command id, for logs and labels.
pub fn command_name(id: i32) -> String {
    match id {
        STOP => "STOP".to_string(),
        PAUSE => "PAUSE".to_string(),
        RESUME => "RESUME".to_string(),
        DETACH => "DETACH".to_string(),
        EMIT_PARAM_LOG => "EMIT_PARAM_LOG".to_string(),
        PAUSE_INTERNAL => "PAUSE_INTERNAL".to_string(),
        RESTART => "RESTART".to_string(),
        other if other >= Handle::FIRST_CHK_TYPE.get() => format!("CHK_{other}"),
        other if other >= Handle::FIRST_IO_TYPE.get() => format!("IO_{other}"),
        other => format!("CMD_{other}"),
    }
}

/// A command the application has declared it understands.
///
/// Commands may take arguments, described by a nested parameter table
/// (e.g. `RESTART` takes the tag of the checkpoint to restart from).
#[derive(Debug)]
pub struct SupportedCommand {
    id: i32,
    name: String,
    params: HandleTable<ParamEntry>,
}

impl SupportedCommand {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            name: command_name(id),
            params: HandleTable::with_config(TableConfig {
                initial_capacity: 4,
                ..TableConfig::params()
            }),
        }
    }

    /// Add an argument description.
    pub fn with_param(mut self, param: ParamEntry) -> Result<Self> {
        self.params.register(param)?;
        Ok(self)
    }

    pub fn from_def(def: &CommandDef) -> Result<Self> {
        let mut command = Self::new(def.id);
        for param in &def.params {
            command
                .params
                .upsert(param.handle, ParamEntry::from_def(param)?)?;
        }
        Ok(command)
    }

    pub fn to_def(&self) -> CommandDef {
        CommandDef {
            id: self.id,
            params: self
                .params
                .iter()
                .map(|(handle, param)| param.to_def(handle))
                .collect(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn params(&self) -> &HandleTable<ParamEntry> {
        &self.params
    }
}

impl Labeled for SupportedCommand {
    fn label(&self) -> &str {
        &self.name
    }
}
