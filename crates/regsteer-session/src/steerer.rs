use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use regsteer_proto::command::{
    ARG_CHK_TAG, ARG_PARAM_HANDLE, DETACH, EMIT_PARAM_LOG, PAUSE, RESTART, RESUME, STOP,
};
use regsteer_proto::{
    ActivityLog, ChkTypeEntry, CommandDef, CommandInvocation, ControlMsg, Handle, HandleTable,
    IoTypeEntry, Labeled, LogKind, LogRecord, Message, MessageKind, ParamEntry, ParamUpdate,
    ParamValue, ProtoError, SupportedCommand, TableConfig,
};
use regsteer_transport::UnixDomainSocket;
use tracing::{debug, info, warn};

use crate::config::SteerConfig;
use crate::error::{Result, SteerError};
use crate::link::Link;

/// Identifies one attached simulation on the steerer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SimId(u32);

impl SimId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sim-{}", self.0)
    }
}

/// One message handled by [`Steerer::get_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SteerEvent {
    pub sim: SimId,
    pub kind: MessageKind,
    /// The application stopped or detached; the simulation has been dropped.
    pub done: bool,
}

enum Dispatch {
    Continue,
    Done,
    Failed(String),
}

/// Mirror of one application's state.
struct SimState {
    link: Link,
    params: HandleTable<ParamEntry>,
    io_types: HandleTable<IoTypeEntry>,
    chk_types: HandleTable<ChkTypeEntry>,
    commands: HandleTable<SupportedCommand>,
    log: ActivityLog,
    app_seq_num: i64,
    staged: Vec<ParamUpdate>,
}

impl SimState {
    fn new(link: Link) -> Self {
        Self {
            link,
            params: HandleTable::with_config(TableConfig::params()),
            io_types: HandleTable::with_config(TableConfig::io_types()),
            chk_types: HandleTable::with_config(TableConfig::chk_types()),
            commands: HandleTable::with_config(TableConfig {
                initial_capacity: 8,
                ..TableConfig::default()
            }),
            log: ActivityLog::new(),
            app_seq_num: 0,
            staged: Vec::new(),
        }
    }

    fn dispatch(&mut self, message: Message) -> regsteer_proto::Result<Dispatch> {
        match message {
            Message::SupportedCommands(defs) => self.load_commands(&defs)?,
            Message::ParamDefs(defs) => {
                let mut entries = Vec::with_capacity(defs.len());
                for def in &defs {
                    let mut entry = ParamEntry::from_def(def)?;
                    let history = self.params.get(def.handle).ok().and_then(|p| p.history());
                    if let Some(values) = history {
                        entry.set_history(values);
                    }
                    entries.push((def.handle, entry));
                }
                mirror(&mut self.params, entries)?;
            }
            Message::IoDefs(defs) => {
                let entries = defs
                    .iter()
                    .map(|def| Ok((def.handle, IoTypeEntry::from_def(def)?)))
                    .collect::<regsteer_proto::Result<Vec<_>>>()?;
                mirror(&mut self.io_types, entries)?;
            }
            Message::ChkDefs(defs) => {
                let entries = defs
                    .iter()
                    .map(|def| Ok((def.handle, ChkTypeEntry::from_def(def)?)))
                    .collect::<regsteer_proto::Result<Vec<_>>>()?;
                mirror(&mut self.chk_types, entries)?;
            }
            Message::Status(status) => {
                self.app_seq_num = status.seq_num;
                let finished = status.has_command(STOP) || status.has_command(DETACH);
                for update in status.params {
                    match self.params.get_mut(update.handle) {
                        Ok(entry) => entry.set_cached(update.value),
                        Err(_) => debug!(handle = %update.handle, "status for unknown parameter"),
                    }
                }
                if finished {
                    return Ok(Dispatch::Done);
                }
            }
            Message::Log(log) => {
                for record in log.entries {
                    self.log.merge(record)?;
                }
                for history in log.histories {
                    match self.params.get_mut(history.handle) {
                        Ok(entry) => entry.set_history(history.values),
                        Err(_) => debug!(handle = %history.handle, "history for unknown parameter"),
                    }
                }
            }
            Message::Error(reason) => return Ok(Dispatch::Failed(reason)),
            other @ (Message::Control(_) | Message::IoData(_) | Message::NotSet) => {
                debug!(kind = %other.kind(), "ignoring message");
            }
        }
        Ok(Dispatch::Continue)
    }

    fn load_commands(&mut self, defs: &[CommandDef]) -> regsteer_proto::Result<()> {
        let entries = defs
            .iter()
            .map(|def| Ok((Handle::new(def.id), SupportedCommand::from_def(def)?)))
            .collect::<regsteer_proto::Result<Vec<_>>>()?;
        mirror(&mut self.commands, entries)
    }

    /// Whether the application will act on command `id`.
    fn accepts(&self, id: i32) -> bool {
        id == DETACH
            || self.commands.contains(Handle::new(id))
            || self.io_types.contains(Handle::new(id))
            || self.chk_types.contains(Handle::new(id))
    }
}

/// Replace a mirror table's contents, keeping entries whose handles recur.
fn mirror<T: Labeled>(
    table: &mut HandleTable<T>,
    entries: Vec<(Handle, T)>,
) -> regsteer_proto::Result<()> {
    let keep: HashSet<Handle> = entries.iter().map(|(handle, _)| *handle).collect();
    for handle in table.handles() {
        if !keep.contains(&handle) {
            table.remove(handle)?;
        }
    }
    for (handle, entry) in entries {
        table.upsert(handle, entry)?;
    }
    Ok(())
}

/// The steering client: attaches to applications and mirrors their state.
///
/// Each attached application is a simulation with its own mirror tables.
/// A simulation that sends an error or an unreadable message is dropped.
pub struct Steerer {
    config: SteerConfig,
    sims: BTreeMap<SimId, SimState>,
    next_id: u32,
    last_polled: Option<SimId>,
}

impl Steerer {
    pub fn new(config: SteerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sims: BTreeMap::new(),
            next_id: 1,
            last_polled: None,
        })
    }

    pub fn config(&self) -> &SteerConfig {
        &self.config
    }

    /// Attach over an established link: expects the supported-command
    /// handshake within the attach timeout.
    pub fn attach(&mut self, mut link: Link) -> Result<SimId> {
        let message =
            link.recv_timeout(self.config.attach_timeout(), self.config.poll_interval())?;
        let kind = message.kind();
        let Message::SupportedCommands(defs) = message else {
            return Err(SteerError::Attach(format!(
                "expected {} handshake, got {kind}",
                MessageKind::SupportedCommands
            )));
        };

        let mut state = SimState::new(link);
        state.load_commands(&defs)?;
        let sim = SimId(self.next_id);
        self.next_id += 1;
        info!(%sim, peer = state.link.peer(), commands = defs.len(), "attached to simulation");
        self.sims.insert(sim, state);
        Ok(sim)
    }

    /// Connect to an application listening on a Unix socket and attach.
    pub fn attach_path(&mut self, path: impl AsRef<Path>) -> Result<SimId> {
        let stream = UnixDomainSocket::connect(path)?;
        let link = Link::from_ipc(stream, &self.config.frame_config())?;
        self.attach(link)
    }

    /// Tell the application to detach and forget the simulation.
    pub fn detach(&mut self, sim: SimId) -> Result<()> {
        let mut state = self.sims.remove(&sim).ok_or(SteerError::UnknownSim(sim))?;
        let control = ControlMsg {
            params: std::mem::take(&mut state.staged),
            commands: vec![CommandInvocation::new(DETACH)],
        };
        if let Err(err) = state.link.send(&Message::Control(control)) {
            warn!(%sim, error = %err, "could not send detach");
        }
        info!(%sim, "detached from simulation");
        Ok(())
    }

    pub fn emit_detach(&mut self, sim: SimId) -> Result<()> {
        self.detach(sim)
    }

    /// Handle at most one pending message from `sim`, without blocking.
    ///
    /// Any receive or decode failure, and any error message, drops the
    /// simulation and is reported as `Fatal`.
    pub fn get_message_from(&mut self, sim: SimId) -> Result<Option<SteerEvent>> {
        let state = self.sims.get_mut(&sim).ok_or(SteerError::UnknownSim(sim))?;
        let message = match state.link.try_recv() {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(None),
            Err(err) => return Err(self.drop_sim(sim, err.to_string())),
        };

        let kind = message.kind();
        debug!(%sim, %kind, "dispatching message");
        match state.dispatch(message) {
            Ok(Dispatch::Continue) => Ok(Some(SteerEvent {
                sim,
                kind,
                done: false,
            })),
            Ok(Dispatch::Done) => {
                self.sims.remove(&sim);
                info!(%sim, "simulation finished");
                Ok(Some(SteerEvent {
                    sim,
                    kind,
                    done: true,
                }))
            }
            Ok(Dispatch::Failed(reason)) => Err(self.drop_sim(sim, reason)),
            Err(err) => Err(self.drop_sim(sim, err.to_string())),
        }
    }

    /// Poll every simulation in turn, starting after the last one that
    /// produced something, and handle the first message found.
    pub fn get_message(&mut self) -> Result<Option<SteerEvent>> {
        let ids: Vec<SimId> = self.sims.keys().copied().collect();
        let start = match self.last_polled {
            Some(last) => ids.partition_point(|&id| id <= last),
            None => 0,
        };
        for i in 0..ids.len() {
            let sim = ids[(start + i) % ids.len()];
            let result = self.get_message_from(sim);
            if !matches!(result, Ok(None)) {
                self.last_polled = Some(sim);
                return result;
            }
        }
        Ok(None)
    }

    /// Stage a new value for a steerable parameter; sent by the next
    /// [`Steerer::emit_control`].
    pub fn set_param_value(&mut self, sim: SimId, handle: Handle, value: &str) -> Result<()> {
        let state = self.sim_mut(sim)?;
        let entry = state.params.get(handle)?;
        if !entry.steerable() {
            return Err(ProtoError::InvalidArgument(format!(
                "parameter '{}' is not steerable",
                entry.label()
            ))
            .into());
        }
        let parsed = ParamValue::parse(entry.kind(), value)?;
        if let Some(v) = parsed.as_f64() {
            if !entry.bounds().contains(v) {
                return Err(ProtoError::InvalidArgument(format!(
                    "{value} is outside the bounds of '{}'",
                    entry.label()
                ))
                .into());
            }
        }
        let text = parsed.to_text();
        match state.staged.iter_mut().find(|u| u.handle == handle) {
            Some(update) => update.value = text,
            None => state.staged.push(ParamUpdate::new(handle, text)),
        }
        Ok(())
    }

    /// Send staged edits together with `commands`.
    pub fn emit_control(&mut self, sim: SimId, commands: Vec<CommandInvocation>) -> Result<()> {
        let state = self.sim_mut(sim)?;
        if let Some(command) = commands.iter().find(|c| !state.accepts(c.id)) {
            return Err(ProtoError::InvalidArgument(format!(
                "{sim} does not support command {}",
                command.id
            ))
            .into());
        }
        let control = ControlMsg {
            params: std::mem::take(&mut state.staged),
            commands,
        };
        let edits = control.params.len();
        if let Err(err) = state.link.send(&Message::Control(control)) {
            return Err(self.drop_sim(sim, err.to_string()));
        }
        debug!(%sim, edits, "sent control");
        Ok(())
    }

    pub fn emit_command(&mut self, sim: SimId, id: i32) -> Result<()> {
        self.emit_control(sim, vec![CommandInvocation::new(id)])
    }

    pub fn emit_stop(&mut self, sim: SimId) -> Result<()> {
        self.emit_command(sim, STOP)
    }

    pub fn emit_pause(&mut self, sim: SimId) -> Result<()> {
        self.emit_command(sim, PAUSE)
    }

    pub fn emit_resume(&mut self, sim: SimId) -> Result<()> {
        self.emit_command(sim, RESUME)
    }

    /// Ask the application to restart from the checkpoint tagged `tag`.
    pub fn emit_restart(&mut self, sim: SimId, tag: &str) -> Result<()> {
        self.emit_control(
            sim,
            vec![CommandInvocation::new(RESTART).with_arg(ARG_CHK_TAG, tag)],
        )
    }

    /// Ask for the value history of a parameter.
    pub fn emit_retrieve_param_log(&mut self, sim: SimId, handle: Handle) -> Result<()> {
        self.sim(sim)?.params.get(handle)?;
        self.emit_control(
            sim,
            vec![CommandInvocation::new(EMIT_PARAM_LOG)
                .with_arg(ARG_PARAM_HANDLE, handle.to_string())],
        )
    }

    // Queries

    pub fn sims(&self) -> Vec<SimId> {
        self.sims.keys().copied().collect()
    }

    pub fn is_attached(&self, sim: SimId) -> bool {
        self.sims.contains_key(&sim)
    }

    /// Mirrored parameters whose steerable flag equals `steerable`.
    pub fn params(&self, sim: SimId, steerable: bool) -> Result<Vec<(Handle, &ParamEntry)>> {
        Ok(self
            .sim(sim)?
            .params
            .iter()
            .filter(|(_, p)| p.steerable() == steerable)
            .collect())
    }

    pub fn param_by_label(&self, sim: SimId, label: &str) -> Result<Option<(Handle, &ParamEntry)>> {
        Ok(self.sim(sim)?.params.find_by_label(label))
    }

    pub fn io_types(&self, sim: SimId) -> Result<&HandleTable<IoTypeEntry>> {
        Ok(&self.sim(sim)?.io_types)
    }

    pub fn chk_types(&self, sim: SimId) -> Result<&HandleTable<ChkTypeEntry>> {
        Ok(&self.sim(sim)?.chk_types)
    }

    pub fn supported_commands(&self, sim: SimId) -> Result<Vec<i32>> {
        Ok(self.sim(sim)?.commands.iter().map(|(_, c)| c.id()).collect())
    }

    /// Up to `n` most recent checkpoint records, newest first.
    pub fn chk_log_reverse(&self, sim: SimId, n: usize) -> Result<Vec<&LogRecord>> {
        Ok(self
            .sim(sim)?
            .log
            .iter()
            .rev()
            .filter(|r| matches!(r.kind, LogKind::Checkpoint { .. }))
            .take(n)
            .collect())
    }

    pub fn log(&self, sim: SimId) -> Result<&ActivityLog> {
        Ok(&self.sim(sim)?.log)
    }

    pub fn param_history(&self, sim: SimId, handle: Handle) -> Result<Option<Vec<String>>> {
        Ok(self.sim(sim)?.params.get(handle)?.history())
    }

    pub fn app_seq_num(&self, sim: SimId) -> Result<i64> {
        Ok(self.sim(sim)?.app_seq_num)
    }

    fn sim(&self, sim: SimId) -> Result<&SimState> {
        self.sims.get(&sim).ok_or(SteerError::UnknownSim(sim))
    }

    fn sim_mut(&mut self, sim: SimId) -> Result<&mut SimState> {
        self.sims.get_mut(&sim).ok_or(SteerError::UnknownSim(sim))
    }

    fn drop_sim(&mut self, sim: SimId, reason: String) -> SteerError {
        self.sims.remove(&sim);
        warn!(%sim, %reason, "dropping simulation");
        SteerError::Fatal { sim, reason }
    }
}

impl std::fmt::Debug for Steerer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Steerer")
            .field("sims", &self.sims.keys().collect::<Vec<_>>())
            .field("next_id", &self.next_id)
            .finish()
    }
}
