use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Instant;

use regsteer_frame::FrameError;
use regsteer_proto::command::{
    ARG_CHK_TAG, ARG_PARAM_HANDLE, DETACH, EMIT_PARAM_LOG, PAUSE, PAUSE_INTERNAL, RESTART, RESUME,
    STOP,
};
use regsteer_proto::{
    ActivityLog, ArrayLayout, BindValue, Bounds, ChkTypeEntry, CommandInvocation, ControlMsg,
    Handle, HandleTable, IoDirection, IoTypeEntry, Labeled, LogKind, LogMsg, Message, ParamBinding,
    ParamEntry, ParamHistory, ParamType, ParamUpdate, ProtoError, SharedValue, StatusMsg,
    SupportedCommand, TableConfig,
};
use regsteer_transport::UnixDomainSocket;
use tracing::{debug, info, warn};

use crate::config::SteerConfig;
use crate::error::{Result, SteerError};
use crate::link::Link;

mod io;
mod pause;

pub use pause::{PauseOutcome, PauseState};

/// File the activity log is persisted to inside the scratch directory.
pub const LOG_FILE_NAME: &str = "steer_log.jsonl";

const FREQ_SUFFIX: &str = "_FREQ";

/// An edit the application refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEdit {
    pub handle: Handle,
    pub value: String,
    pub reason: String,
}

/// What one control-loop call hands back to the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlOutcome {
    /// Labels of parameters changed by the steerer, in the order received.
    pub changed_params: Vec<String>,
    /// Commands for the application to act on, including due I/O emissions.
    pub commands: Vec<CommandInvocation>,
    pub rejected: Vec<RejectedEdit>,
}

impl ControlOutcome {
    pub fn command_ids(&self) -> Vec<i32> {
        self.commands.iter().map(|c| c.id).collect()
    }

    pub fn has_command(&self, id: i32) -> bool {
        self.commands.iter().any(|c| c.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.changed_params.is_empty() && self.commands.is_empty() && self.rejected.is_empty()
    }
}

/// Definitions the attached steerer has not seen yet.
#[derive(Debug, Default, Clone, Copy)]
struct Dirty {
    commands: bool,
    params: bool,
    io_types: bool,
    chk_types: bool,
}

/// The application side of a steering link.
///
/// Owns the registration tables and the activity log, and drives the
/// non-blocking control loop ([`AppSession::steering_control`]) and the
/// blocking pause ([`AppSession::steering_pause`]). At most one steerer is
/// attached at a time.
pub struct AppSession {
    config: SteerConfig,
    enabled: bool,
    params: HandleTable<ParamEntry>,
    io_types: HandleTable<IoTypeEntry>,
    chk_types: HandleTable<ChkTypeEntry>,
    commands: HandleTable<SupportedCommand>,
    log: ActivityLog,
    link: Option<Link>,
    listener: Option<UnixDomainSocket>,
    dirty: Dirty,
    seq_num: i64,
    calls_since_status: u32,
    internal_pause: bool,
    history_requests: Vec<Handle>,
    io_channels: HashMap<Handle, io::IoChannel>,
}

impl AppSession {
    /// Create an enabled session with the built-in commands registered.
    pub fn new(config: SteerConfig) -> Result<Self> {
        config.validate()?;
        let mut session = Self {
            config,
            enabled: true,
            params: HandleTable::with_config(TableConfig::params()),
            io_types: HandleTable::with_config(TableConfig::io_types()),
            chk_types: HandleTable::with_config(TableConfig::chk_types()),
            commands: HandleTable::with_config(TableConfig {
                initial_capacity: 8,
                ..TableConfig::default()
            }),
            log: ActivityLog::new(),
            link: None,
            listener: None,
            dirty: Dirty::default(),
            seq_num: 0,
            calls_since_status: 0,
            internal_pause: false,
            history_requests: Vec::new(),
            io_channels: HashMap::new(),
        };
        session.register_commands(&[STOP, DETACH, EMIT_PARAM_LOG])?;
        Ok(session)
    }

    /// Like [`AppSession::new`], also reloading an activity log persisted by
    /// an earlier run in the scratch directory.
    pub fn initialize(config: SteerConfig) -> Result<Self> {
        let mut session = Self::new(config)?;
        if let Some(dir) = session.config.scratch_dir.clone() {
            let path = dir.join(LOG_FILE_NAME);
            if path.exists() {
                let file = File::open(&path)?;
                session.log = ActivityLog::read_jsonl(BufReader::new(file))?;
                info!(?path, entries = session.log.len(), "reloaded activity log");
            }
        }
        Ok(session)
    }

    pub fn config(&self) -> &SteerConfig {
        &self.config
    }

    /// Turn steering on or off. Registration works either way.
    pub fn enable(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(enabled, "steering switched");
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // Registration

    pub fn register_param(&mut self, entry: ParamEntry) -> Result<Handle> {
        let handle = self.params.register(entry)?;
        self.dirty.params = true;
        Ok(handle)
    }

    /// Register a parameter bound to a shared program value.
    pub fn register_shared<T: BindValue>(
        &mut self,
        label: &str,
        steerable: bool,
        cell: &SharedValue<T>,
    ) -> Result<Handle> {
        self.register_bounded(label, steerable, cell, Bounds::default())
    }

    pub fn register_bounded<T: BindValue>(
        &mut self,
        label: &str,
        steerable: bool,
        cell: &SharedValue<T>,
        bounds: Bounds,
    ) -> Result<Handle> {
        let entry = ParamEntry::new(label, steerable, T::KIND)?
            .with_binding(ParamBinding::shared(cell))?
            .with_bounds(bounds)?;
        self.register_param(entry)
    }

    /// Remove parameters by label. Either all are removed or none.
    pub fn unregister_params(&mut self, labels: &[&str]) -> Result<()> {
        let handles = labels
            .iter()
            .map(|label| match self.params.find_by_label(label) {
                Some((handle, entry)) if !entry.is_internal() => Ok(handle),
                Some(_) => Err(ProtoError::InvalidArgument(format!(
                    "parameter '{label}' is owned by the library"
                ))),
                None => Err(ProtoError::InvalidArgument(format!(
                    "no parameter labelled '{label}'"
                ))),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for handle in handles {
            self.params.remove(handle)?;
        }
        self.dirty.params = true;
        Ok(())
    }

    /// Register an I/O type and its steerable `<label>_FREQ` parameter.
    pub fn register_io_type(
        &mut self,
        label: &str,
        direction: IoDirection,
        frequency: i32,
    ) -> Result<Handle> {
        let entry = IoTypeEntry::new(label, direction, frequency)?;
        let cell = entry.frequency_cell().clone();
        let handle = self.io_types.register(entry)?;

        let shadow = ParamEntry::new(format!("{label}{FREQ_SUFFIX}"), true, ParamType::Int)
            .and_then(|p| p.with_binding(ParamBinding::shared(&cell)))
            .and_then(|p| {
                p.with_bounds(Bounds {
                    min: Some(0.0),
                    max: None,
                })
            })
            .map(ParamEntry::internal)
            .and_then(|p| self.params.register(p));
        match shadow {
            Ok(freq_handle) => self.io_types.get_mut(handle)?.set_freq_param(freq_handle),
            Err(err) => {
                self.io_types.remove(handle)?;
                return Err(err.into());
            }
        }

        self.dirty.io_types = true;
        self.dirty.params = true;
        Ok(handle)
    }

    pub fn enable_io_type(&mut self, handle: Handle, enabled: bool) -> Result<()> {
        self.io_types.get_mut(handle)?.set_enabled(enabled);
        Ok(())
    }

    pub fn set_io_layout(&mut self, handle: Handle, layout: Option<ArrayLayout>) -> Result<()> {
        self.io_types.get_mut(handle)?.set_layout(layout);
        Ok(())
    }

    pub fn io_type(&self, handle: Handle) -> Result<&IoTypeEntry> {
        Ok(self.io_types.get(handle)?)
    }

    pub fn io_type_mut(&mut self, handle: Handle) -> Result<&mut IoTypeEntry> {
        Ok(self.io_types.get_mut(handle)?)
    }

    pub fn register_chk_type(&mut self, label: &str, direction: IoDirection) -> Result<Handle> {
        let handle = self.chk_types.register(ChkTypeEntry::new(label, direction)?)?;
        self.dirty.chk_types = true;
        Ok(handle)
    }

    /// Declare a command the application understands.
    ///
    /// `PAUSE_INTERNAL` is not sent on; it makes the library handle `PAUSE`
    /// itself and registers `PAUSE` and `RESUME`.
    pub fn register_command(&mut self, command: SupportedCommand) -> Result<()> {
        if command.id() == PAUSE_INTERNAL {
            self.internal_pause = true;
            for id in [PAUSE, RESUME] {
                if !self.supports(id) {
                    self.register_command(SupportedCommand::new(id))?;
                }
            }
            return Ok(());
        }
        if self.supports(command.id()) {
            return Err(ProtoError::DuplicateLabel(command.label().to_string()).into());
        }
        self.commands.register(command)?;
        self.dirty.commands = true;
        Ok(())
    }

    /// Register built-in or application command ids, skipping known ones.
    /// `RESTART` gets its checkpoint-tag argument.
    pub fn register_commands(&mut self, ids: &[i32]) -> Result<()> {
        for &id in ids {
            if id != PAUSE_INTERNAL && self.supports(id) {
                continue;
            }
            let command = if id == RESTART {
                SupportedCommand::new(id)
                    .with_param(ParamEntry::new(ARG_CHK_TAG, true, ParamType::Char)?)?
            } else if id == EMIT_PARAM_LOG {
                SupportedCommand::new(id)
                    .with_param(ParamEntry::new(ARG_PARAM_HANDLE, true, ParamType::Int)?)?
            } else {
                SupportedCommand::new(id)
            };
            self.register_command(command)?;
        }
        Ok(())
    }

    pub fn supports(&self, id: i32) -> bool {
        self.commands.iter().any(|(_, c)| c.id() == id)
    }

    pub fn supported_command_ids(&self) -> Vec<i32> {
        self.commands.iter().map(|(_, c)| c.id()).collect()
    }

    /// Log a checkpoint with a snapshot of every application parameter.
    pub fn record_checkpoint(&mut self, chk: Handle, tag: &str) -> Result<u64> {
        self.chk_types.get(chk)?;
        self.refresh_values();
        let params = self.snapshot();
        let key = self.log.append(
            LogKind::Checkpoint {
                chk_handle: chk,
                tag: tag.to_string(),
            },
            params,
        )?;
        info!(key, %chk, tag, "recorded checkpoint");
        Ok(key)
    }

    /// Keep a ring of past values for a parameter; `None` uses the configured size.
    pub fn enable_param_history(&mut self, handle: Handle, capacity: Option<usize>) -> Result<()> {
        let capacity = capacity.unwrap_or(self.config.param_history_capacity);
        self.params.get_mut(handle)?.enable_history(capacity)?;
        Ok(())
    }

    pub fn params(&self) -> &HandleTable<ParamEntry> {
        &self.params
    }

    pub fn param(&self, handle: Handle) -> Result<&ParamEntry> {
        Ok(self.params.get(handle)?)
    }

    pub fn param_by_label(&self, label: &str) -> Option<(Handle, &ParamEntry)> {
        self.params.find_by_label(label)
    }

    pub fn io_types(&self) -> &HandleTable<IoTypeEntry> {
        &self.io_types
    }

    pub fn chk_types(&self) -> &HandleTable<ChkTypeEntry> {
        &self.chk_types
    }

    pub fn log(&self) -> &ActivityLog {
        &self.log
    }

    pub fn seq_num(&self) -> i64 {
        self.seq_num
    }

    // Attachment

    /// Attach a steerer over an established link.
    ///
    /// Sends the supported-command handshake, then schedules every
    /// definition and the whole activity log for the next control-loop call.
    /// A previously attached steerer is dropped.
    pub fn attach_steerer(&mut self, mut link: Link) -> Result<()> {
        if self.link.is_some() {
            info!("replacing attached steerer");
        }
        link.post(&Message::SupportedCommands(self.command_defs()))?;
        info!(peer = link.peer(), "steerer attached");
        self.link = Some(link);
        self.dirty = Dirty {
            commands: false,
            params: true,
            io_types: true,
            chk_types: true,
        };
        self.calls_since_status = self.config.status_interval;
        self.log.request_resend_all();
        Ok(())
    }

    /// Listen for a steerer on a Unix socket; control-loop calls accept it.
    pub fn listen_on(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let listener = UnixDomainSocket::bind(path)?;
        info!(path = ?listener.path(), "listening for steerer");
        self.listener = Some(listener);
        Ok(())
    }

    pub fn socket_path(&self) -> Option<&Path> {
        self.listener.as_ref().map(|l| l.path())
    }

    pub fn detach_steerer(&mut self) {
        if let Some(link) = self.link.take() {
            info!(peer = link.peer(), "steerer detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    // Control loop

    /// One non-blocking pass of the steering loop at application step `seq_num`.
    ///
    /// Accepts a waiting steerer, applies at most one received control
    /// message, then sends pending definitions, status and log entries.
    /// A malformed message is returned as an error with the tables untouched.
    pub fn steering_control(&mut self, seq_num: i64) -> Result<ControlOutcome> {
        let mut outcome = ControlOutcome::default();
        if !self.enabled {
            return Ok(outcome);
        }
        self.seq_num = seq_num;
        self.accept_pending()?;
        self.refresh_values();
        self.record_histories();

        let mut echo = Vec::new();
        if let Some(control) = self.poll_control()? {
            for command in self.apply_control(control, &mut outcome)? {
                if is_echoed(command.id) {
                    echo.push(command.clone());
                }
                match command.id {
                    DETACH => self.detach_steerer(),
                    EMIT_PARAM_LOG => self.queue_history(&command),
                    PAUSE if self.internal_pause => self.pause_internally(&mut outcome)?,
                    _ => outcome.commands.push(command),
                }
            }
        }

        for (handle, io) in self.io_types.iter() {
            if io.is_due(seq_num) {
                outcome.commands.push(CommandInvocation::new(handle.get()));
            }
        }

        self.calls_since_status = self.calls_since_status.saturating_add(1);
        let changed = !outcome.changed_params.is_empty();
        self.transmit(changed, echo)?;
        Ok(outcome)
    }

    /// Stop steering: tell the steerer, persist the log, drop the link.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(mut link) = self.link.take() {
            self.refresh_values();
            let status = StatusMsg {
                seq_num: self.seq_num,
                params: self.snapshot(),
                commands: vec![CommandInvocation::new(STOP)],
            };
            if let Err(err) = self.deliver_final(&mut link, &Message::Status(status)) {
                warn!(error = %err, "could not send final status");
            }
        }
        self.listener = None;
        if let Some(dir) = self.config.scratch_dir.clone() {
            self.persist_log(&dir)?;
        }
        self.enabled = false;
        info!(seq_num = self.seq_num, "steering finalized");
        Ok(())
    }

    /// Post `message` and give a slow steerer until the attach timeout to take
    /// it and anything still queued.
    fn deliver_final(&self, link: &mut Link, message: &Message) -> Result<()> {
        let deadline = Instant::now() + self.config.attach_timeout();
        let mut drained = link.post(message)?;
        while !drained {
            if Instant::now() >= deadline {
                return Err(SteerError::Timeout(self.config.attach_timeout()));
            }
            thread::sleep(self.config.poll_interval());
            drained = link.flush_pending()?;
        }
        Ok(())
    }

    fn persist_log(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let mut out = BufWriter::new(File::create(&path)?);
        self.log.write_jsonl(&mut out)?;
        out.flush()?;
        debug!(?path, entries = self.log.len(), "persisted activity log");
        Ok(())
    }

    fn accept_pending(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        if let Some(stream) = listener.try_accept()? {
            let link = Link::from_ipc(stream, &self.config.frame_config())?;
            self.attach_steerer(link)?;
        }
        Ok(())
    }

    fn poll_control(&mut self) -> Result<Option<ControlMsg>> {
        let Some(link) = self.link.as_mut() else {
            return Ok(None);
        };
        match link.try_recv() {
            Ok(Some(Message::Control(control))) => Ok(Some(control)),
            Ok(Some(other)) => {
                warn!(kind = %other.kind(), "ignoring message the application does not handle");
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(err) if is_disconnect(&err) => {
                info!(error = %err, "steerer went away");
                self.link = None;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Apply edits in order and return the commands for the caller to route.
    fn apply_control(
        &mut self,
        control: ControlMsg,
        outcome: &mut ControlOutcome,
    ) -> Result<Vec<CommandInvocation>> {
        let mut applied = Vec::new();
        for update in control.params {
            let result = self
                .params
                .get_mut(update.handle)
                .and_then(|entry| entry.apply_edit(&update.value).map(|()| entry));
            match result {
                Ok(entry) => {
                    debug!(
                        handle = %update.handle,
                        label = entry.label(),
                        value = entry.value(),
                        "applied edit"
                    );
                    applied.push(ParamUpdate::new(update.handle, entry.value()));
                    if !entry.is_internal()
                        && !outcome.changed_params.iter().any(|l| l == entry.label())
                    {
                        outcome.changed_params.push(entry.label().to_string());
                    }
                }
                Err(err) => {
                    warn!(
                        handle = %update.handle,
                        value = %update.value,
                        error = %err,
                        "rejected edit"
                    );
                    outcome.rejected.push(RejectedEdit {
                        handle: update.handle,
                        value: update.value,
                        reason: err.to_string(),
                    });
                }
            }
        }
        if !applied.is_empty() {
            self.log.append(
                LogKind::ParamSnapshot {
                    seq_num: self.seq_num,
                },
                applied,
            )?;
        }
        Ok(control.commands)
    }

    fn pause_internally(&mut self, outcome: &mut ControlOutcome) -> Result<()> {
        match self.steering_pause() {
            Ok(paused) => {
                for label in paused.changed_params {
                    if !outcome.changed_params.contains(&label) {
                        outcome.changed_params.push(label);
                    }
                }
                outcome.rejected.extend(paused.rejected);
                outcome
                    .commands
                    .extend(paused.commands.into_iter().filter(|c| c.id != RESUME));
                Ok(())
            }
            Err(err) if err.is_eof() => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn queue_history(&mut self, command: &CommandInvocation) {
        let requested = command
            .arg(ARG_PARAM_HANDLE)
            .and_then(|text| text.trim().parse::<Handle>().ok());
        match requested {
            Some(handle)
                if self
                    .params
                    .get(handle)
                    .is_ok_and(|p| p.history().is_some()) =>
            {
                if !self.history_requests.contains(&handle) {
                    self.history_requests.push(handle);
                }
            }
            _ => warn!(?requested, "history requested for a parameter without one"),
        }
    }

    fn refresh_values(&mut self) {
        for (_, entry) in self.params.iter_mut() {
            entry.refresh();
        }
    }

    fn record_histories(&mut self) {
        for (_, entry) in self.params.iter_mut() {
            entry.record_history();
        }
    }

    /// Current values of the application's own parameters.
    fn snapshot(&self) -> Vec<ParamUpdate> {
        self.params
            .iter()
            .filter(|(_, p)| !p.is_internal())
            .map(|(handle, p)| ParamUpdate::new(handle, p.value()))
            .collect()
    }

    fn command_defs(&self) -> Vec<regsteer_proto::CommandDef> {
        self.commands.iter().map(|(_, c)| c.to_def()).collect()
    }

    /// Send what the steerer is owed without blocking on it.
    ///
    /// Output the steerer has not read yet is held back; nothing new is
    /// posted until it drains. A broken link, or one whose backlog filled,
    /// is dropped, not reported.
    fn transmit(&mut self, changed: bool, echo: Vec<CommandInvocation>) -> Result<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        match self.send_pending(&mut link, changed, echo) {
            Ok(()) => {
                self.link = Some(link);
                Ok(())
            }
            Err(err) if is_disconnect(&err) => {
                warn!(error = %err, "steerer link failed, detaching");
                Ok(())
            }
            Err(err) => {
                self.link = Some(link);
                Err(err)
            }
        }
    }

    fn send_pending(
        &mut self,
        link: &mut Link,
        changed: bool,
        echo: Vec<CommandInvocation>,
    ) -> Result<()> {
        if !link.flush_pending()? {
            debug!(queued = link.pending_bytes(), "steerer is behind, holding output");
            return Ok(());
        }

        if self.dirty.commands {
            post_or_drop(link, &Message::SupportedCommands(self.command_defs()))?;
            self.dirty.commands = false;
        }
        if self.dirty.params {
            let defs = self.params.iter().map(|(h, p)| p.to_def(h)).collect();
            post_or_drop(link, &Message::ParamDefs(defs))?;
            self.dirty.params = false;
        }
        if self.dirty.io_types {
            let defs = self.io_types.iter().map(|(h, io)| io.to_def(h)).collect();
            post_or_drop(link, &Message::IoDefs(defs))?;
            self.dirty.io_types = false;
        }
        if self.dirty.chk_types {
            let defs = self.chk_types.iter().map(|(h, c)| c.to_def(h)).collect();
            post_or_drop(link, &Message::ChkDefs(defs))?;
            self.dirty.chk_types = false;
        }

        if changed || !echo.is_empty() || self.calls_since_status >= self.config.status_interval {
            let status = StatusMsg {
                seq_num: self.seq_num,
                params: self
                    .params
                    .iter()
                    .map(|(h, p)| ParamUpdate::new(h, p.value()))
                    .collect(),
                commands: echo,
            };
            post_or_drop(link, &Message::Status(status))?;
            self.calls_since_status = 0;
        }

        if !self.history_requests.is_empty() {
            let histories = self
                .history_requests
                .iter()
                .filter_map(|&handle| {
                    let values = self.params.get(handle).ok()?.history()?;
                    Some(ParamHistory { handle, values })
                })
                .collect();
            post_or_drop(
                link,
                &Message::Log(LogMsg {
                    entries: Vec::new(),
                    histories,
                }),
            )?;
            self.history_requests.clear();
        }

        for _ in 0..self.config.max_log_messages_per_call {
            let entries: Vec<_> = self
                .log
                .entries_pending(self.config.log_entries_per_message)
                .into_iter()
                .cloned()
                .collect();
            if entries.is_empty() {
                break;
            }
            let keys: Vec<u64> = entries.iter().map(|e| e.key).collect();
            post_or_drop(
                link,
                &Message::Log(LogMsg {
                    entries,
                    histories: Vec::new(),
                }),
            )?;
            for key in keys {
                self.log.mark_delivered(key)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AppSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSession")
            .field("enabled", &self.enabled)
            .field("params", &self.params.len())
            .field("io_types", &self.io_types.len())
            .field("chk_types", &self.chk_types.len())
            .field("log", &self.log.len())
            .field("attached", &self.link.is_some())
            .field("io_channels", &self.io_channels.len())
            .field("seq_num", &self.seq_num)
            .finish()
    }
}

/// Whether an error means the steerer is gone or has stopped reading.
fn is_disconnect(err: &SteerError) -> bool {
    matches!(
        err,
        SteerError::Frame(FrameError::Eof | FrameError::Io(_) | FrameError::Backlog { .. })
            | SteerError::Io(_)
    )
}

/// Commands acknowledged back in the next status. `STOP` in a status means
/// the application finished, so it is only sent by [`AppSession::finalize`].
fn is_echoed(id: i32) -> bool {
    !matches!(id, STOP | DETACH)
}

/// Post a message; one too large for the link is logged and skipped so that
/// it is not retried on every call.
fn post_or_drop(link: &mut Link, message: &Message) -> Result<()> {
    match link.post(message) {
        Ok(_) => Ok(()),
        Err(SteerError::Frame(FrameError::PayloadTooLarge { size, max })) => {
            warn!(kind = %message.kind(), size, max, "message too large for the link, not sent");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use regsteer_frame::FrameConfig;
    use regsteer_proto::ParamDef;

    use super::*;

    fn attached() -> (AppSession, Link) {
        let (app_end, steer_end) = UnixStream::pair().unwrap();
        let cfg = FrameConfig::default();
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        app.attach_steerer(Link::from_unix(app_end, &cfg).unwrap())
            .unwrap();
        (app, Link::from_unix(steer_end, &cfg).unwrap())
    }

    /// Read messages until the socket goes quiet.
    fn drain(link: &mut Link) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(message) =
            link.recv_timeout(Duration::from_millis(50), Duration::from_millis(2))
        {
            out.push(message);
        }
        out
    }

    fn param_defs(messages: &[Message]) -> Option<&Vec<ParamDef>> {
        messages.iter().find_map(|m| match m {
            Message::ParamDefs(defs) => Some(defs),
            _ => None,
        })
    }

    fn control(params: Vec<ParamUpdate>, commands: Vec<CommandInvocation>) -> Message {
        Message::Control(ControlMsg { params, commands })
    }

    #[test]
    fn builtin_commands_registered() {
        let app = AppSession::new(SteerConfig::default()).unwrap();
        assert_eq!(app.supported_command_ids(), vec![STOP, DETACH, EMIT_PARAM_LOG]);
    }

    #[test]
    fn duplicate_param_label_rejected() {
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        let a = SharedValue::new(1_i32);
        app.register_shared("A", true, &a).unwrap();
        assert!(matches!(
            app.register_shared("A", false, &a),
            Err(SteerError::Proto(ProtoError::DuplicateLabel(_)))
        ));
    }

    #[test]
    fn disabled_loop_does_nothing() {
        let (mut app, mut steerer) = attached();
        assert!(matches!(steerer.recv().unwrap(), Message::SupportedCommands(_)));
        app.enable(false);
        let outcome = app.steering_control(1).unwrap();
        assert!(outcome.is_empty());
        assert!(drain(&mut steerer).is_empty());
    }

    #[test]
    fn first_call_sends_definitions_then_status() {
        let (mut app, mut steerer) = attached();
        let temp = SharedValue::new(55.6_f64);
        app.register_shared("TEMP", true, &temp).unwrap();

        app.steering_control(0).unwrap();
        let messages = drain(&mut steerer);
        let kinds: Vec<_> = messages.iter().map(|m| m.kind().as_str()).collect();
        assert_eq!(
            kinds,
            ["SUPP_CMDS", "PARAM_DEFS", "IO_DEFS", "CHK_DEFS", "STATUS"]
        );
        let defs = param_defs(&messages).unwrap();
        assert_eq!(defs[0].label, "TEMP");
        assert_eq!(defs[0].value, "55.60");
    }

    #[test]
    fn edits_applied_in_order_and_logged() {
        let (mut app, mut steerer) = attached();
        let temp = SharedValue::new(55.6_f64);
        let steps = SharedValue::new(10_i32);
        let t = app.register_shared("TEMP", true, &temp).unwrap();
        let s = app.register_shared("STEPS", true, &steps).unwrap();
        app.steering_control(0).unwrap();
        drain(&mut steerer);

        steerer
            .send(&control(
                vec![ParamUpdate::new(s, "20"), ParamUpdate::new(t, "72.1")],
                vec![],
            ))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let outcome = app.steering_control(1).unwrap();

        assert_eq!(outcome.changed_params, ["STEPS", "TEMP"]);
        assert_eq!(steps.get(), 20);
        assert_eq!(temp.get(), 72.1);
        assert_eq!(app.log().len(), 1);

        let messages = drain(&mut steerer);
        assert!(messages.iter().any(|m| matches!(m, Message::Log(l) if l.entries.len() == 1)));
    }

    #[test]
    fn bad_edits_are_rejected_not_fatal() {
        let (mut app, mut steerer) = attached();
        let n = SharedValue::new(1_i32);
        let watched = SharedValue::new(2_i32);
        let h = app.register_shared("N", true, &n).unwrap();
        let w = app.register_shared("W", false, &watched).unwrap();
        app.steering_control(0).unwrap();

        steerer
            .send(&control(
                vec![
                    ParamUpdate::new(h, "many"),
                    ParamUpdate::new(w, "5"),
                    ParamUpdate::new(Handle::new(99), "1"),
                ],
                vec![CommandInvocation::new(STOP)],
            ))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let outcome = app.steering_control(1).unwrap();
        assert!(outcome.changed_params.is_empty());
        assert_eq!(outcome.rejected.len(), 3);
        assert_eq!(outcome.command_ids(), vec![STOP]);
        assert_eq!(n.get(), 1);
        assert_eq!(watched.get(), 2);
    }

    #[test]
    fn malformed_message_is_an_error() {
        let (mut app, mut steerer) = attached();
        steerer.send_text("<ReG_steer_message>\n<Bogus>").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(app.steering_control(0), Err(SteerError::Proto(_))));
        assert!(app.is_attached());
    }

    #[test]
    fn detach_command_drops_link() {
        let (mut app, mut steerer) = attached();
        steerer
            .send(&control(vec![], vec![CommandInvocation::new(DETACH)]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let outcome = app.steering_control(0).unwrap();
        assert!(outcome.commands.is_empty());
        assert!(!app.is_attached());
    }

    #[test]
    fn closed_steerer_detaches() {
        let (mut app, steerer) = attached();
        drop(steerer);
        app.steering_control(0).unwrap();
        assert!(!app.is_attached());
    }

    #[test]
    fn io_type_gets_frequency_shadow() {
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        let io = app.register_io_type("VIS", IoDirection::Out, 3).unwrap();
        assert_eq!(io, Handle::FIRST_IO_TYPE);

        let (freq, entry) = app.param_by_label("VIS_FREQ").unwrap();
        assert!(entry.is_internal());
        assert_eq!(entry.value(), "3");
        assert_eq!(app.io_type(io).unwrap().freq_param(), freq);

        assert!(matches!(
            app.unregister_params(&["VIS_FREQ"]),
            Err(SteerError::Proto(ProtoError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn io_emissions_follow_frequency() {
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        let io = app.register_io_type("VIS", IoDirection::Out, 2).unwrap();
        app.register_io_type("INPUT", IoDirection::In, 1).unwrap();

        assert_eq!(app.steering_control(0).unwrap().command_ids(), vec![io.get()]);
        assert!(app.steering_control(1).unwrap().commands.is_empty());
        assert_eq!(app.steering_control(2).unwrap().command_ids(), vec![io.get()]);

        app.enable_io_type(io, false).unwrap();
        assert!(app.steering_control(4).unwrap().commands.is_empty());
    }

    #[test]
    fn steering_frequency_changes_emissions() {
        let (mut app, mut steerer) = attached();
        let io = app.register_io_type("VIS", IoDirection::Out, 1).unwrap();
        let freq = app.io_type(io).unwrap().freq_param();
        app.steering_control(0).unwrap();

        steerer
            .send(&control(vec![ParamUpdate::new(freq, "5")], vec![]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let outcome = app.steering_control(1).unwrap();
        assert!(outcome.changed_params.is_empty());
        assert_eq!(app.io_type(io).unwrap().frequency(), 5);
        assert!(outcome.commands.is_empty());
        assert_eq!(app.steering_control(5).unwrap().command_ids(), vec![io.get()]);
    }

    #[test]
    fn unregister_is_all_or_nothing() {
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        let a = SharedValue::new(true);
        app.register_shared("A", true, &a).unwrap();
        app.register_shared("B", true, &a).unwrap();

        assert!(app.unregister_params(&["A", "MISSING"]).is_err());
        assert_eq!(app.params().len(), 2);

        app.unregister_params(&["A"]).unwrap();
        assert!(app.param_by_label("A").is_none());
        let c = app.register_shared("C", true, &a).unwrap();
        assert_eq!(c, Handle::new(2));
        assert_eq!(app.params().handles(), vec![c, Handle::new(1)]);
    }

    #[test]
    fn checkpoint_snapshots_application_params() {
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        let x = SharedValue::new(4_i32);
        let h = app.register_shared("X", true, &x).unwrap();
        app.register_io_type("VIS", IoDirection::Out, 1).unwrap();
        let chk = app.register_chk_type("RESTART_FILE", IoDirection::Out).unwrap();
        assert_eq!(chk, Handle::FIRST_CHK_TYPE);

        x.set(9);
        let key = app.record_checkpoint(chk, "step-100").unwrap();
        let record = app.log().get(key).unwrap();
        assert_eq!(record.params, vec![ParamUpdate::new(h, "9")]);
        assert!(matches!(&record.kind, LogKind::Checkpoint { tag, .. } if tag == "step-100"));

        assert!(app.record_checkpoint(Handle::new(2099), "x").is_err());
    }

    #[test]
    fn pause_internal_registers_pause_and_resume() {
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        app.register_commands(&[PAUSE_INTERNAL, RESTART]).unwrap();
        assert_eq!(
            app.supported_command_ids(),
            vec![STOP, DETACH, EMIT_PARAM_LOG, PAUSE, RESUME, RESTART]
        );
        assert!(matches!(
            app.register_command(SupportedCommand::new(STOP)),
            Err(SteerError::Proto(ProtoError::DuplicateLabel(_)))
        ));
    }

    #[test]
    fn log_flush_is_bounded_per_call() {
        let config = SteerConfig {
            max_log_messages_per_call: 1,
            log_entries_per_message: 2,
            ..SteerConfig::default()
        };
        let (app_end, steer_end) = UnixStream::pair().unwrap();
        let cfg = FrameConfig::default();
        let mut app = AppSession::new(config).unwrap();
        let chk = app.register_chk_type("CHK", IoDirection::Out).unwrap();
        for i in 0..5 {
            app.record_checkpoint(chk, &format!("c{i}")).unwrap();
        }
        app.attach_steerer(Link::from_unix(app_end, &cfg).unwrap())
            .unwrap();
        let mut steerer = Link::from_unix(steer_end, &cfg).unwrap();

        app.steering_control(0).unwrap();
        assert_eq!(app.log().num_unsent(), 3);
        app.steering_control(1).unwrap();
        app.steering_control(2).unwrap();
        assert_eq!(app.log().num_unsent(), 0);

        let logged: usize = drain(&mut steerer)
            .iter()
            .map(|m| match m {
                Message::Log(l) => l.entries.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(logged, 5);
    }

    #[test]
    fn history_sent_on_request() {
        let (mut app, mut steerer) = attached();
        let x = SharedValue::new(1_i32);
        let h = app.register_shared("X", false, &x).unwrap();
        app.enable_param_history(h, Some(2)).unwrap();
        for step in 0..3 {
            x.set(step * 10);
            app.steering_control(step as i64).unwrap();
        }
        drain(&mut steerer);

        steerer
            .send(&control(
                vec![],
                vec![CommandInvocation::new(EMIT_PARAM_LOG)
                    .with_arg(ARG_PARAM_HANDLE, h.to_string())],
            ))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let outcome = app.steering_control(3).unwrap();
        assert!(outcome.commands.is_empty());

        let history = drain(&mut steerer)
            .into_iter()
            .find_map(|m| match m {
                Message::Log(l) if !l.histories.is_empty() => Some(l.histories),
                _ => None,
            })
            .unwrap();
        assert_eq!(history[0].handle, h);
        assert_eq!(history[0].values, ["20", "20"]);
    }

    #[test]
    fn finalize_sends_stop_and_persists_log() {
        let dir = std::env::temp_dir().join(format!(
            "regsteer-app-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let config = SteerConfig {
            scratch_dir: Some(dir.clone()),
            ..SteerConfig::default()
        };
        let (app_end, steer_end) = UnixStream::pair().unwrap();
        let cfg = FrameConfig::default();
        let mut app = AppSession::new(config.clone()).unwrap();
        let chk = app.register_chk_type("CHK", IoDirection::Out).unwrap();
        app.record_checkpoint(chk, "final").unwrap();
        app.attach_steerer(Link::from_unix(app_end, &cfg).unwrap())
            .unwrap();
        let mut steerer = Link::from_unix(steer_end, &cfg).unwrap();

        app.finalize().unwrap();
        assert!(!app.is_attached());
        assert!(!app.is_enabled());
        let stop = drain(&mut steerer).into_iter().any(|m| match m {
            Message::Status(s) => s.has_command(STOP),
            _ => false,
        });
        assert!(stop);

        let reloaded = AppSession::initialize(config).unwrap();
        assert_eq!(reloaded.log().len(), 1);
        assert_eq!(reloaded.log().num_unsent(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unread_steerer_never_blocks_the_loop() {
        let (mut app, mut steerer) = attached();
        let text = SharedValue::new("z".repeat(60 * 1024));
        app.register_shared("TEXT", false, &text).unwrap();

        let start = Instant::now();
        for step in 0..40 {
            app.steering_control(step).unwrap();
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(app.is_attached());

        let mut latest = -1;
        for step in 40..400 {
            app.steering_control(step).unwrap();
            while let Ok(message) =
                steerer.recv_timeout(Duration::from_millis(20), Duration::from_millis(1))
            {
                if let Message::Status(status) = message {
                    latest = status.seq_num;
                }
            }
            if latest >= 40 {
                break;
            }
        }
        assert!(latest >= 40, "output never resumed");
    }

    #[test]
    fn oversized_definitions_are_skipped() {
        let config = SteerConfig {
            max_message_size: 2048,
            ..SteerConfig::default()
        };
        let (app_end, steer_end) = UnixStream::pair().unwrap();
        let mut app = AppSession::new(config.clone()).unwrap();
        app.attach_steerer(Link::from_unix(app_end, &config.frame_config()).unwrap())
            .unwrap();
        let mut steerer = Link::from_unix(steer_end, &FrameConfig::default()).unwrap();
        let note = SharedValue::new("n".repeat(4096));
        app.register_shared("NOTE", false, &note).unwrap();

        for step in 0..3 {
            app.steering_control(step).unwrap();
        }
        assert!(app.is_attached());
        let kinds: Vec<_> = drain(&mut steerer).iter().map(|m| m.kind()).collect();
        assert!(kinds.contains(&regsteer_proto::MessageKind::IoDefs));
        assert!(!kinds.contains(&regsteer_proto::MessageKind::ParamDefs));
    }

    #[test]
    fn listener_accepts_without_blocking() {
        let path = std::env::temp_dir().join(format!(
            "regsteer-listen-{}-{}.sock",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut app = AppSession::new(SteerConfig::default()).unwrap();
        app.listen_on(&path).unwrap();

        app.steering_control(0).unwrap();
        assert!(!app.is_attached());

        let stream = UnixDomainSocket::connect(&path).unwrap();
        let mut steerer = Link::from_ipc(stream, &FrameConfig::default()).unwrap();
        app.steering_control(1).unwrap();
        assert!(app.is_attached());
        assert!(matches!(steerer.recv().unwrap(), Message::SupportedCommands(_)));
    }
}
