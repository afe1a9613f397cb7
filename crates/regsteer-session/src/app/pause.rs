use std::thread;

use regsteer_proto::command::{DETACH, EMIT_PARAM_LOG, PAUSE, RESUME, STOP};
use regsteer_proto::{CommandInvocation, Message};
use tracing::{debug, info, warn};

use super::{AppSession, ControlOutcome, RejectedEdit};
use crate::error::{Result, SteerError};

/// States of the blocking pause. `Paused` is only seen while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Paused,
    Resumed,
    Stopped,
}

/// What the steerer did while the application was paused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseOutcome {
    pub state: PauseState,
    /// Parameters edited during the pause; the edits are already applied.
    pub changed_params: Vec<String>,
    /// Commands for the application, in arrival order: the `RESUME` or
    /// `STOP` that ended the pause and any others that came with or before it.
    pub commands: Vec<CommandInvocation>,
    pub rejected: Vec<RejectedEdit>,
}

impl AppSession {
    /// Block until the steerer sends `RESUME` or `STOP`.
    ///
    /// Edits received meanwhile are applied at once and acknowledged with a
    /// status message. Waits for a steerer on the listening socket if the
    /// current one detaches; fails with `NotAttached` if there is no way for
    /// one to arrive. A closed link detaches and returns `Eof`.
    pub fn steering_pause(&mut self) -> Result<PauseOutcome> {
        let mut collected = ControlOutcome::default();
        if !self.enabled {
            return Ok(PauseOutcome {
                state: PauseState::Resumed,
                changed_params: Vec::new(),
                commands: Vec::new(),
                rejected: Vec::new(),
            });
        }

        info!(seq_num = self.seq_num, "steering paused");
        let mut state = PauseState::Paused;
        let mut ending = Vec::new();
        while state == PauseState::Paused {
            self.accept_pending()?;
            let Some(link) = self.link.as_mut() else {
                if self.listener.is_none() {
                    return Err(SteerError::NotAttached);
                }
                thread::sleep(self.config.poll_interval());
                continue;
            };

            let control = match link.try_recv() {
                Ok(Some(Message::Control(control))) => control,
                Ok(Some(other)) => {
                    debug!(kind = %other.kind(), "ignored while paused");
                    continue;
                }
                Ok(None) => {
                    thread::sleep(self.config.poll_interval());
                    continue;
                }
                Err(err) if err.is_eof() => {
                    warn!("steerer went away while paused");
                    self.link = None;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };

            let edits_before = collected.changed_params.len();
            let mut echo = Vec::new();
            for command in self.apply_control(control, &mut collected)? {
                if super::is_echoed(command.id) {
                    echo.push(command.clone());
                }
                match command.id {
                    DETACH => self.detach_steerer(),
                    EMIT_PARAM_LOG => self.queue_history(&command),
                    PAUSE => debug!("already paused"),
                    id => {
                        if state == PauseState::Paused {
                            match id {
                                RESUME => state = PauseState::Resumed,
                                STOP => state = PauseState::Stopped,
                                _ => {}
                            }
                        }
                        ending.push(command);
                    }
                }
            }
            let changed = collected.changed_params.len() > edits_before;
            self.transmit(changed, echo)?;
        }

        info!(?state, edits = collected.changed_params.len(), "pause ended");
        Ok(PauseOutcome {
            state,
            changed_params: collected.changed_params,
            commands: ending,
            rejected: collected.rejected,
        })
    }
}
