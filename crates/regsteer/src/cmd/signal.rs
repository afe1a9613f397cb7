use regsteer_session::SteerConfig;
use tracing::info;

use crate::cmd::{attach, SignalAction, SignalArgs};
use crate::exit::{steer_error, CliError, CliResult, SUCCESS, USAGE};

/// Send one command right after the handshake. No status is awaited, so
/// this also reaches a simulation that is paused.
pub fn run(args: SignalArgs, config: SteerConfig) -> CliResult<i32> {
    let mut attached = attach(&args.connect, config)?;
    let sim = attached.sim;
    let steerer = &mut attached.steerer;

    let sent = match args.action {
        SignalAction::Stop => steerer.emit_stop(sim),
        SignalAction::Pause => steerer.emit_pause(sim),
        SignalAction::Resume => steerer.emit_resume(sim),
        SignalAction::Restart => {
            let tag = args
                .tag
                .as_deref()
                .ok_or_else(|| CliError::new(USAGE, "restart needs --tag"))?;
            steerer.emit_restart(sim, tag)
        }
        SignalAction::Detach => steerer.emit_detach(sim),
    };
    sent.map_err(|err| steer_error(&format!("{:?}", args.action).to_lowercase(), err))?;
    info!(%sim, action = ?args.action, "signal sent");

    attached.detach();
    Ok(SUCCESS)
}
