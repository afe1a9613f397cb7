use regsteer_proto::MessageKind;
use regsteer_session::SteerConfig;

use crate::cmd::{attach, pump_until, sync, HistoryArgs};
use crate::exit::{steer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_history, OutputFormat};

pub fn run(args: HistoryArgs, format: OutputFormat, config: SteerConfig) -> CliResult<i32> {
    let mut attached = attach(&args.connect, config)?;
    sync(&mut attached)?;

    let sim = attached.sim;
    let handle = attached
        .steerer
        .param_by_label(sim, &args.label)
        .map_err(|err| steer_error("history", err))?
        .map(|(handle, _)| handle)
        .ok_or_else(|| CliError::new(USAGE, format!("{sim} has no parameter '{}'", args.label)))?;
    attached
        .steerer
        .emit_retrieve_param_log(sim, handle)
        .map_err(|err| steer_error("history", err))?;

    pump_until(&mut attached, |steerer, event| {
        event.kind == MessageKind::Log
            && steerer
                .param_history(sim, handle)
                .is_ok_and(|history| history.is_some())
    })?;
    let values = attached
        .steerer
        .param_history(sim, handle)
        .map_err(|err| steer_error("history", err))?
        .unwrap_or_default();
    print_history(&args.label, &values, format);

    attached.detach();
    Ok(SUCCESS)
}
