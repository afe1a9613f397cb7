use regsteer_session::SteerConfig;

use crate::cmd::{attach, sync, CheckpointsArgs};
use crate::exit::{steer_error, CliResult, SUCCESS};
use crate::output::{print_log, OutputFormat};

pub fn run(args: CheckpointsArgs, format: OutputFormat, config: SteerConfig) -> CliResult<i32> {
    let mut attached = attach(&args.connect, config)?;
    sync(&mut attached)?;

    let records = attached
        .steerer
        .chk_log_reverse(attached.sim, args.last)
        .map_err(|err| steer_error("checkpoints", err))?;
    print_log(&records, format);

    attached.detach();
    Ok(SUCCESS)
}
