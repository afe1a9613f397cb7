use regsteer_session::SteerConfig;

use crate::cmd::{attach, sync, ParamsArgs};
use crate::exit::{steer_error, CliResult, SUCCESS};
use crate::output::{print_params, OutputFormat, ParamRow};

pub fn run(args: ParamsArgs, format: OutputFormat, config: SteerConfig) -> CliResult<i32> {
    let mut attached = attach(&args.connect, config)?;
    sync(&mut attached)?;

    let steerer = &attached.steerer;
    let sim = attached.sim;
    let mut rows = Vec::new();
    for steerable in [true, false] {
        if (steerable && args.monitored) || (!steerable && args.steerable) {
            continue;
        }
        let params = steerer
            .params(sim, steerable)
            .map_err(|err| steer_error("params", err))?;
        rows.extend(
            params
                .into_iter()
                .filter(|(_, p)| args.all || !p.is_internal())
                .map(|(handle, p)| ParamRow::new(handle, p)),
        );
    }
    rows.sort_by_key(|row| row.handle);
    let seq_num = steerer
        .app_seq_num(sim)
        .map_err(|err| steer_error("params", err))?;

    print_params(&sim.to_string(), seq_num, &rows, format);
    attached.detach();
    Ok(SUCCESS)
}
