use regsteer_session::SteerConfig;
use serde::Serialize;
use tracing::info;

use crate::cmd::{attach, sync, SetArgs};
use crate::exit::{steer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct SetOutput {
    sim: String,
    edits: Vec<EditOutput>,
}

#[derive(Serialize)]
struct EditOutput {
    label: String,
    value: String,
}

pub fn run(args: SetArgs, format: OutputFormat, config: SteerConfig) -> CliResult<i32> {
    let edits = args
        .edits
        .iter()
        .map(|text| parse_edit(text))
        .collect::<CliResult<Vec<_>>>()?;

    let mut attached = attach(&args.connect, config)?;
    sync(&mut attached)?;

    let sim = attached.sim;
    for (label, value) in &edits {
        let handle = attached
            .steerer
            .param_by_label(sim, label)
            .map_err(|err| steer_error("set", err))?
            .map(|(handle, _)| handle)
            .ok_or_else(|| CliError::new(USAGE, format!("{sim} has no parameter '{label}'")))?;
        attached
            .steerer
            .set_param_value(sim, handle, value)
            .map_err(|err| steer_error(&format!("set {label}"), err))?;
        info!(%sim, label, value, "staged edit");
    }
    attached
        .steerer
        .emit_control(sim, Vec::new())
        .map_err(|err| steer_error("send failed", err))?;

    let out = SetOutput {
        sim: sim.to_string(),
        edits: edits
            .into_iter()
            .map(|(label, value)| EditOutput { label, value })
            .collect(),
    };
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table | OutputFormat::Pretty => {
            for edit in &out.edits {
                println!("{}: {} = {}", out.sim, edit.label, edit.value);
            }
        }
    }
    attached.detach();
    Ok(SUCCESS)
}

fn parse_edit(text: &str) -> CliResult<(String, String)> {
    match text.split_once('=') {
        Some((label, value)) if !label.trim().is_empty() => {
            Ok((label.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(CliError::new(
            USAGE,
            format!("expected LABEL=VALUE, got '{text}'"),
        )),
    }
}
