use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use regsteer_proto::{Labeled, MessageKind};
use regsteer_session::SteerConfig;
use serde::Serialize;

use crate::cmd::{attach, WatchArgs};
use crate::exit::{steer_error, CliError, CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct StatusLine {
    sim: String,
    seq_num: i64,
    values: Vec<(String, String)>,
    done: bool,
}

pub fn run(args: WatchArgs, format: OutputFormat, config: SteerConfig) -> CliResult<i32> {
    let mut attached = attach(&args.connect, config)?;
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let sim = attached.sim;
    let poll = attached.steerer.config().poll_interval();
    let mut seen = 0usize;
    while running.load(Ordering::SeqCst) {
        let event = match attached.steerer.get_message_from(sim) {
            Ok(Some(event)) => event,
            Ok(None) => {
                thread::sleep(poll);
                continue;
            }
            Err(err) => return Err(steer_error("receive failed", err)),
        };
        if event.done {
            print_status(
                &StatusLine {
                    sim: sim.to_string(),
                    seq_num: -1,
                    values: Vec::new(),
                    done: true,
                },
                format,
            );
            return Ok(SUCCESS);
        }
        if event.kind != MessageKind::Status {
            continue;
        }

        let steerer = &attached.steerer;
        let values = steerer
            .params(sim, true)
            .and_then(|mut steerable| {
                steerable.extend(steerer.params(sim, false)?);
                Ok(steerable)
            })
            .map_err(|err| steer_error("watch", err))?
            .into_iter()
            .filter(|(_, p)| !p.is_internal())
            .map(|(_, p)| (p.label().to_string(), p.value().to_string()))
            .collect();
        let seq_num = steerer
            .app_seq_num(sim)
            .map_err(|err| steer_error("watch", err))?;
        print_status(
            &StatusLine {
                sim: sim.to_string(),
                seq_num,
                values,
                done: false,
            },
            format,
        );

        seen += 1;
        if args.count.is_some_and(|count| seen >= count) {
            break;
        }
    }

    attached.detach();
    Ok(SUCCESS)
}

fn print_status(line: &StatusLine, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(line),
        OutputFormat::Table | OutputFormat::Pretty if line.done => {
            println!("{} finished", line.sim);
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            let values = line
                .values
                .iter()
                .map(|(label, value)| format!("{label}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{} step {}: {values}", line.sim, line.seq_num);
        }
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
