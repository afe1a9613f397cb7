use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Subcommand, ValueEnum};
use regsteer_proto::MessageKind;
use regsteer_session::{SimId, SteerConfig, SteerError, SteerEvent, Steerer};
use regsteer_transport::TransportError;
use tracing::debug;

use crate::exit::{steer_error, CliError, CliResult, SIM_FINISHED, TIMEOUT, USAGE};
use crate::output::OutputFormat;

pub mod checkpoints;
pub mod history;
pub mod params;
pub mod set;
pub mod signal;
pub mod version;
pub mod watch;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show a simulation's parameters.
    Params(ParamsArgs),
    /// Change steerable parameters.
    Set(SetArgs),
    /// Send a control command to a simulation.
    Signal(SignalArgs),
    /// Follow status updates until the simulation finishes.
    Watch(WatchArgs),
    /// List logged checkpoints, newest first.
    Checkpoints(CheckpointsArgs),
    /// Fetch the value history of a parameter.
    History(HistoryArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat, config: SteerConfig) -> CliResult<i32> {
    match command {
        Command::Params(args) => params::run(args, format, config),
        Command::Set(args) => set::run(args, format, config),
        Command::Signal(args) => signal::run(args, config),
        Command::Watch(args) => watch::run(args, format, config),
        Command::Checkpoints(args) => checkpoints::run(args, format, config),
        Command::History(args) => history::run(args, format, config),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Socket path the simulation listens on.
    pub path: PathBuf,
    /// How long to wait for the simulation (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ParamsArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Only steerable parameters.
    #[arg(long, conflicts_with = "monitored")]
    pub steerable: bool,
    /// Only monitored (read-only) parameters.
    #[arg(long)]
    pub monitored: bool,
    /// Include library-owned parameters such as I/O frequencies.
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Edits as LABEL=VALUE.
    #[arg(required = true, value_name = "LABEL=VALUE")]
    pub edits: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum SignalAction {
    Stop,
    Pause,
    Resume,
    Restart,
    Detach,
}

#[derive(Args, Debug)]
pub struct SignalArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    pub action: SignalAction,
    /// Checkpoint tag to restart from.
    #[arg(long, required_if_eq("action", "restart"))]
    pub tag: Option<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Exit after N status updates.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct CheckpointsArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Number of checkpoints to show.
    #[arg(long, default_value = "10")]
    pub last: usize,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Parameter label.
    pub label: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// An attached steerer and the one simulation it talks to.
pub struct Attached {
    pub steerer: Steerer,
    pub sim: SimId,
    pub timeout: Duration,
}

impl Attached {
    /// Tell the simulation we are leaving. It may already be gone.
    pub fn detach(mut self) {
        if self.steerer.is_attached(self.sim) {
            if let Err(err) = self.steerer.detach(self.sim) {
                debug!(error = %err, "detach failed");
            }
        }
    }
}

/// Connect to the simulation's socket, retrying until it appears, and
/// complete the handshake.
pub fn attach(args: &ConnectArgs, config: SteerConfig) -> CliResult<Attached> {
    let timeout = parse_timeout(&args.timeout)?;
    let config = SteerConfig {
        attach_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        ..config
    };
    let poll = config.poll_interval();
    let mut steerer = Steerer::new(config).map_err(|err| steer_error("config", err))?;

    let start = Instant::now();
    loop {
        match steerer.attach_path(&args.path) {
            Ok(sim) => {
                return Ok(Attached {
                    steerer,
                    sim,
                    timeout,
                })
            }
            Err(err) if is_retryable_connect_error(&err) && start.elapsed() < timeout => {
                thread::sleep(poll);
            }
            Err(err) if is_retryable_connect_error(&err) => {
                return Err(CliError::new(
                    TIMEOUT,
                    format!("no simulation at {} after {timeout:?}", display(&args.path)),
                ))
            }
            Err(err) => return Err(steer_error("attach failed", err)),
        }
    }
}

fn is_retryable_connect_error(err: &SteerError) -> bool {
    match err {
        SteerError::Transport(TransportError::Connect { source, .. }) => matches!(
            source.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        ),
        _ => false,
    }
}

/// Handle messages until `stop` accepts one. A finished simulation is an error.
pub fn pump_until(
    attached: &mut Attached,
    mut stop: impl FnMut(&Steerer, &SteerEvent) -> bool,
) -> CliResult<SteerEvent> {
    let deadline = Instant::now() + attached.timeout;
    let poll = attached.steerer.config().poll_interval();
    loop {
        match attached.steerer.get_message_from(attached.sim) {
            Ok(Some(event)) if event.done => {
                return Err(CliError::new(
                    SIM_FINISHED,
                    format!("{} finished", attached.sim),
                ))
            }
            Ok(Some(event)) => {
                if stop(&attached.steerer, &event) {
                    return Ok(event);
                }
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!(
                            "{} sent nothing useful within {:?}",
                            attached.sim, attached.timeout
                        ),
                    ));
                }
                thread::sleep(poll);
            }
            Err(err) => return Err(steer_error("receive failed", err)),
        }
    }
}

/// Wait for the first status message, then take the rest of the catch-up
/// output: definitions and log replay.
///
/// Stops at the first status not preceded by log traffic (the application
/// has nothing more to replay), when the link goes quiet, or at the
/// timeout, whichever comes first.
pub fn sync(attached: &mut Attached) -> CliResult<()> {
    pump_until(attached, |_, event| event.kind == MessageKind::Status)?;
    let deadline = Instant::now() + attached.timeout;
    let poll = attached.steerer.config().poll_interval();
    let mut logs_since_status = 0usize;
    let mut idle = false;
    loop {
        if Instant::now() >= deadline {
            debug!(sim = %attached.sim, "sync stopped at timeout");
            return Ok(());
        }
        match attached.steerer.get_message_from(attached.sim) {
            Ok(Some(event)) if event.done => return Ok(()),
            Ok(Some(event)) => {
                idle = false;
                match event.kind {
                    MessageKind::Status if logs_since_status == 0 => return Ok(()),
                    MessageKind::Status => logs_since_status = 0,
                    MessageKind::Log => logs_since_status += 1,
                    _ => {}
                }
            }
            Ok(None) if idle => return Ok(()),
            Ok(None) => {
                idle = true;
                thread::sleep(poll);
            }
            Err(err) => return Err(steer_error("receive failed", err)),
        }
    }
}

pub fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_units() {
        assert_eq!(parse_timeout("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_timeout("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_timeout("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_timeout_invalid() {
        assert!(parse_timeout("0s").is_err());
        assert!(parse_timeout("soon").is_err());
        assert!(parse_timeout(" ").is_err());
    }

    #[test]
    fn sync_returns_while_simulation_keeps_talking() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::{mpsc, Arc};

        use regsteer_proto::SharedValue;
        use regsteer_session::AppSession;

        let path = std::env::temp_dir().join(format!(
            "regsteer-sync-{}-{}.sock",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel();
        let sim_path = path.clone();
        let sim_running = Arc::clone(&running);
        let sim = thread::spawn(move || {
            let mut app = AppSession::new(SteerConfig::default()).unwrap();
            let x = SharedValue::new(3_i32);
            app.register_shared("X", true, &x).unwrap();
            app.listen_on(&sim_path).unwrap();
            ready_tx.send(()).unwrap();
            let mut step = 0;
            while sim_running.load(Ordering::SeqCst) {
                app.steering_control(step).unwrap();
                step += 1;
                thread::sleep(Duration::from_millis(5));
            }
        });
        ready_rx.recv().unwrap();

        let args = ConnectArgs {
            path,
            timeout: "5s".to_string(),
        };
        let config = SteerConfig {
            pause_poll_interval_ms: 10,
            ..SteerConfig::default()
        };
        let mut attached = attach(&args, config).unwrap();
        let start = Instant::now();
        sync(&mut attached).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(attached
            .steerer
            .param_by_label(attached.sim, "X")
            .unwrap()
            .is_some());

        attached.detach();
        running.store(false, Ordering::SeqCst);
        sim.join().unwrap();
    }

    #[test]
    fn missing_socket_times_out() {
        let args = ConnectArgs {
            path: std::env::temp_dir()
                .join(format!("regsteer-none-{}.sock", std::process::id())),
            timeout: "100ms".to_string(),
        };
        let config = SteerConfig {
            pause_poll_interval_ms: 10,
            ..SteerConfig::default()
        };
        let err = attach(&args, config).err().unwrap();
        assert_eq!(err.code, TIMEOUT);
    }
}
