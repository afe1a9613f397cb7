//! A pretend simulation with one steerable parameter.
//!
//! Run with:
//!   cargo run --example simple
//!
//! In another terminal (use the socket path printed at startup):
//!   cargo run --features cli -- params <socket>
//!   cargo run --features cli -- set <socket> TEMP=72.1
//!   cargo run --features cli -- signal <socket> stop

use std::fs;
use std::thread;
use std::time::Duration;

use regsteer::proto::command::{PAUSE_INTERNAL, STOP};
use regsteer::proto::{IoDirection, SharedValue};
use regsteer::{AppSession, SteerConfig};
use tracing::level_filters::LevelFilter;

const LOOPS: i64 = 5_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::INFO)
        .with_target(false)
        .init();

    let sock_dir = std::env::temp_dir().join(format!("regsteer-simple-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("simple.sock");

    let config = SteerConfig {
        scratch_dir: Some(sock_dir.clone()),
        ..SteerConfig::default()
    }
    .with_env_overrides()?;
    let mut app = AppSession::initialize(config)?;
    app.register_commands(&[PAUSE_INTERNAL])?;

    let temp = SharedValue::new(55.6_f32);
    let step = SharedValue::new(0_i32);
    app.register_shared("TEMP", true, &temp)?;
    app.register_shared("STEP", false, &step)?;
    let vis = app.register_io_type("VIS_OUTPUT", IoDirection::Out, 10)?;
    let chk = app.register_chk_type("RESTART_FILE", IoDirection::Out)?;

    app.listen_on(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    for i in 0..LOOPS {
        // This is where the physics would go.
        thread::sleep(Duration::from_millis(200));
        step.set(i32::try_from(i)?);

        let outcome = match app.steering_control(i) {
            Ok(outcome) => outcome,
            Err(err) => {
                eprintln!("steering_control failed: {err}");
                continue;
            }
        };
        if !outcome.changed_params.is_empty() {
            eprintln!("step {i}: steered {:?}, temp = {}", outcome.changed_params, temp.get());
        }
        if outcome.has_command(STOP) {
            eprintln!("step {i}: stop requested");
            break;
        }
        if outcome.has_command(vis.get()) {
            eprintln!("step {i}: emitting sample, temp = {}", temp.get());
        }
        if i > 0 && i % 50 == 0 {
            app.record_checkpoint(chk, &format!("step-{i}"))?;
        }
    }

    app.finalize()?;
    Ok(())
}
