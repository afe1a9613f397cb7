#![cfg(all(unix, feature = "cli"))]

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regsteer::proto::SharedValue;
use regsteer::{AppSession, SteerConfig};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/regsteer-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

struct Sim {
    temp: SharedValue<f64>,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Sim {
    /// Run a steerable application on `sock` until stopped.
    fn start(sock: PathBuf) -> Self {
        let temp = SharedValue::new(55.6_f64);
        let stop = Arc::new(AtomicBool::new(false));
        let (bound, ready) = std::sync::mpsc::channel();

        let app_temp = temp.clone();
        let app_stop = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            let mut app = AppSession::new(SteerConfig::default()).expect("app session");
            app.register_shared("TEMP", true, &app_temp).expect("TEMP");
            app.register_shared("STEP", false, &SharedValue::new(7_i32))
                .expect("STEP");
            app.listen_on(&sock).expect("listen");
            bound.send(()).expect("ready signal");

            let mut seq = 0;
            while !app_stop.load(Ordering::SeqCst) {
                app.steering_control(seq).expect("control");
                seq += 1;
                thread::sleep(Duration::from_millis(10));
            }
        });
        ready
            .recv_timeout(Duration::from_secs(5))
            .expect("application should listen");
        Self { temp, stop, thread }
    }

    fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        self.thread.join().expect("application thread");
    }
}

#[test]
fn params_lists_registered_parameters_as_json() {
    let dir = unique_temp_dir("params");
    let sock = dir.join("sim.sock");
    let sim = Sim::start(sock.clone());

    let output = Command::new(env!("CARGO_BIN_EXE_regsteer"))
        .args(["--log-level", "error", "--format", "json", "params"])
        .arg(&sock)
        .output()
        .expect("params should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"label\":\"TEMP\""));
    assert!(stdout.contains("\"value\":\"55.60\""));
    assert!(stdout.contains("\"label\":\"STEP\""));

    sim.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn set_changes_a_steerable_parameter() {
    let dir = unique_temp_dir("set");
    let sock = dir.join("sim.sock");
    let sim = Sim::start(sock.clone());

    let output = Command::new(env!("CARGO_BIN_EXE_regsteer"))
        .args(["--log-level", "error", "--format", "json", "set"])
        .arg(&sock)
        .arg("TEMP=72.1")
        .output()
        .expect("set should run");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("\"label\":\"TEMP\""));

    let deadline = Instant::now() + Duration::from_secs(5);
    while sim.temp.get() != 72.1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(sim.temp.get(), 72.1);

    sim.shutdown();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_simulation_times_out_with_124() {
    let missing = unique_temp_dir("missing").join("nobody.sock");

    let output = Command::new(env!("CARGO_BIN_EXE_regsteer"))
        .arg("params")
        .arg(&missing)
        .args(["--timeout", "300ms"])
        .output()
        .expect("params should run");

    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn version_prints_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_regsteer"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}
