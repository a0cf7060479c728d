//! Warden node-agent daemon.
//!
//! Runs the control-plane agent on a management node: one fleet controller
//! at a time over TCP, telemetry pushed back on the same connection.
//!
//! The real node collaborators (sidecar interpreter, workload registry,
//! utilization IPC) are wired in by the node image; this binary carries
//! simple logging stand-ins so the agent can be brought up on a bench and
//! driven end-to-end without them.
//!
//! # Usage
//!
//! ```sh
//! warden-agent --bind 0.0.0.0:9433 --telemetry-interval 2000
//! ```

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::{Duration, Instant};

use warden::agent::{Agent, AgentError, Config};
use warden::net::Endpoint;
use warden::proto::BinaryName;
use warden::shm::{Segment, ShmPath};
use warden::workload::{ConfigInterpreter, RegistryError, UtilizationSampler, WorkloadRegistry};

/// Default telemetry interval in milliseconds.
const DEFAULT_TELEMETRY_MS: u64 = 2000;

fn main() {
    if let Err(e) = run() {
        eprintln!("warden-agent: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AgentError> {
    let args: Vec<String> = std::env::args().collect();
    let config = parse_args(&args)?;

    warden::init_tracing();

    eprintln!("warden-agent: starting on {}", config.bind_addr);

    let _agent = Agent::spawn(
        config,
        Box::new(LoggingInterpreter),
        Box::new(BenchRegistry::new()),
        std::sync::Arc::new(UptimeSampler::new()),
    )?;

    eprintln!("warden-agent: ready");

    // Block until terminated; the handle's Drop signals the agent thread.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

/// Interpreter stand-in that logs and accepts every command.
struct LoggingInterpreter;

impl ConfigInterpreter for LoggingInterpreter {
    fn execute(&mut self, command: &str) -> bool {
        eprintln!("warden-agent: interpreter <- {command}");
        true
    }
}

/// In-memory registry for bench bring-up.
///
/// Binaries live in per-name shared-memory segments; launch just walks
/// them through the interpreter.
struct BenchRegistry {
    binaries: HashMap<BinaryName, Segment>,
    manifest: Option<Vec<u8>>,
}

impl BenchRegistry {
    fn new() -> Self {
        Self {
            binaries: HashMap::new(),
            manifest: None,
        }
    }

    fn slot_path(name: BinaryName) -> Result<ShmPath, RegistryError> {
        let mut hex = String::with_capacity(16);
        for b in name.as_bytes() {
            hex.push_str(&format!("{b:02x}"));
        }
        Ok(ShmPath::new(format!(
            "/warden-bin-{}-{hex}",
            std::process::id()
        ))?)
    }
}

impl WorkloadRegistry for BenchRegistry {
    fn buffer_in_use(&self) -> bool {
        false
    }

    fn binary_slot(&mut self, name: BinaryName) -> Result<&mut Segment, RegistryError> {
        match self.binaries.entry(name) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let path = Self::slot_path(name)?;
                Segment::unlink_stale(&path);
                Ok(e.insert(Segment::allocate(path, 0)?))
            }
        }
    }

    fn ingest_manifest(&mut self, manifest: &[u8]) {
        eprintln!("warden-agent: manifest received ({} bytes)", manifest.len());
        self.manifest = Some(manifest.to_vec());
    }

    fn launch_all(&mut self, interpreter: &mut dyn ConfigInterpreter) {
        eprintln!("warden-agent: launching {} binaries", self.binaries.len());
        for (name, segment) in &self.binaries {
            interpreter.execute(&format!("launch {name} ({} bytes)", segment.len()));
        }
    }
}

/// Idle sampler from process uptime, for bench telemetry.
struct UptimeSampler {
    started: Instant,
}

impl UptimeSampler {
    fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl UtilizationSampler for UptimeSampler {
    fn idle_time(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

/// Parses command line arguments into a Config.
fn parse_args(args: &[String]) -> Result<Config, AgentError> {
    fn invalid(msg: impl ToString) -> AgentError {
        AgentError::Bind(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            msg.to_string(),
        ))
    }

    let mut bind_addr: Option<Endpoint> = None;
    let mut telemetry_ms = DEFAULT_TELEMETRY_MS;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| invalid("missing value for --bind"))?;
                bind_addr = Some(value.parse().map_err(invalid)?);
            }
            "--telemetry-interval" | "-t" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| invalid("missing value for --telemetry-interval"))?;
                telemetry_ms = value.parse().map_err(invalid)?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(invalid(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Config {
        bind_addr: bind_addr.unwrap_or(Endpoint::any(warden::agent::DEFAULT_PORT)),
        telemetry_interval: Duration::from_millis(telemetry_ms),
        ..Config::default()
    })
}

fn print_usage() {
    eprintln!(
        r#"warden-agent - control-plane node agent

USAGE:
    warden-agent [OPTIONS]

OPTIONS:
    -b, --bind <ADDR>                Bind address (default: 0.0.0.0:9433)
    -t, --telemetry-interval <MS>    Telemetry push interval in milliseconds
                                     (default: 2000)
    -h, --help                       Print this help message

EXAMPLE:
    warden-agent --bind 0.0.0.0:9433
    warden-agent --bind 127.0.0.1:0 --telemetry-interval 500
"#
    );
}
