// Diagnostic probe for a poolnet relay.
//
// Connects a `Session`, optionally moves into a pool, then logs every
// mailbox message and the heartbeat RTT until the time runs out. Useful for
// checking that a relay deployment answers the handshake and echoes pings.
// Log verbosity follows `RUST_LOG` (default `info`).
//
// Usage:
//   poolnet-probe [OPTIONS]
//     --host <HOST>          Relay host (default: 127.0.0.1)
//     --send-port <PORT>     Stream port we write to (default: 7000)
//     --read-port <PORT>     Stream port we read from (default: 7001)
//     --udp-port <PORT>      Datagram port (default: 7002)
//     --pool <NAME>          Pool to move into after connecting (optional)
//     --pool-type <TYPE>     Pool type sent with --pool (default: lobby)
//     --seconds <N>          How long to stay connected (default: 30)
//     --config <PATH>        ClientConfig JSON file (optional)

use std::sync::mpsc;
use std::time::{Duration, Instant};

use poolnet_client::{ClientConfig, Session};

struct ProbeArgs {
    host: String,
    send_port: u16,
    read_port: u16,
    udp_port: u16,
    pool: Option<String>,
    pool_type: String,
    seconds: u64,
    config: Option<String>,
}

impl Default for ProbeArgs {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            send_port: 7000,
            read_port: 7001,
            udp_port: 7002,
            pool: None,
            pool_type: "lobby".into(),
            seconds: 30,
            config: None,
        }
    }
}

fn main() {
    init_logging();
    let args = parse_args();

    let config = match &args.config {
        Some(path) => ClientConfig::load(path).unwrap_or_else(|e| {
            eprintln!("Failed to load config {path}: {e}");
            std::process::exit(1);
        }),
        None => ClientConfig::default(),
    };

    let session = Session::new(config);
    session.init();

    let (tx, rx) = mpsc::channel();
    session.connect(
        &args.host,
        args.send_port,
        args.read_port,
        args.udp_port,
        move |result| {
            let _ = tx.send(result);
        },
    );
    match rx.recv_timeout(Duration::from_secs(10)) {
        Ok(Ok(_)) => tracing::info!(conn_id = %session.conn_id(), "handshake complete"),
        Ok(Err(e)) => {
            eprintln!("Failed to connect: {e}");
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("No connect reply from relay within 10s");
            std::process::exit(1);
        }
    }

    if let Some(pool) = &args.pool {
        let (tx, rx) = mpsc::channel();
        session.move_to_pool(pool, &args.pool_type, move |result| {
            let _ = tx.send(result);
        });
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(_)) => tracing::info!(pool = %session.main_pool(), "joined pool"),
            Ok(Err(e)) => tracing::error!(error = %e, "move to pool failed"),
            Err(_) => tracing::warn!(pool = %pool, "no pool reply within 10s"),
        }
    }

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut last_report = Instant::now();
    while Instant::now() < deadline && session.is_connected() {
        while let Some(msg) = session.check_for_server_messages() {
            tracing::info!(mailbox = "server", %msg);
        }
        while let Some(msg) = session.check_for_client_messages() {
            tracing::info!(mailbox = "client", %msg);
        }
        while let Some(msg) = session.check_for_conn_messages() {
            tracing::info!(mailbox = "conn", %msg);
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            tracing::info!(
                rtt_ms = session.rtt_ms(),
                pools = ?session.all_pools(),
                "status"
            );
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    if !session.is_connected() {
        tracing::warn!("relay connection lost");
    }
    session.shutdown_stream_clients();
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}

/// Parse command-line arguments. Plain `std::env::args()` matching.
fn parse_args() -> ProbeArgs {
    let mut parsed = ProbeArgs::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                parsed.host = value(&args, i, "--host");
            }
            "--send-port" => {
                i += 1;
                parsed.send_port = number(&args, i, "--send-port");
            }
            "--read-port" => {
                i += 1;
                parsed.read_port = number(&args, i, "--read-port");
            }
            "--udp-port" => {
                i += 1;
                parsed.udp_port = number(&args, i, "--udp-port");
            }
            "--pool" => {
                i += 1;
                parsed.pool = Some(value(&args, i, "--pool"));
            }
            "--pool-type" => {
                i += 1;
                parsed.pool_type = value(&args, i, "--pool-type");
            }
            "--seconds" => {
                i += 1;
                parsed.seconds = number(&args, i, "--seconds");
            }
            "--config" => {
                i += 1;
                parsed.config = Some(value(&args, i, "--config"));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    args.get(i).cloned().unwrap_or_else(|| {
        eprintln!("{flag} requires a value");
        std::process::exit(1);
    })
}

fn number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
        eprintln!("{flag} requires a valid number");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: poolnet-probe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --host <HOST>          Relay host (default: 127.0.0.1)");
    println!("  --send-port <PORT>     Stream port we write to (default: 7000)");
    println!("  --read-port <PORT>     Stream port we read from (default: 7001)");
    println!("  --udp-port <PORT>      Datagram port (default: 7002)");
    println!("  --pool <NAME>          Pool to move into after connecting");
    println!("  --pool-type <TYPE>     Pool type sent with --pool (default: lobby)");
    println!("  --seconds <N>          How long to stay connected (default: 30)");
    println!("  --config <PATH>        ClientConfig JSON file");
    println!("  --help, -h             Show this help");
}
