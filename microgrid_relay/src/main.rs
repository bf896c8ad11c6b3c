// CLI entry point for the microgrid market relay.
//
// Starts a standalone relay that market, participant, and simulation-
// controller processes connect to. The relay routes protocol events between
// them — it never computes market-clearing logic. See `server.rs` for the
// networking architecture and `broker.rs` for the coordination state.
//
// Usage:
//   relay [OPTIONS]
//     --host <HOST>           Listen address (default: 127.0.0.1)
//     --port <PORT>           Listen port (default: 42069)

use microgrid_relay::server::{RelayConfig, start_relay};

fn main() {
    env_logger::init();
    let config = parse_args();

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    println!("Relay listening on {addr}");
    println!("The relay exits on its own once the simulation ends; Ctrl+C stops it early.");

    // Block until the shutdown watchdog ends the server loop (all sessions
    // gone after EndSimulation). SIGINT/SIGTERM kill the process directly,
    // which is fine for a relay with no durable state.
    handle.wait();
}

/// Parse command-line arguments into a `RelayConfig`. Uses simple
/// `std::env::args()` matching — no clap dependency.
fn parse_args() -> RelayConfig {
    let mut config = RelayConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                config.host = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--host requires a value");
                    std::process::exit(1);
                });
            }
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
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

    config
}

fn print_usage() {
    println!("Usage: relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --host <HOST>           Listen address (default: 127.0.0.1)");
    println!("  --port <PORT>           Listen port (default: 42069)");
    println!("  --help, -h              Show this help");
}
