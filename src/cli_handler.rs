//! Command handling for the wiretap binary.

use anyhow::{bail, Context, Result};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::capture::{
    render_packets, CaptureSession, GroupedTraffic, GroupingOptions, TrafficLayer, TrafficQuery,
};
use crate::cli::{Commands, PolicyCommand, ProbeArgs};
use crate::config::{Config, ConfigLoader};
use crate::engine::Wiretap;
use crate::intercept::is_policy_refusal;
use crate::policy::{parse_host_port, resolve_in, AddressPattern, Decision};
use crate::telemetry::AuditLogger;
use crate::tls::TlsClient;

/// Handle a parsed subcommand.
pub fn handle_command(command: Commands, loader: &ConfigLoader, config_path: Option<&Path>) -> Result<()> {
    match command {
        Commands::Probe(args) => {
            let config = loader
                .load(config_path)
                .context("Failed to load configuration")?;
            run_probe(&args, config)
        }
        Commands::Policy { action } => match action {
            PolicyCommand::Check { file } => {
                let config = loader
                    .load(file.as_deref().or(config_path))
                    .context("Invalid configuration")?;
                policy_check(&config)
            }
            PolicyCommand::Resolve { target, file } => {
                let config = loader
                    .load(file.as_deref().or(config_path))
                    .context("Invalid configuration")?;
                policy_resolve(&config, &target)
            }
        },
    }
}

/// Print the effective policy table, most specific entries first.
fn policy_check(config: &Config) -> Result<()> {
    let wiretap = Wiretap::from_config(config, Arc::new(AuditLogger::new_null()))?;
    let entries = wiretap.registry().entries();

    println!("Configuration OK: {} policy entries", entries.len());
    for entry in entries {
        println!("  {:<40} {}", entry.address().to_string(), entry.decision);
    }
    if let Some(path) = wiretap.persist_path() {
        println!("Persisted policy: {}", path.display());
    }
    Ok(())
}

/// Print the decision for one address and the entry that produced it.
fn policy_resolve(config: &Config, target: &str) -> Result<()> {
    let (host, port) = parse_host_port(target).context("Invalid target")?;
    let wiretap = Wiretap::from_config(config, Arc::new(AuditLogger::new_null()))?;
    let resolution = resolve_in(&wiretap.registry().snapshot(), &[host.as_str()], port);

    println!("{} -> {}", target, resolution.decision);
    match &resolution.entry {
        Some(entry) => println!("  matched {}", entry.address()),
        None => println!("  no matching entry (default)"),
    }
    Ok(())
}

fn apply_rule(wiretap: &Wiretap, address: &str, decision: Decision) -> Result<()> {
    let pattern = AddressPattern::parse(address)
        .with_context(|| format!("Invalid address '{}'", address))?;
    debug!("Probe rule {} -> {}", pattern, decision);
    wiretap.registry().set(pattern, decision);
    Ok(())
}

/// Connect through the interceptor, exchange one message and print the capture.
fn run_probe(args: &ProbeArgs, mut config: Config) -> Result<()> {
    let (host, port) = parse_host_port(&args.target).context("Invalid target")?;
    let timeout = Duration::from_millis(args.timeout_ms.max(1));

    if args.group_by_stack {
        config.capture.capture_stack_traces = Some(true);
    }
    let wiretap = Wiretap::from_config(&config, Arc::new(AuditLogger::new()))?;

    for address in &args.deny {
        apply_rule(&wiretap, address, Decision::Closed)?;
    }
    for address in &args.discard {
        apply_rule(&wiretap, address, Decision::Discard)?;
    }
    for rule in &args.delay {
        let Some((address, ms)) = ProbeArgs::parse_delay_rule(rule) else {
            bail!("Invalid delay rule '{}': expected ADDR=MS", rule);
        };
        apply_rule(&wiretap, &address, Decision::delay(Duration::from_millis(ms)))?;
    }

    wiretap.attach();
    let session = wiretap.start_session();
    println!("{} -> {}", args.target, wiretap.resolve(&host, port));

    let stream = match wiretap.interceptor().connect_timeout(&host, port, timeout) {
        Ok(stream) => stream,
        Err(e) if e.is_policy_refusal() => {
            println!("{}", e);
            return Ok(());
        }
        Err(e) => return Err(e).context("Connection failed"),
    };
    stream.set_read_timeout(Some(timeout))?;
    if stream.is_discarded() {
        println!("Connection discarded: the peer will never answer");
    }

    if args.tls {
        let client = match &args.ca_file {
            Some(path) => TlsClient::with_pem_roots(path, wiretap.audit()),
            None => TlsClient::with_native_roots(wiretap.audit()),
        }?;
        let server_name = args.server_name.as_deref().unwrap_or(&host);
        let mut tls = client.connect_blocking(server_name, stream)?;
        exchange(&mut tls, args.send.as_deref())?;
    } else {
        let mut stream = stream;
        exchange(&mut stream, args.send.as_deref())?;
    }

    print_capture(&session, args);
    Ok(())
}

/// Send `message`, then wait for one response read.
fn exchange<S: Read + Write>(stream: &mut S, message: Option<&str>) -> Result<()> {
    if let Some(message) = message {
        stream.write_all(message.as_bytes())?;
        stream.flush()?;
    }

    let mut buf = vec![0u8; 16 * 1024];
    match stream.read(&mut buf) {
        Ok(0) => println!("Peer closed the connection"),
        Ok(n) => println!("Received {} bytes", n),
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            println!("No response within the timeout");
        }
        Err(e) if is_policy_refusal(&e) => println!("{}", e),
        Err(e) => return Err(e).context("Read failed"),
    }
    Ok(())
}

fn print_capture(session: &CaptureSession, args: &ProbeArgs) {
    let grouping = GroupingOptions::collapsed()
        .by_thread(args.group_by_thread)
        .by_stack_trace(args.group_by_stack);

    let mut layers = vec![TrafficLayer::Wire];
    if args.tls {
        layers.push(TrafficLayer::Plaintext);
    }
    for layer in layers {
        let traffic = session.captured_traffic(&TrafficQuery::new().grouping(grouping).layer(layer));
        println!("\n{:?} traffic: {} packets", layer, traffic.packet_count());
        print_buckets(&traffic);
    }

    for conn in session.socket_stats(&TrafficQuery::new()) {
        println!(
            "\n{}: {} bytes up in {} writes, {} bytes down in {} reads, {:?} in I/O",
            conn.identity,
            conn.stats.bytes_up,
            conn.stats.packets_sent,
            conn.stats.bytes_down,
            conn.stats.packets_received,
            conn.stats.elapsed
        );
    }
}

fn print_buckets(traffic: &GroupedTraffic) {
    for bucket in traffic.iter() {
        let key = &bucket.key;
        print!("{} {}", key.connection(), key.remote());
        if let Some(thread) = key.thread() {
            print!(" thread={}", thread.name().unwrap_or("<unnamed>"));
        }
        println!();
        if let Some(stack) = key.stack() {
            for frame in stack.frames().take(8) {
                println!("    at {}", frame);
            }
        }
        print!("{}", render_packets(&bucket.packets));
    }
}
