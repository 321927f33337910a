//! NBD host client (spec.md §4.7): negotiates an export over TCP, then hands
//! the socket to the kernel NBD driver and blocks until it is detached.

mod config;

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::unix::io::AsRawFd;

use clap::Parser;
use config::Config;
use nbd_devctl::ioctl::IoctlDeviceControl;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const MAX_HANDSHAKE_BYTES: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "nbd-client")]
#[command(about = "NBD host client")]
#[command(version)]
struct Args {
    /// Path to the client's TOML configuration file.
    config: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", args.config))?;
    let config: Config = toml::from_str(&config_str)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", args.config))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let blocks = negotiate_and_attach(&config)?;
    info!("nbd-client: device detached cleanly ({blocks} blocks were served)");
    Ok(())
}

fn negotiate_and_attach(config: &Config) -> anyhow::Result<u64> {
    let mut stream = TcpStream::connect((config.server.address.as_str(), config.server.port))
        .map_err(|e| anyhow::anyhow!("failed to connect to {}:{}: {e}", config.server.address, config.server.port))?;
    info!("connected to {}:{}", config.server.address, config.server.port);

    let mut descriptor = config.backend.extra.clone();
    descriptor.insert("name".to_string(), Value::String(config.backend.name.clone()));
    descriptor.insert("blocksize".to_string(), Value::from(config.nbd.blocksize));
    let request = Value::Object(descriptor).to_string();
    stream
        .write_all(request.as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to send handshake: {e}"))?;

    let blocks = read_handshake_reply(&stream)?;

    if let Err(e) = nix::sys::socket::setsockopt(&stream.as_fd(), nix::sys::socket::sockopt::TcpNoDelay, &true) {
        warn!("failed to disable Nagle's algorithm (best-effort): {e}");
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.nbd.file)
        .map_err(|e| anyhow::anyhow!("failed to open device {}: {e}", config.nbd.file))?;
    let dev = IoctlDeviceControl::new(file);

    info!(
        "attaching {} to {} ({} blocks of {} bytes, timeout {}s)",
        config.server.address, config.nbd.file, blocks, config.nbd.blocksize, config.nbd.timeout
    );
    nbd_devctl::attach_and_serve(
        &dev,
        config.nbd.blocksize,
        blocks,
        config.nbd.timeout,
        stream.as_raw_fd(),
    )
    .map_err(|e| anyhow::anyhow!("device-control sequence failed: {e}"))?;

    Ok(blocks)
}

fn read_handshake_reply(stream: &TcpStream) -> anyhow::Result<u64> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| anyhow::anyhow!("failed to read handshake reply: {e}"))?;
    if n == 0 {
        anyhow::bail!("server closed the connection before replying to the handshake");
    }
    if line.len() > MAX_HANDSHAKE_BYTES {
        anyhow::bail!("handshake reply exceeded {MAX_HANDSHAKE_BYTES} bytes");
    }

    let reply: Value = serde_json::from_str(line.trim_end())
        .map_err(|e| anyhow::anyhow!("handshake reply was not valid JSON: {e}"))?;
    let Some(object) = reply.as_object() else {
        anyhow::bail!("handshake reply was not a JSON object");
    };
    let Some(error) = object.get("error") else {
        anyhow::bail!("handshake reply is missing the required 'error' key");
    };

    match error {
        Value::Null => {}
        Value::String(message) => anyhow::bail!("server rejected handshake: {message}"),
        other => anyhow::bail!("handshake reply had an unexpected 'error' value: {other}"),
    }

    object
        .get("blocks")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("successful handshake reply is missing 'blocks'"))
}
