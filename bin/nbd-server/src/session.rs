//! Per-client state machine: Handshake → Operational → Closed (spec.md §4.6).
//!
//! A reader task owns the read half of the socket and only ever produces
//! [`SessionEvent`]s; the session task owns the write half and is the single
//! writer, consuming both decoded requests and handler completions off two
//! channels in one `select!` loop so replies are never interleaved.

use std::sync::Arc;

use nbd_backend::{completion_channel, Completion, Outcome, Registry, RegistryEntry};
use nbd_wire::{decode_request, encode_reply_header, Command, Reply};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const MAX_HANDSHAKE_BYTES: usize = 1024;

#[derive(Serialize)]
struct HandshakeError<'a> {
    error: &'a str,
}

#[derive(Serialize)]
struct HandshakeOk {
    error: Option<String>,
    blocks: u64,
}

pub async fn run(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    registry: Arc<Registry>,
    max_errors: u32,
    mut shutdown: watch::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let handler = match handshake(&mut reader, &mut writer, &registry).await {
        Ok(handler) => handler,
        Err(e) => {
            debug!("session {peer}: handshake failed: {e}");
            return;
        }
    };
    info!("session {peer}: operational");

    let (sink, mut completions) = completion_channel();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(read_requests(reader, events_tx));

    let mut error_count = 0u32;
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    None | Some(SessionEvent::Disconnect) => {
                        debug!("session {peer}: closing");
                        break;
                    }
                    Some(SessionEvent::FrameError) => {
                        error_count += 1;
                        warn!("session {peer}: frame error ({error_count}/{max_errors})");
                        if error_count >= max_errors {
                            break;
                        }
                    }
                    Some(SessionEvent::Request(req, payload)) => {
                        dispatch(handler.as_ref(), &sink, req, payload);
                    }
                }
            }
            Some(completion) = completions.recv() => {
                if let Err(e) = write_completion(&mut writer, completion).await {
                    warn!("session {peer}: write error: {e}");
                    break;
                }
            }
            _ = shutdown.changed() => {
                debug!("session {peer}: shutting down");
                break;
            }
        }
    }

    handler.close();
}

enum SessionEvent {
    Request(nbd_wire::Request, Option<Vec<u8>>),
    FrameError,
    Disconnect,
}

async fn handshake(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    registry: &Registry,
) -> anyhow::Result<Box<dyn nbd_backend::Handler>> {
    let mut buf = vec![0u8; MAX_HANDSHAKE_BYTES];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        anyhow::bail!("client disconnected before handshake");
    }
    buf.truncate(n);

    let descriptor = match nbd_backend::ExportDescriptor::parse(&buf) {
        Ok(d) => d,
        Err(e) => {
            send_handshake_error(writer, &e.to_string()).await?;
            anyhow::bail!(e);
        }
    };

    let factory = match registry.get(&descriptor.name) {
        Some(RegistryEntry::Loaded(factory)) => Arc::clone(factory),
        Some(RegistryEntry::Unavailable(err)) => {
            send_handshake_error(writer, err).await?;
            anyhow::bail!("backend '{}' unavailable: {err}", descriptor.name);
        }
        None => {
            let message = format!("no handler found for {} backend", descriptor.name);
            send_handshake_error(writer, &message).await?;
            anyhow::bail!(message);
        }
    };

    let handler = match factory.construct(&descriptor).await {
        Ok(handler) => handler,
        Err(e) => {
            send_handshake_error(writer, &e).await?;
            anyhow::bail!(e);
        }
    };

    let blocks = handler.blocks(u64::from(descriptor.block_size));
    let reply = HandshakeOk {
        error: None,
        blocks,
    };
    let mut line = serde_json::to_vec(&reply)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(handler)
}

async fn send_handshake_error(writer: &mut OwnedWriteHalf, message: &str) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(&HandshakeError { error: message })?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

/// Whether a fixed-size read landed exactly, hit clean EOF, or was cut
/// short mid-frame.
enum FrameRead {
    Full,
    Eof,
    Short,
}

async fn read_frame(reader: &mut OwnedReadHalf, buf: &mut [u8]) -> std::io::Result<FrameRead> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 { FrameRead::Eof } else { FrameRead::Short });
        }
        filled += n;
    }
    Ok(FrameRead::Full)
}

/// Decodes one request (and, for WRITE, its payload) per readable event and
/// forwards it to the session task. Per spec.md §4.6 a short or malformed
/// frame is never resynchronised against — reading simply continues.
async fn read_requests(mut reader: OwnedReadHalf, events: mpsc::UnboundedSender<SessionEvent>) {
    let mut header = [0u8; nbd_wire::REQUEST_HEADER_LEN];
    loop {
        match read_frame(&mut reader, &mut header).await {
            Ok(FrameRead::Eof) => {
                let _ = events.send(SessionEvent::Disconnect);
                return;
            }
            Ok(FrameRead::Short) => {
                let _ = events.send(SessionEvent::FrameError);
                continue;
            }
            Err(_) => {
                let _ = events.send(SessionEvent::Disconnect);
                return;
            }
            Ok(FrameRead::Full) => {}
        }

        let request = match decode_request(&header) {
            Ok(req) => req,
            Err(_) => {
                let _ = events.send(SessionEvent::FrameError);
                continue;
            }
        };

        if request.command == Command::Disconnect {
            let _ = events.send(SessionEvent::Disconnect);
            return;
        }

        if request.command == Command::Write {
            let mut payload = vec![0u8; request.length as usize];
            match read_frame(&mut reader, &mut payload).await {
                Ok(FrameRead::Full) => {
                    if events.send(SessionEvent::Request(request, Some(payload))).is_err() {
                        return;
                    }
                }
                Ok(FrameRead::Eof) => {
                    let _ = events.send(SessionEvent::Disconnect);
                    return;
                }
                Ok(FrameRead::Short) => {
                    let _ = events.send(SessionEvent::FrameError);
                }
                Err(_) => {
                    let _ = events.send(SessionEvent::Disconnect);
                    return;
                }
            }
        } else if events.send(SessionEvent::Request(request, None)).is_err() {
            return;
        }
    }
}

fn dispatch(
    handler: &dyn nbd_backend::Handler,
    sink: &nbd_backend::CompletionSink,
    request: nbd_wire::Request,
    payload: Option<Vec<u8>>,
) {
    match request.command {
        Command::Read => handler.read(sink.clone(), request.cookie, request.offset, request.length),
        Command::Write => {
            let data = payload.unwrap_or_default();
            handler.write(sink.clone(), request.cookie, request.offset, data);
        }
        Command::Flush => handler.flush(sink.clone(), request.cookie),
        Command::Disconnect => unreachable!("disconnect is handled by the reader task"),
    }
}

async fn write_completion(writer: &mut OwnedWriteHalf, completion: Completion) -> std::io::Result<()> {
    match completion.outcome {
        Outcome::Ok => {
            let reply = Reply::ok(completion.cookie);
            writer.write_all(&encode_reply_header(&reply)).await
        }
        Outcome::Err(errno) => {
            let reply = Reply::err(completion.cookie, errno as u32);
            writer.write_all(&encode_reply_header(&reply)).await
        }
        Outcome::ReadOk(data) => {
            let reply = Reply::ok(completion.cookie);
            let framed = nbd_wire::assemble_read_reply(&reply, &data);
            writer.write_all(&framed).await
        }
    }
}
