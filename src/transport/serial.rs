use super::{next_backoff, TransportContext, TransportStats, INITIAL_BACKOFF};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::framing::{frame_to_packet, Framer};
use crate::router::{RouterInput, TxItem};
use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

const CONSECUTIVE_ERROR_THRESHOLD: u32 = 5;

/// Supervised serial transport. Reads and writes happen on one blocking
/// OS thread so the port is never read from and written to at once —
/// serial lines don't tolerate interleaved I/O the way a socket does.
pub async fn run(
    config: TransportConfig,
    ctx: TransportContext,
    mut out_rx: mpsc::Receiver<TxItem>,
    stats: Arc<TransportStats>,
) {
    let baud = config.baud.unwrap_or(57600);
    let mut backoff = INITIAL_BACKOFF;

    'connect: while ctx.should_run() {
        let port = match serialport::new(&config.endpoint, baud)
            .timeout(Duration::from_millis(250))
            .open()
        {
            Ok(p) => p,
            Err(e) => {
                warn!("transport '{}': {}", config.name, TransportError::OpenFailed(e.to_string()));
                sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        info!("transport '{}' connected ({} @ {})", config.name, config.endpoint, baud);
        backoff = INITIAL_BACKOFF;
        stats.reconnects.fetch_add(1, Ordering::Relaxed);

        let (byte_tx, mut byte_rx) = mpsc::channel::<Vec<u8>>(256);
        let (write_tx, write_rx) = std::sync::mpsc::channel::<Vec<u8>>();
        let run_flag = ctx.run_flag.clone();
        let port_name = config.name.clone();

        let blocking = tokio::task::spawn_blocking(move || {
            let mut port = port;
            let mut consecutive_errors: u32 = 0;
            let mut buf = [0u8; 1024];
            while run_flag.load(Ordering::Relaxed) {
                while let Ok(bytes) = write_rx.try_recv() {
                    if let Err(e) = port.write_all(&bytes) {
                        warn!("transport '{}': {}", port_name, TransportError::WriteFailed(e.to_string()));
                        consecutive_errors += 1;
                    }
                }
                match port.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => {
                        consecutive_errors = 0;
                        if byte_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!("transport '{}': {}", port_name, TransportError::ReadFailed(e.to_string()));
                        consecutive_errors += 1;
                    }
                }
                if consecutive_errors >= CONSECUTIVE_ERROR_THRESHOLD {
                    warn!("transport '{}': too many consecutive errors, reopening", port_name);
                    return;
                }
            }
        });

        let mut framer = Framer::new();
        loop {
            if !ctx.should_run() {
                drop(write_tx);
                blocking.abort();
                break 'connect;
            }
            tokio::select! {
                data = byte_rx.recv() => {
                    match data {
                        Some(data) => {
                            for result in framer.feed(&data) {
                                match result {
                                    Ok(frame) => {
                                        let packet = frame_to_packet(&ctx.name, &frame);
                                        let input = RouterInput {
                                            transport_name: ctx.name.clone(),
                                            src_addr: None,
                                            header: frame.header,
                                            raw: frame.raw,
                                            packet,
                                            msg: frame.msg,
                                        };
                                        if ctx.inbound_tx.send(input).await.is_err() {
                                            warn!("router inbound queue closed, transport '{}' idle", ctx.name);
                                        }
                                    }
                                    Err(e) => {
                                        stats.malformed.fetch_add(1, Ordering::Relaxed);
                                        warn!("transport '{}': {}", ctx.name, TransportError::Malformed(e));
                                    }
                                }
                            }
                        }
                        None => break, // blocking task exited, reconnect
                    }
                }
                item = out_rx.recv() => {
                    match item {
                        Some(item) => {
                            if write_tx.send(item.bytes).is_err() {
                                break;
                            }
                        }
                        None => {
                            blocking.abort();
                            break 'connect;
                        }
                    }
                }
            }
        }

        drop(write_tx);
        let _ = blocking.await;
        sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}
