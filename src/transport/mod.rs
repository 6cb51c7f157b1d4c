pub mod serial;
pub mod udp;

use crate::error::TransportError;
use crate::framing::{frame_to_packet, Framer};
use crate::router::RouterInput;
use mavlink::MavHeader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Shared handle used by a transport worker to hand frames to the router and
/// to learn when it should stop.
#[derive(Clone)]
pub struct TransportContext {
    pub name: String,
    pub inbound_tx: mpsc::Sender<RouterInput>,
    pub run_flag: Arc<AtomicBool>,
}

impl TransportContext {
    pub fn should_run(&self) -> bool {
        self.run_flag.load(Ordering::Relaxed)
    }
}

/// Shared counters surfaced on the bridge status topic.
#[derive(Default)]
pub struct TransportStats {
    pub dropped: std::sync::atomic::AtomicU64,
    pub malformed: std::sync::atomic::AtomicU64,
    pub reconnects: std::sync::atomic::AtomicU64,
}

/// Feed freshly-read bytes through the per-stream framer and push any
/// complete frames to the router's inbound queue.
pub async fn dispatch_bytes(
    ctx: &TransportContext,
    framer: &mut Framer,
    stats: &TransportStats,
    data: &[u8],
    src_addr: Option<std::net::SocketAddr>,
) {
    for result in framer.feed(data) {
        match result {
            Ok(frame) => {
                let packet = frame_to_packet(&ctx.name, &frame);
                let header: MavHeader = frame.header;
                let input = RouterInput {
                    transport_name: ctx.name.clone(),
                    src_addr,
                    header,
                    raw: frame.raw,
                    packet,
                    msg: frame.msg,
                };
                if ctx.inbound_tx.send(input).await.is_err() {
                    warn!("router inbound queue closed, transport '{}' has nowhere to send", ctx.name);
                }
            }
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("transport '{}': {}", ctx.name, TransportError::Malformed(e));
            }
        }
    }
}

/// Backoff sequence used by every transport's connect loop: 1s, 2s, 4s, ...
/// capped at 30s.
pub fn next_backoff(current: std::time::Duration) -> std::time::Duration {
    let doubled = current.saturating_mul(2);
    std::cmp::min(doubled, std::time::Duration::from_secs(30))
}

pub const INITIAL_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
