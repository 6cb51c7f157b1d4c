use super::{dispatch_bytes, next_backoff, TransportContext, TransportStats, INITIAL_BACKOFF};
use crate::config::{TransportConfig, TransportKind};
use crate::error::TransportError;
use crate::framing::Framer;
use crate::router::TxItem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

/// Supervised UDP transport: reopens the socket on I/O failure, reads framed
/// MAVLink into the router's inbound queue, and writes queued outbound
/// frames to the last-known (or configured) peer.
pub async fn run(
    config: TransportConfig,
    ctx: TransportContext,
    mut out_rx: mpsc::Receiver<TxItem>,
    stats: Arc<TransportStats>,
) {
    let mut backoff = INITIAL_BACKOFF;

    while ctx.should_run() {
        let socket = match open(&config).await {
            Ok(s) => s,
            Err(e) => {
                warn!("transport '{}': {}", config.name, e);
                sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        info!("transport '{}' connected ({:?})", config.name, config.kind);
        backoff = INITIAL_BACKOFF;
        stats.reconnects.fetch_add(1, Ordering::Relaxed);

        let socket = Arc::new(socket);
        let rx_socket = socket.clone();
        let rx_ctx = ctx.clone();
        let rx_stats = stats.clone();

        let rx_task = tokio::spawn(async move {
            let mut framer = Framer::new();
            let mut buf = vec![0u8; 4096];
            loop {
                if !rx_ctx.should_run() {
                    return;
                }
                match tokio::time::timeout(std::time::Duration::from_millis(500), rx_socket.recv_from(&mut buf)).await {
                    Ok(Ok((n, addr))) => {
                        dispatch_bytes(&rx_ctx, &mut framer, &rx_stats, &buf[..n], Some(addr)).await;
                    }
                    Ok(Err(e)) => {
                        warn!("transport '{}': {}", rx_ctx.name, TransportError::ReadFailed(e.to_string()));
                        return;
                    }
                    Err(_) => continue, // timeout, re-check run flag
                }
            }
        });

        loop {
            if !ctx.should_run() {
                rx_task.abort();
                return;
            }
            tokio::select! {
                item = out_rx.recv() => {
                    match item {
                        Some(item) => {
                            let dest = item.dest_addr.or_else(|| {
                                if config.kind == TransportKind::UdpConnect {
                                    config.endpoint.parse::<std::net::SocketAddr>().ok()
                                } else {
                                    None
                                }
                            });
                            match dest {
                                Some(dest) => {
                                    if let Err(e) = socket.send_to(&item.bytes, dest).await {
                                        warn!("transport '{}': {}", config.name, TransportError::WriteFailed(e.to_string()));
                                        break;
                                    }
                                }
                                None => {
                                    warn!("transport '{}': no known peer yet, dropping outbound frame", config.name);
                                }
                            }
                        }
                        None => return,
                    }
                }
                _ = sleep(std::time::Duration::from_millis(500)) => {}
            }
            if rx_task.is_finished() {
                break;
            }
        }

        rx_task.abort();
        sleep(backoff).await;
        backoff = next_backoff(backoff);
    }
}

async fn open(config: &TransportConfig) -> Result<UdpSocket, TransportError> {
    match config.kind {
        TransportKind::UdpListen => UdpSocket::bind(&config.endpoint)
            .await
            .map_err(|e| TransportError::OpenFailed(e.to_string())),
        TransportKind::UdpConnect => {
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
            socket
                .connect(&config.endpoint)
                .await
                .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
            Ok(socket)
        }
        TransportKind::Serial => Err(TransportError::OpenFailed("serial transport routed to udp worker".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::router::RouterInput;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn discovers_peer_on_first_datagram() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let ctx = TransportContext {
            name: "udp_test".into(),
            inbound_tx,
            run_flag: Arc::new(AtomicBool::new(true)),
        };

        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let heartbeat = super_test_heartbeat();
        sender.send_to(&heartbeat, addr).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let (n, peer) = listener.recv_from(&mut buf).await.unwrap();
        let stats = TransportStats::default();
        let mut framer = Framer::new();
        dispatch_bytes(&ctx, &mut framer, &stats, &buf[..n], Some(peer)).await;

        let received: RouterInput = inbound_rx.recv().await.unwrap();
        assert_eq!(received.header.system_id, 3);
    }

    fn super_test_heartbeat() -> Vec<u8> {
        use mavlink::ardupilotmega::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
        let header = mavlink::MavHeader {
            system_id: 3,
            component_id: 1,
            sequence: 0,
        };
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::empty(),
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        });
        let mut buf = Vec::new();
        mavlink::write_versioned_msg(&mut buf, mavlink::MavlinkVersion::V2, header, &msg).unwrap();
        buf
    }
}
