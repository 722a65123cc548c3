//! Out-of-band unicast push. A push is a one-shot TCP connection to the
//! recipient's registered notification endpoint carrying one framed packet;
//! no acknowledgement is awaited. Best-effort by design: failures are
//! logged and never fail the triggering request.
//!
//! Callers must not hold any broker lock across a push.

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use iplchat_shared::codec::write_packet;
use iplchat_shared::packet::Packet;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn push(addr: IpAddr, port: u16, packet: Packet) {
    let kind = packet.kind;
    let result = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((addr, port))).await;

    let mut stream = match result {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%addr, port, ?kind, error = %e, "notification push failed to connect");
            return;
        }
        Err(_) => {
            warn!(%addr, port, ?kind, "notification push timed out");
            return;
        }
    };

    if let Err(e) = write_packet(&mut stream, &packet).await {
        warn!(%addr, port, ?kind, error = %e, "notification push failed to send");
        return;
    }
    debug!(%addr, port, ?kind, "notification pushed");
}
