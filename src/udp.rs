use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::engine::{OngoingGuard, Request, Shared};
use crate::proto_utils::{self, RCODE_NOERROR};

/// Largest reply datagram we accept; EDNS payloads top out below this.
const MAX_REPLY_SIZE: usize = 4096;

/// Verdict on one reply datagram for a given request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyStatus {
    Malformed,
    MsgidMismatch(u16),
    Truncated,
    Answered { noerror: bool },
}

/// 按保存的消息 ID 匹配响应 / match the reply against the saved message id.
/// Anything short of an id-matching, untruncated reply leaves the request
/// waiting; the timeout governs closure for all dropped replies.
pub(crate) fn classify_reply(datagram: &[u8], query_id: u16) -> ReplyStatus {
    let Some(header) = proto_utils::parse_header(datagram) else {
        return ReplyStatus::Malformed;
    };
    if header.id != query_id {
        return ReplyStatus::MsgidMismatch(header.id);
    }
    if header.tc {
        // TODO fall back to TCP on TC=1 once the Tcp transport lands
        return ReplyStatus::Truncated;
    }
    ReplyStatus::Answered {
        noerror: header.rcode == RCODE_NOERROR,
    }
}

fn open_socket(target: SocketAddr, source: Option<SocketAddr>) -> anyhow::Result<UdpSocket> {
    let domain = if target.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    socket.set_nonblocking(true).context("set nonblocking")?;

    let bind_addr = match source {
        Some(addr) => addr,
        None => match target {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("wildcard v4"),
            SocketAddr::V6(_) => "[::]:0".parse().expect("wildcard v6"),
        },
    };
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("bind to {bind_addr}"))?;

    UdpSocket::from_std(socket.into()).context("register socket with event loop")
}

/// One request from send to close. The task exclusively owns the request
/// and its endpoint, so neither the match exit nor the timeout exit can
/// observe freed state, and late duplicates land on a closed port.
pub(crate) async fn run_query(
    shared: Rc<Shared>,
    req: Request,
    target: SocketAddr,
    source: Option<SocketAddr>,
    timeout: Duration,
) {
    let socket = match open_socket(target, source) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(error = %err, "failed to init udp query socket");
            shared.note_discarded();
            return;
        }
    };

    // exactly one send per request; loss recovery is the timeout's job
    if let Err(err) = socket.send_to(&req.payload, target).await {
        warn!(error = %err, "failed to send udp packet");
        shared.note_discarded();
        return;
    }

    let _ongoing = OngoingGuard::arm(&shared);
    let sent_at = Instant::now();
    let deadline = sent_at + timeout;
    let mut buf = [0u8; MAX_REPLY_SIZE];

    loop {
        match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => {
                debug!(id = req.query_id, "request timed out");
                return;
            }
            Ok(Err(err)) => {
                debug!(error = %err, "udp recv error");
            }
            Ok(Ok((nread, _from))) => match classify_reply(&buf[..nread], req.query_id) {
                ReplyStatus::Malformed => debug!("udp response malformed"),
                ReplyStatus::MsgidMismatch(got) => {
                    debug!(expected = req.query_id, got, "udp response msgid mismatch");
                }
                ReplyStatus::Truncated => debug!("udp response has TC=1"),
                ReplyStatus::Answered { noerror } => {
                    shared.note_answered(req.client, noerror, sent_at.elapsed());
                    return;
                }
            },
        }
    }
}
