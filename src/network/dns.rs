// PyroVision — Captive DNS
//
// While the provisioning AP is up every name a client looks up resolves to
// the device itself, so phones open the setup page on their own.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::*;
use crate::tasks::{spawn_task, EventBits, TaskError, TaskHandle, Watchdog, STOP_REQUEST};

const HEADER_LEN: usize = 12;
/// QR, opcode 0, AA off, RD and RA set, no error.
const RESPONSE_FLAGS: [u8; 2] = [0x81, 0x80];
/// Name pointer back to the question at offset 12.
const NAME_POINTER: [u8; 2] = [0xC0, 0x0C];
const TYPE_A: [u8; 2] = [0x00, 0x01];
const CLASS_IN: [u8; 2] = [0x00, 0x01];

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns socket: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Answer the first question of `query` with an A record for `ip`.
/// Returns `None` for anything that is not a well-formed query.
pub fn build_reply(query: &[u8], ip: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN || query[2] & 0x80 != 0 {
        return None;
    }
    if u16::from_be_bytes([query[4], query[5]]) == 0 {
        return None;
    }

    let mut pos = HEADER_LEN;
    loop {
        let label = usize::from(*query.get(pos)?);
        pos += 1;
        if label == 0 {
            break;
        }
        // Compressed names never appear in a question.
        if label & 0xC0 != 0 {
            return None;
        }
        pos += label;
    }
    let question_end = pos + 4;
    if question_end > query.len() {
        return None;
    }

    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[..question_end]);
    reply[2..4].copy_from_slice(&RESPONSE_FLAGS);
    reply[4..6].copy_from_slice(&1u16.to_be_bytes());
    reply[6..8].copy_from_slice(&1u16.to_be_bytes());
    reply[8..12].fill(0);

    reply.extend_from_slice(&NAME_POINTER);
    reply.extend_from_slice(&TYPE_A);
    reply.extend_from_slice(&CLASS_IN);
    reply.extend_from_slice(&DNS_ANSWER_TTL_S.to_be_bytes());
    reply.extend_from_slice(&4u16.to_be_bytes());
    reply.extend_from_slice(&ip.octets());
    Some(reply)
}

/// UDP responder running on its own task until `stop`.
pub struct CaptiveDns {
    task: Option<TaskHandle>,
    local_addr: SocketAddr,
}

impl CaptiveDns {
    pub fn start(
        bind: SocketAddr,
        ip: Ipv4Addr,
        watchdog: Arc<dyn Watchdog>,
    ) -> Result<Self, DnsError> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(Duration::from_millis(DNS_RECV_TIMEOUT_MS)))?;
        let local_addr = socket.local_addr()?;

        let bits = EventBits::new();
        let stop = Arc::clone(&bits);
        let task = spawn_task("dns", STACK_DNS, bits, move || {
            serve(socket, ip, &stop, watchdog.as_ref())
        })?;
        log::info!("Captive DNS on {} answering {}", local_addr, ip);

        Ok(Self {
            task: Some(task),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(TaskHandle::is_running)
    }

    pub fn stop(&mut self) {
        if let Some(mut task) = self.task.take() {
            if let Err(e) = task.stop() {
                log::warn!("{}", e);
            }
        }
    }
}

impl Drop for CaptiveDns {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(socket: UdpSocket, ip: Ipv4Addr, bits: &EventBits, watchdog: &dyn Watchdog) {
    watchdog.subscribe_current();
    let mut buf = [0u8; DNS_MAX_PACKET];
    while bits.get() & STOP_REQUEST == 0 {
        watchdog.feed();
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => match build_reply(&buf[..len], ip) {
                Some(reply) => {
                    if let Err(e) = socket.send_to(&reply, peer) {
                        log::warn!("DNS reply to {} failed: {}", peer, e);
                    }
                }
                None => log::debug!("Ignoring {} byte DNS packet from {}", len, peer),
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => log::warn!("DNS receive failed: {}", e),
        }
    }
    watchdog.unsubscribe_current();
    log::info!("Captive DNS exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::NoWatchdog;

    /// Standard query for `name`, type A, class IN.
    fn query(id: u16, name: &str) -> Vec<u8> {
        let mut q = id.to_be_bytes().to_vec();
        q.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        for label in name.split('.') {
            q.push(label.len() as u8);
            q.extend_from_slice(label.as_bytes());
        }
        q.extend_from_slice(&[0, 0x00, 0x01, 0x00, 0x01]);
        q
    }

    #[test]
    fn any_name_resolves_to_the_access_point() {
        let ip = Ipv4Addr::new(192, 168, 4, 1);
        let q = query(0xBEEF, "connectivitycheck.gstatic.com");
        let reply = build_reply(&q, ip).unwrap();

        assert_eq!(&reply[..2], &[0xBE, 0xEF]);
        assert_eq!(&reply[2..4], &RESPONSE_FLAGS);
        assert_eq!(&reply[4..8], &[0, 1, 0, 1]);
        assert_eq!(&reply[8..12], &[0, 0, 0, 0]);
        assert_eq!(&reply[12..q.len()], &q[12..]);

        let answer = &reply[q.len()..];
        assert_eq!(&answer[..6], &[0xC0, 0x0C, 0, 1, 0, 1]);
        assert_eq!(u32::from_be_bytes([answer[6], answer[7], answer[8], answer[9]]), 60);
        assert_eq!(&answer[10..], &[0, 4, 192, 168, 4, 1]);
    }

    #[test]
    fn malformed_packets_get_no_reply() {
        let ip = Ipv4Addr::new(192, 168, 4, 1);
        assert!(build_reply(&[0u8; 11], ip).is_none());

        let mut response = query(1, "a.b");
        response[2] |= 0x80;
        assert!(build_reply(&response, ip).is_none());

        let mut empty = query(1, "a.b");
        empty[5] = 0;
        assert!(build_reply(&empty, ip).is_none());

        let full = query(1, "example.com");
        assert!(build_reply(&full[..full.len() - 2], ip).is_none());
        assert!(build_reply(&full[..16], ip).is_none());
    }

    #[test]
    fn responder_answers_over_udp_until_stopped() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let mut dns = CaptiveDns::start(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ip,
            Arc::new(NoWatchdog),
        )
        .unwrap();
        assert!(dns.is_running());

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(&query(7, "pyrovision.local"), dns.local_addr()).unwrap();

        let mut buf = [0u8; DNS_MAX_PACKET];
        let (len, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0, 7]);
        assert_eq!(&buf[len - 4..len], &[10, 0, 0, 1]);

        dns.stop();
        assert!(!dns.is_running());
    }
}
