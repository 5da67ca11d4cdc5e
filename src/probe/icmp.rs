//! ICMP echo probe.
//!
//! Native ICMP over raw or datagram sockets (RAW when privileged,
//! DGRAM otherwise). The blocking socket work runs on the blocking
//! pool so reply timing stays precise; each echo carries a unique
//! identifier/sequence pair so concurrent probes to the same target
//! cannot claim each other's replies.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{resolve_host, Probe, ProbeError, ProbeKind, ProbeTimer};
use crate::config::{self, IcmpProbeConfig};
use crate::storage::{ServiceStatus, StorageWriter, UptimeSample};

static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

pub struct IcmpProbe {
    label: String,
    timer: ProbeTimer,
    timeout: Duration,
    retries: u32,
    host: String,
}

/// Outcome of one echo round: a matched reply with its RTT, or silence
/// until the deadline.
struct EchoStatus {
    online: bool,
    rtt: Duration,
}

impl IcmpProbe {
    /// Host resolution happens at execution time; a probe for a
    /// currently-unresolvable host still loads.
    pub fn load(label: String, cfg: &IcmpProbeConfig) -> Self {
        Self {
            label,
            timer: ProbeTimer::new(config::effective_interval(cfg.interval)),
            timeout: config::effective_timeout(cfg.timeout),
            retries: cfg.retries,
            host: cfg.host.clone(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.timer.interval()
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        storage: &Arc<dyn StorageWriter>,
    ) -> Result<(), ProbeError> {
        let started = Utc::now();
        let begun = Instant::now();
        let deadline = begun + self.timeout;

        let ip = match resolve_host(&self.host).await {
            Ok(ip) => ip,
            Err(err) => {
                tracing::debug!(label = %self.label, err = %err, "icmp resolve failed");
                storage
                    .push_uptime(UptimeSample {
                        time: started,
                        label: self.label.clone(),
                        status: ServiceStatus::Down,
                        http_status: None,
                        elapsed: begun.elapsed(),
                        latency_ms: -1,
                        host: None,
                        tls_version: None,
                    })
                    .await?;
                return Ok(());
            }
        };

        let mut status = match self.echo_round(ctx, ip, deadline).await? {
            Some(status) => status,
            // Shutdown mid-flight: exit without a partial sample.
            None => return Ok(()),
        };

        let mut retries_left = self.retries;
        while !status.online && retries_left > 0 && Instant::now() < deadline && !ctx.is_cancelled()
        {
            status = match self.echo_round(ctx, ip, deadline).await? {
                Some(status) => status,
                None => return Ok(()),
            };
            retries_left -= 1;
        }

        let elapsed = begun.elapsed();

        tracing::debug!(
            label = %self.label,
            online = status.online,
            rtt_ms = status.rtt.as_millis() as i64,
            "upd icmp",
        );

        storage
            .push_uptime(UptimeSample {
                time: started,
                label: self.label.clone(),
                status: if status.online {
                    ServiceStatus::Up
                } else {
                    ServiceStatus::Down
                },
                http_status: None,
                elapsed,
                latency_ms: if status.online {
                    status.rtt.as_millis() as i64
                } else {
                    -1
                },
                host: Some(ip.to_string()),
                tls_version: None,
            })
            .await?;

        Ok(())
    }

    /// One echo attempt bounded by the remaining deadline. Returns
    /// `None` when cancelled.
    async fn echo_round(
        &self,
        ctx: &CancellationToken,
        ip: IpAddr,
        deadline: Instant,
    ) -> Result<Option<EchoStatus>, ProbeError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Some(EchoStatus {
                online: false,
                rtt: Duration::ZERO,
            }));
        }

        let task = tokio::task::spawn_blocking(move || blocking_echo(ip, remaining));

        tokio::select! {
            _ = ctx.cancelled() => Ok(None),
            joined = task => match joined {
                Ok(result) => result.map(Some),
                Err(err) => Err(ProbeError::Network(format!("echo task failed: {err}"))),
            },
        }
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    fn ready(&self) -> bool {
        self.timer.ready()
    }

    async fn execute(
        &self,
        ctx: &CancellationToken,
        storage: &Arc<dyn StorageWriter>,
    ) -> Result<(), ProbeError> {
        self.timer.acquire()?;
        let result = self.run(ctx, storage).await;
        self.timer.release();
        result
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> ProbeKind {
        ProbeKind::Icmp
    }
}

/// Send one echo request and wait for the matching reply. Runs on the
/// blocking pool.
fn blocking_echo(ip: IpAddr, timeout: Duration) -> Result<EchoStatus, ProbeError> {
    let v6 = ip.is_ipv6();

    let (domain, protocol) = if v6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };

    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where
    // ping_group_range allows it.
    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("failed to create icmp socket: {e}")))?;

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("failed to set socket timeout: {e}")))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {e}")))?;

    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(v6, identifier, sequence);

    let begun = std::time::Instant::now();

    socket
        .send(&packet)
        .map_err(|e| ProbeError::Network(format!("failed to send: {e}")))?;

    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(EchoStatus {
                    online: false,
                    rtt: Duration::ZERO,
                });
            }
            Err(e) => return Err(ProbeError::Network(format!("failed to receive: {e}"))),
        };

        let rtt = begun.elapsed();
        if rtt >= timeout {
            return Ok(EchoStatus {
                online: false,
                rtt: Duration::ZERO,
            });
        }

        // SAFETY: recv initialized `len` bytes.
        let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        if matches_echo_reply(data, v6, identifier, sequence) {
            return Ok(EchoStatus { online: true, rtt });
        }
        // Someone else's packet, keep waiting for ours.
    }
}

/// Echo request packet: type/code header, identifier, sequence, and a
/// zero-filled payload. The ICMPv6 checksum is left to the kernel.
fn build_echo_request(v6: bool, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = if v6 { 128 } else { 8 };
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    if !v6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Match an incoming packet against our echo request. RAW v4 sockets
/// deliver the IP header first; DGRAM sockets deliver bare ICMP.
fn matches_echo_reply(data: &[u8], v6: bool, identifier: u16, sequence: u16) -> bool {
    let reply_type = if v6 { 129 } else { 0 };

    let offset = if !v6 && !data.is_empty() && data[0] >> 4 == 4 {
        20
    } else {
        0
    };

    if data.len() < offset + 8 {
        return false;
    }

    let reply = &data[offset..];
    reply[0] == reply_type
        && u16::from_be_bytes([reply[4], reply[5]]) == identifier
        && u16::from_be_bytes([reply[6], reply[7]]) == sequence
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
