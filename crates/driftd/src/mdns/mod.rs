//! mDNS engine: advertises this node and keeps the peer registry in step
//! with what the link announces.
//!
//! The protocol state lives in [`client::Client`]; this module owns the
//! sockets, the clock and the interface list, and shuttles packets and
//! timer ticks between them.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod conn;
pub mod service;

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use drift_core::dns::{Message, MAX_PACKET_LEN};
use drift_services::{PeerEvent, PeerRegistry};
use tokio_util::sync::CancellationToken;

use client::{Client, Destination, Outgoing, CACHE_DELAY};
use conn::{Interface, Sockets};
pub use service::LocalService;

/// How often the interface list is re-read.
const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

pub struct Engine {
    client: Client,
    sockets: Sockets,
    ifaces: Vec<Interface>,
    allow: Vec<String>,
    registry: PeerRegistry,
    cancel: CancellationToken,
}

impl Engine {
    /// Open the mDNS sockets and join the groups on every usable interface.
    /// Fails if no socket can be opened at all.
    pub fn new(
        local: LocalService,
        allow: Vec<String>,
        registry: PeerRegistry,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let sockets = Sockets::open()?;
        let ifaces = conn::interfaces(&allow)?;
        if ifaces.is_empty() {
            tracing::warn!("no multicast-capable interfaces yet, will keep looking");
        }
        for iface in &ifaces {
            tracing::info!(iface = %iface.name, index = iface.index, addrs = ?iface.addrs(), "mDNS interface");
            sockets.join(iface);
        }
        Ok(Self {
            client: Client::new(local, Instant::now()),
            sockets,
            ifaces,
            allow,
            registry,
            cancel,
        })
    }

    pub async fn run(mut self) {
        tracing::info!(
            instance = %self.client.local().instance,
            service = %self.client.local().service,
            port = self.client.local().port,
            "mDNS engine started"
        );

        let mut buf_v4 = vec![0u8; MAX_PACKET_LEN];
        let mut buf_v6 = vec![0u8; MAX_PACKET_LEN];
        let mut wake = Instant::now();
        let mut rescan = tokio::time::interval_at(
            tokio::time::Instant::now() + RESCAN_INTERVAL,
            RESCAN_INTERVAL,
        );

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    let now = Instant::now();
                    let tick = self.client.tick(now, &self.ifaces);
                    self.send_all(tick.outgoing).await;
                    for event in tick.events {
                        self.publish(event);
                    }
                    wake = tick.next;
                }

                result = conn::recv_from(self.sockets.v4.as_ref(), &mut buf_v4) => {
                    if let Some(at) = self.on_packet(result, &buf_v4).await {
                        wake = wake.min(at);
                    }
                }

                result = conn::recv_from(self.sockets.v6.as_ref(), &mut buf_v6) => {
                    if let Some(at) = self.on_packet(result, &buf_v6).await {
                        wake = wake.min(at);
                    }
                }

                _ = rescan.tick() => {
                    if self.rescan() {
                        wake = Instant::now();
                    }
                }
            }
        }

        let goodbye = self.client.goodbye(&self.ifaces);
        self.send_all(goodbye).await;
        tracing::info!("mDNS engine stopped");
    }

    /// Handle one datagram. Returns when the next tick should happen if
    /// the packet changed the cache.
    async fn on_packet(&mut self, result: io::Result<(usize, SocketAddr)>, buf: &[u8]) -> Option<Instant> {
        let (len, src) = match result {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!(error = %e, "mDNS receive failed");
                return None;
            }
        };
        let msg = match Message::decode(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%src, error = %e, "dropping malformed mDNS packet");
                return None;
            }
        };

        let now = Instant::now();
        let reaction = self.client.handle(now, &msg, src, &self.ifaces);
        self.send_all(reaction.replies).await;
        reaction.cache_touched.then(|| now + CACHE_DELAY)
    }

    async fn send_all(&self, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            let packet = match out.message.encode() {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!(error = %e, "could not encode mDNS message");
                    continue;
                }
            };
            match out.to {
                Destination::Multicast(index) => {
                    if let Some(iface) = self.ifaces.iter().find(|i| i.index == index) {
                        self.sockets.send_multicast(iface, &packet).await;
                    }
                }
                Destination::Unicast(addr) => {
                    if let Err(e) = self.sockets.send_unicast(addr, &packet).await {
                        tracing::debug!(%addr, error = %e, "mDNS unicast reply failed");
                    }
                }
            }
        }
    }

    fn publish(&self, event: PeerEvent) {
        match &event {
            PeerEvent::Added(peer) => {
                tracing::info!(peer = %peer.service_name(), addrs = ?peer.addrs, port = peer.port, "peer added")
            }
            PeerEvent::Updated(peer) => {
                tracing::info!(peer = %peer.service_name(), addrs = ?peer.addrs, port = peer.port, "peer updated")
            }
            PeerEvent::Removed(name) => tracing::info!(peer = %name, "peer removed"),
        }
        self.registry.apply(event);
    }

    /// Re-read interfaces. True if they changed, in which case new groups
    /// are joined and announcing starts over.
    fn rescan(&mut self) -> bool {
        let ifaces = match conn::interfaces(&self.allow) {
            Ok(ifaces) => ifaces,
            Err(e) => {
                tracing::warn!(error = %e, "interface scan failed");
                return false;
            }
        };
        if ifaces == self.ifaces {
            return false;
        }
        tracing::info!(
            interfaces = ?ifaces.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
            "interfaces changed"
        );
        for iface in &ifaces {
            self.sockets.join(iface);
        }
        self.ifaces = ifaces;
        self.client.reset(Instant::now());
        true
    }
}
