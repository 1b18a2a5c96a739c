//! Drives synthetic client flows through the datapath. Workers share one
//! directory and one connection tracker per family, every forwarded packet
//! gets a backend reply that is reverse translated and checked.

use crate::{
    conntrack::{ConnTracker, CT_DEFAULT_CAPACITY},
    config::Config,
    directory::{Directory, FamilyTables, ServiceTables},
    env::HostEnv,
    info::InfoTable,
    packet::{self, ETH_HLEN, TCP_ACK, TCP_FIN, TCP_SYN},
    services::{self, Catalog},
    stats::Stats,
};
use anyhow::anyhow;
use log::{debug, info, warn};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};
use svclb_common::{BackendState, CtState, LbConfig, IPPROTO_ANY, IPPROTO_TCP};
use svclb_dp::{
    icmp::NoBackendReply,
    lb::LbCtx,
    sock::{sock_xlate_fwd, sock_xlate_rev, SockAddr},
    Balancer, Disposition, DropReason,
};

const PAYLOAD: &[u8] = b"svclb simulated payload";

#[derive(Clone, Copy, Debug)]
pub struct SimOptions {
    pub flows: usize,
    pub packets: usize,
    pub workers: usize,
    /// Every n-th flow is translated once at connect time, zero disables
    pub sock_every: usize,
    /// Interface the synthetic packets arrive on
    pub ifindex: u32,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            flows: 256,
            packets: 4,
            workers: 4,
            sock_every: 4,
            ifindex: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SimReport {
    pub forwarded: u64,
    pub untranslated: u64,
    pub not_service: u64,
    pub unreachable: u64,
    pub dropped: u64,
    pub replies_ok: u64,
    pub replies_bad: u64,
    pub sock_connects: u64,
    /// Connects to services without backends
    pub refused: u64,
    /// Forwarded packets per backend id
    pub per_backend: BTreeMap<u32, u64>,
}

impl SimReport {
    fn merge(&mut self, other: SimReport) {
        self.forwarded += other.forwarded;
        self.untranslated += other.untranslated;
        self.not_service += other.not_service;
        self.unreachable += other.unreachable;
        self.dropped += other.dropped;
        self.replies_ok += other.replies_ok;
        self.replies_bad += other.replies_bad;
        self.sock_connects += other.sock_connects;
        self.refused += other.refused;
        for (id, count) in other.per_backend {
            *self.per_backend.entry(id).or_insert(0) += count;
        }
    }

    pub fn print(&self, catalog: &Catalog) {
        let mut tab = InfoTable::new(vec!["result", "count"]);
        for (name, count) in [
            ("forwarded", self.forwarded),
            ("untranslated", self.untranslated),
            ("not_service", self.not_service),
            ("unreachable", self.unreachable),
            ("dropped", self.dropped),
            ("replies_ok", self.replies_ok),
            ("replies_bad", self.replies_bad),
            ("sock_connects", self.sock_connects),
            ("refused", self.refused),
        ] {
            tab.push_row(vec![name.to_string(), count.to_string()]);
        }
        tab.print("Simulation results");

        let mut tab = InfoTable::new(vec!["backend", "id", "packets"]);
        for (id, count) in &self.per_backend {
            tab.push_row(vec![
                catalog.backend_name(*id).unwrap_or("?").to_string(),
                id.to_string(),
                count.to_string(),
            ]);
        }
        tab.print("Packets per backend");
    }
}

#[derive(Clone, Copy, Debug)]
struct Flow {
    client: IpAddr,
    client_port: u16,
    frontend: IpAddr,
    port: u16,
    proto: u8,
    netns_cookie: Option<u64>,
}

pub struct Simulator {
    dir: Arc<Directory>,
    env: Arc<HostEnv>,
    ct4: Arc<ConnTracker<Ipv4Addr>>,
    ct6: Arc<ConnTracker<Ipv6Addr>>,
    lb: LbConfig,
    catalog: Catalog,
}

fn client_addr(family_v4: bool, index: usize) -> IpAddr {
    let n = index as u32 + 1;
    if family_v4 {
        IpAddr::V4(Ipv4Addr::new(10, 128, (n >> 8) as u8, n as u8))
    } else {
        IpAddr::V6(Ipv6Addr::new(0xfd00, 0xc1, 0, 0, 0, 0, (n >> 16) as u16, n as u16))
    }
}

impl Simulator {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let dir = Arc::new(Directory::default());
        let catalog = services::populate(cfg, &dir)?;
        let env = Arc::new(HostEnv::new(
            cfg.datapath.local_endpoints.iter().copied(),
            Arc::new(Stats::default()),
        ));
        Ok(Self {
            ct4: Arc::new(ConnTracker::new(env.clone(), CT_DEFAULT_CAPACITY)),
            ct6: Arc::new(ConnTracker::new(env.clone(), CT_DEFAULT_CAPACITY)),
            dir,
            env,
            lb: cfg.lb_config(),
            catalog,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn stats(&self) -> &Stats {
        self.env.stats()
    }

    /// Moves the named backend to `state` in both families.
    pub fn set_backend_state(&self, name: &str, state: BackendState) -> Result<(), anyhow::Error> {
        let id = self
            .catalog
            .backends
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("No backend named {}", name))?;
        if !services::set_backend_state(&self.dir, id, state) {
            return Err(anyhow!("Backend {} ({}) is not installed", name, id));
        }
        info!("[sim] backend {} ({}) is now {:?}", name, id, state);
        Ok(())
    }

    /// Clears the tracked connections and the counters between rounds.
    pub fn reset(&self) {
        self.ct4.remove_all();
        self.ct6.remove_all();
        self.stats().reset();
    }

    pub fn list_conntrack(&self) {
        self.ct4.list("IPv4 connections");
        self.ct6.list("IPv6 connections");
    }

    fn flows(&self, opts: &SimOptions) -> Vec<Flow> {
        let targets = &self.catalog.services;
        if targets.is_empty() {
            return vec![];
        }
        (0..opts.flows)
            .map(|f| {
                let svc = &targets[f % targets.len()];
                let proto = match svc.endpoint.proto as u8 {
                    IPPROTO_ANY => IPPROTO_TCP,
                    p => p,
                };
                let sock = opts.sock_every > 0 && f % opts.sock_every == opts.sock_every - 1;
                Flow {
                    client: client_addr(svc.endpoint.ipaddr.is_ipv4(), f),
                    client_port: 1024 + (f % 60000) as u16,
                    frontend: svc.endpoint.ipaddr,
                    port: svc.endpoint.port,
                    proto,
                    netns_cookie: sock.then_some(f as u64 + 1),
                }
            })
            .collect()
    }

    /// Runs the flows split over `opts.workers` tasks.
    pub async fn run(self: &Arc<Self>, opts: &SimOptions) -> Result<SimReport, anyhow::Error> {
        let flows = self.flows(opts);
        let workers = opts.workers.max(1);
        info!(
            "[sim] {} flows of {} packets on {} workers",
            flows.len(),
            opts.packets,
            workers
        );

        let mut handles = vec![];
        for w in 0..workers {
            let sim = self.clone();
            let mine = flows
                .iter()
                .skip(w)
                .step_by(workers)
                .copied()
                .collect::<Vec<_>>();
            let opts = *opts;
            handles.push(tokio::spawn(async move {
                let mut report = SimReport::default();
                for flow in mine {
                    report.merge(sim.run_flow(&flow, &opts));
                    tokio::task::yield_now().await;
                }
                report
            }));
        }

        let mut report = SimReport::default();
        for h in handles {
            report.merge(h.await?);
        }

        let removed = self.ct4.gc() + self.ct6.gc();
        debug!(
            "[sim] ct entries v4/v6: {}/{}, expired {}",
            self.ct4.len(),
            self.ct6.len(),
            removed
        );
        Ok(report)
    }

    fn run_flow(&self, flow: &Flow, opts: &SimOptions) -> SimReport {
        match (flow.client, flow.frontend) {
            (IpAddr::V4(c), IpAddr::V4(f)) => self.run_family_flow(&self.ct4, c, f, flow, opts),
            (IpAddr::V6(c), IpAddr::V6(f)) => self.run_family_flow(&self.ct6, c, f, flow, opts),
            _ => {
                warn!("[sim] mixed family flow {:?}", flow);
                SimReport::default()
            }
        }
    }

    fn run_family_flow<A>(
        &self,
        ct: &ConnTracker<A>,
        client: A,
        frontend: A,
        flow: &Flow,
        opts: &SimOptions,
    ) -> SimReport
    where
        A: FamilyTables + NoBackendReply,
    {
        match flow.netns_cookie {
            Some(cookie) => self.sock_flow(client, frontend, flow, cookie, opts.packets),
            None => self.packet_flow(ct, client, frontend, flow, opts),
        }
    }

    /// Per packet translation with a reverse translated reply.
    fn packet_flow<A>(
        &self,
        ct: &ConnTracker<A>,
        client: A,
        frontend: A,
        flow: &Flow,
        opts: &SimOptions,
    ) -> SimReport
    where
        A: FamilyTables + NoBackendReply,
    {
        let packets = opts.packets;
        let tables = A::tables(&self.dir);
        let lb = Balancer::new(tables, ct, self.env.as_ref(), &self.lb);
        let ctx = LbCtx {
            l3_off: ETH_HLEN,
            l4_off: packet::l4_off::<A>(),
            ..Default::default()
        };
        let mut report = SimReport::default();

        for i in 0..packets {
            let flags = match (flow.proto, i) {
                (IPPROTO_TCP, 0) => TCP_SYN,
                (IPPROTO_TCP, i) if i + 1 == packets => TCP_FIN | TCP_ACK,
                (IPPROTO_TCP, _) => TCP_ACK,
                _ => 0,
            };
            let mut pkt = packet::build(
                client,
                frontend,
                flow.proto,
                flow.client_port,
                flow.port,
                flags,
                PAYLOAD,
            );

            match lb.lb_service::<A, _>(&mut pkt, &ctx) {
                Ok(Some(verdict)) if verdict.disposition == Disposition::Forward => {
                    report.forwarded += 1;
                    *report.per_backend.entry(verdict.state.backend_id).or_insert(0) += 1;
                    if self.check_reply(&lb, &ctx, &pkt, flow, client, frontend, &verdict.state) {
                        report.replies_ok += 1;
                    } else {
                        report.replies_bad += 1;
                    }
                }
                Ok(Some(_)) => report.untranslated += 1,
                Ok(None) => report.not_service += 1,
                Err(DropReason::NoService) => {
                    match lb.no_service_reply::<A, _>(&mut pkt, opts.ifindex) {
                        Ok(_) => report.unreachable += 1,
                        Err(e) => {
                            debug!("[sim] no reply for {}: {}", client, e);
                            report.dropped += 1;
                        }
                    }
                }
                Err(_) => report.dropped += 1,
            }
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn check_reply<A>(
        &self,
        lb: &Balancer<'_, ServiceTables<A>, ConnTracker<A>, HostEnv>,
        ctx: &LbCtx,
        fwd: &[u8],
        flow: &Flow,
        client: A,
        frontend: A,
        state: &CtState,
    ) -> bool
    where
        A: FamilyTables + NoBackendReply,
    {
        if !packet::checksums_ok::<A>(fwd, flow.proto) {
            return false;
        }
        let (Some((saddr, daddr)), Some((sport, dport))) =
            (packet::addrs::<A>(fwd), packet::ports::<A>(fwd))
        else {
            return false;
        };

        let mut reply = packet::build(daddr, saddr, flow.proto, dport, sport, TCP_ACK, PAYLOAD);
        if lb.rev_nat::<A, _>(&mut reply, ctx, state).is_err() {
            return false;
        }

        packet::addrs::<A>(&reply) == Some((frontend, client))
            && packet::ports::<A>(&reply) == Some((flow.port, flow.client_port))
            && packet::checksums_ok::<A>(&reply, flow.proto)
    }

    /// Connect time translation, packets then go straight to the backend.
    fn sock_flow<A>(&self, client: A, frontend: A, flow: &Flow, cookie: u64, packets: usize) -> SimReport
    where
        A: FamilyTables,
    {
        let tables = A::tables(&self.dir);
        let mut report = SimReport::default();
        let mut dst = SockAddr {
            address: frontend,
            port: flow.port,
        };

        match sock_xlate_fwd(tables, self.env.as_ref(), &self.lb, &mut dst, flow.proto, cookie) {
            Ok(Some(xlate)) => {
                report.sock_connects += 1;
                report.forwarded += packets as u64;
                *report.per_backend.entry(xlate.backend_id).or_insert(0) += packets as u64;

                let mut peer = dst;
                let restored = sock_xlate_rev(tables, xlate.rev_nat_index, &mut peer)
                    && peer == xlate.frontend;
                if restored {
                    report.replies_ok += packets as u64;
                } else {
                    report.replies_bad += packets as u64;
                }
            }
            Ok(None) => report.not_service += packets as u64,
            Err(DropReason::NoService) => report.refused += 1,
            Err(e) => {
                debug!("[sim] connect from {} failed: {}", client, e);
                report.dropped += packets as u64;
            }
        }
        report
    }
}
