//! Service dispatcher. Resolves the backend of a flow addressed to a
//! service frontend, keeps the flow bound to it through connection
//! tracking and translates the packet towards it.

use crate::{
    affinity,
    buffer::PacketBuffer,
    error::DropReason,
    family::L3Family,
    icmp::NoBackendReply,
    lookup,
    maps::{ConnTrack, Directory, Env, RateLimitMaps},
    nat,
    select::select_backend_id,
};
use log::debug;
use svclb_common::{
    stats, Backend, CtState, CtStatus, Features, FlowTuple, LbConfig, LbContinuation, Service,
    SvcKey, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP,
};

/// Fragmentation state of the packet as seen by the caller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Fragment {
    #[default]
    None,
    /// First fragment, the transport header is present
    Initial,
    /// Non initial fragment, the ports come from the caller's fragment
    /// tracking and the transport header must not be touched
    Subsequent { src_port: u16, dst_port: u16 },
}

impl Fragment {
    pub fn has_l4_header(&self) -> bool {
        !matches!(self, Self::Subsequent { .. })
    }
}

/// Outcome of a successful dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Translated towards the backend
    Forward,
    /// Passed on untranslated
    Untranslated,
    /// Handed untranslated to the local proxy
    PuntToProxy,
    /// Rewritten into a reply that must leave through the receiving
    /// interface
    Redirect,
}

impl Disposition {
    fn stat(&self) -> u32 {
        match self {
            Self::Forward => stats::FORWARD,
            Self::Untranslated => stats::SKIP_XLATE,
            Self::PuntToProxy => stats::PUNT_PROXY,
            Self::Redirect => stats::ICMP_NO_SERVICE,
        }
    }
}

/// Per packet invocation context.
#[derive(Clone, Copy, Debug, Default)]
pub struct LbCtx {
    pub l3_off: usize,
    pub l4_off: usize,
    pub frag: Fragment,
    /// Network namespace of the sender, if known
    pub netns_cookie: Option<u64>,
    /// Resolve two scope services at the internal scope
    pub scope_switch: bool,
    /// Resolve and track the backend but leave the packet untouched
    pub skip_xlate: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct Verdict<A> {
    pub disposition: Disposition,
    /// Flow tuple after translation, in connection tracking order
    pub tuple: FlowTuple<A>,
    pub state: CtState,
    pub continuation: LbContinuation,
}

/// Reads the flow tuple of a packet addressed to a service. ICMP is never
/// load balanced and only TCP, UDP and SCTP carry ports.
pub fn extract_tuple<A: L3Family, P: PacketBuffer>(
    pkt: &P,
    l3_off: usize,
    l4_off: usize,
    frag: Fragment,
) -> Result<FlowTuple<A>, DropReason> {
    let nexthdr = pkt.load_u8(l3_off + A::PROTO_OFF)?;
    let saddr = pkt.load_addr::<A>(l3_off + A::SADDR_OFF)?;
    let daddr = pkt.load_addr::<A>(l3_off + A::DADDR_OFF)?;

    match nexthdr {
        IPPROTO_TCP | IPPROTO_UDP | IPPROTO_SCTP => {
            let (src_port, dst_port) = load_ports(pkt, l4_off, frag)?;
            Ok(FlowTuple::from_packet(saddr, daddr, src_port, dst_port, nexthdr))
        }
        p if p == A::ICMP_PROTO => Err(DropReason::UnsupportedServiceProto(nexthdr)),
        _ => Err(DropReason::UnsupportedL4(nexthdr)),
    }
}

fn load_ports<P: PacketBuffer>(
    pkt: &P,
    l4_off: usize,
    frag: Fragment,
) -> Result<(u16, u16), DropReason> {
    match frag {
        Fragment::Subsequent { src_port, dst_port } => Ok((src_port, dst_port)),
        _ => Ok((
            pkt.load_u16(l4_off + nat::SPORT_OFF)?,
            pkt.load_u16(l4_off + nat::DPORT_OFF)?,
        )),
    }
}

/// Service key of the frontend the tuple is addressed to.
pub fn fill_key<A: L3Family>(tuple: &FlowTuple<A>) -> SvcKey<A> {
    // tuple ports are in reverse order
    SvcKey::new(tuple.daddr, tuple.sport, tuple.nexthdr)
}

pub struct Balancer<'a, D, T, E> {
    maps: &'a D,
    ct: &'a T,
    env: &'a E,
    config: &'a LbConfig,
}

impl<'a, D, T, E> Balancer<'a, D, T, E> {
    pub fn new(maps: &'a D, ct: &'a T, env: &'a E, config: &'a LbConfig) -> Self {
        Self {
            maps,
            ct,
            env,
            config,
        }
    }

    pub fn config(&self) -> &LbConfig {
        self.config
    }

    /// Load balances a packet. Returns `None` if the packet is not
    /// addressed to a service.
    pub fn lb_service<A, P>(
        &self,
        pkt: &mut P,
        ctx: &LbCtx,
    ) -> Result<Option<Verdict<A>>, DropReason>
    where
        A: L3Family,
        P: PacketBuffer,
        D: Directory<A>,
        T: ConnTrack<A>,
        E: Env<A>,
    {
        self.env.stats_inc(stats::PACKETS);
        let res = self.lb_service_inner(pkt, ctx);
        match &res {
            Ok(Some(verdict)) => self.env.stats_inc(verdict.disposition.stat()),
            Ok(None) => self.env.stats_inc(stats::NOT_SERVICE),
            Err(e) => {
                debug!("[lb] drop: {}", e);
                self.env.stats_inc(e.stat())
            }
        }
        res
    }

    fn lb_service_inner<A, P>(
        &self,
        pkt: &mut P,
        ctx: &LbCtx,
    ) -> Result<Option<Verdict<A>>, DropReason>
    where
        A: L3Family,
        P: PacketBuffer,
        D: Directory<A>,
        T: ConnTrack<A>,
        E: Env<A>,
    {
        let mut tuple = extract_tuple::<A, P>(pkt, ctx.l3_off, ctx.l4_off, ctx.frag)?;
        let mut key = fill_key(&tuple);

        let Some(svc) = lookup::lookup_service(self.maps, &mut key, ctx.scope_switch) else {
            return Ok(None);
        };

        if !lookup::src_range_ok(self.maps, self.config, &svc, &tuple.saddr) {
            debug!(
                "[lb] {} rejected by source ranges of {}:{}",
                tuple.saddr, key.address, key.dport
            );
            return Err(DropReason::NotInSourceRange);
        }

        let mut state = CtState::default();
        let (disposition, cluster_id) =
            self.lb_local(pkt, ctx, &key, &mut tuple, &svc, &mut state)?;

        let proxy_port = if self.config.has(Features::L7_LB) && svc.is_l7_loadbalancer() {
            svc.l7_proxy_port
        } else {
            0
        };

        Ok(Some(Verdict {
            disposition,
            tuple,
            state,
            continuation: LbContinuation::new(&state, proxy_port, cluster_id),
        }))
    }

    /// Resolves the backend of `tuple` for service `svc` and translates the
    /// packet. Returns the disposition and the backend cluster id. The tuple
    /// flags are restored on every path.
    pub fn lb_local<A, P>(
        &self,
        pkt: &mut P,
        ctx: &LbCtx,
        key: &SvcKey<A>,
        tuple: &mut FlowTuple<A>,
        svc: &Service,
        state: &mut CtState,
    ) -> Result<(Disposition, u32), DropReason>
    where
        A: L3Family,
        P: PacketBuffer,
        D: Directory<A>,
        T: ConnTrack<A>,
        E: Env<A>,
    {
        let saddr = tuple.saddr;
        let flags = tuple.flags;

        state.rev_nat_index = svc.rev_nat_index;

        let resolved = self.resolve_backend(pkt, ctx, key, tuple, svc, state);
        tuple.flags = flags;
        let (backend_id, backend) = resolved?;

        if self.affinity_enabled(svc) {
            affinity::update_affinity_by_addr(self.maps, self.env, svc, &saddr, backend_id);
        }

        let mut new_saddr = None;
        if saddr == backend.address {
            // the client reaches itself through the service
            if self.skip_local_redirect(ctx, svc, tuple) {
                debug!(
                    "[lb] netns {:?} skips {}:{}",
                    ctx.netns_cookie, tuple.daddr, tuple.sport
                );
                return Ok((Disposition::Untranslated, backend.cluster_id));
            }
            if let Some(loopback) = A::loopback_source(self.config) {
                new_saddr = Some(loopback);
                state.loopback = true;
            }
        }

        if !state.loopback {
            tuple.daddr = backend.address;
        }

        if svc.is_l7_punt_proxy() && self.env.is_local_endpoint(&backend.address) {
            return Ok((Disposition::PuntToProxy, backend.cluster_id));
        }

        if ctx.skip_xlate {
            return Ok((Disposition::Untranslated, backend.cluster_id));
        }

        if backend.port != 0 {
            tuple.sport = backend.port;
        }

        nat::lb_xlate(
            pkt,
            new_saddr.as_ref(),
            &saddr,
            tuple.nexthdr,
            ctx.l3_off,
            ctx.l4_off,
            key,
            &backend,
            ctx.frag.has_l4_header(),
        )?;

        Ok((Disposition::Forward, backend.cluster_id))
    }

    fn resolve_backend<A, P>(
        &self,
        pkt: &P,
        ctx: &LbCtx,
        key: &SvcKey<A>,
        tuple: &mut FlowTuple<A>,
        svc: &Service,
        state: &mut CtState,
    ) -> Result<(u32, Backend<A>), DropReason>
    where
        A: L3Family,
        P: PacketBuffer,
        D: Directory<A>,
        T: ConnTrack<A>,
        E: Env<A>,
    {
        let saddr = tuple.saddr;

        match self.ct.lookup_service(pkt, ctx.l4_off, tuple, state)? {
            CtStatus::New => {
                if svc.count == 0 {
                    return Err(DropReason::NoService);
                }

                let mut bound = None;
                if self.affinity_enabled(svc) {
                    bound = affinity::affinity_backend_by_addr(self.maps, self.env, svc, &saddr)
                        .and_then(|id| lookup::lookup_backend(self.maps, id).map(|b| (id, b)));
                }

                let (backend_id, backend) = match bound {
                    Some(bound) => bound,
                    None => self.select(key, tuple, svc)?,
                };

                state.backend_id = backend_id;

                // fail closed, never forward a flow that isn't tracked
                self.ct
                    .create_service(tuple, state)
                    .map_err(|_| DropReason::ConnectionCreateFailed)?;

                Ok((backend_id, backend))
            }
            CtStatus::Reply => match lookup::lookup_backend(self.maps, state.backend_id) {
                Some(backend) if backend.is_active() => Ok((state.backend_id, backend)),
                Some(backend) if !state.syn => {
                    debug!(
                        "[lb] draining to {:?} backend {}",
                        backend.state, state.backend_id
                    );
                    Ok((state.backend_id, backend))
                }
                _ => {
                    if svc.count == 0 {
                        return Err(DropReason::NoService);
                    }

                    let (backend_id, backend) = self.select(key, tuple, svc)?;
                    debug!(
                        "[lb] rev nat {} backend {} -> {}",
                        svc.rev_nat_index, state.backend_id, backend_id
                    );

                    state.backend_id = backend_id;
                    state.rev_nat_index = svc.rev_nat_index;
                    self.ct
                        .update_service_backend(tuple, backend_id, svc.rev_nat_index);
                    self.env.stats_inc(stats::BACKEND_RESELECT);

                    Ok((backend_id, backend))
                }
            },
            status => {
                debug!("[lb] unexpected connection state {:?}", status);
                Err(DropReason::UnknownConnectionState)
            }
        }
    }

    fn select<A>(
        &self,
        key: &SvcKey<A>,
        tuple: &FlowTuple<A>,
        svc: &Service,
    ) -> Result<(u32, Backend<A>), DropReason>
    where
        A: L3Family,
        D: Directory<A>,
        E: Env<A>,
    {
        let backend_id = select_backend_id(self.maps, self.env, self.config, key, tuple, svc)
            .ok_or(DropReason::NoService)?;
        let backend =
            lookup::lookup_backend(self.maps, backend_id).ok_or(DropReason::NoService)?;
        Ok((backend_id, backend))
    }

    fn affinity_enabled(&self, svc: &Service) -> bool {
        self.config.has(Features::SESSION_AFFINITY) && svc.is_affinity()
    }

    fn skip_local_redirect<A>(&self, ctx: &LbCtx, svc: &Service, tuple: &FlowTuple<A>) -> bool
    where
        A: L3Family,
        D: Directory<A>,
    {
        match ctx.netns_cookie {
            Some(cookie) if cookie > 0 => {
                self.config.has(Features::LOCAL_REDIRECT)
                    && svc.is_local_redirect()
                    && lookup::skip_xlate_from_ctx(self.maps, cookie, &tuple.daddr, tuple.sport)
            }
            _ => false,
        }
    }

    /// Reverse translation of a reply of a load balanced flow whose
    /// connection state is `state`. Flows whose service is gone are left
    /// untouched.
    pub fn rev_nat<A, P>(&self, pkt: &mut P, ctx: &LbCtx, state: &CtState) -> Result<(), DropReason>
    where
        A: L3Family,
        P: PacketBuffer,
        D: Directory<A>,
        E: Env<A>,
    {
        let res = self.rev_nat_inner::<A, P>(pkt, ctx, state);
        match &res {
            Ok(()) => self.env.stats_inc(stats::REV_NAT),
            Err(e) => self.env.stats_inc(e.stat()),
        }
        res
    }

    fn rev_nat_inner<A, P>(&self, pkt: &mut P, ctx: &LbCtx, state: &CtState) -> Result<(), DropReason>
    where
        A: L3Family,
        P: PacketBuffer,
        D: Directory<A>,
    {
        let Some(nat) = lookup::lookup_reverse_nat(self.maps, state.rev_nat_index) else {
            debug!("[lb] no rev nat entry {}", state.rev_nat_index);
            return Ok(());
        };

        let nexthdr = pkt.load_u8(ctx.l3_off + A::PROTO_OFF)?;
        let saddr = pkt.load_addr::<A>(ctx.l3_off + A::SADDR_OFF)?;
        let daddr = pkt.load_addr::<A>(ctx.l3_off + A::DADDR_OFF)?;
        let (src_port, dst_port) = match nexthdr {
            IPPROTO_TCP | IPPROTO_UDP | IPPROTO_SCTP => load_ports(pkt, ctx.l4_off, ctx.frag)?,
            _ => (0, 0),
        };
        let mut tuple = FlowTuple::from_packet(saddr, daddr, src_port, dst_port, nexthdr);

        nat::lb_rev_nat(
            pkt,
            ctx.l3_off,
            ctx.l4_off,
            &nat,
            state.loopback,
            &mut tuple,
            ctx.frag.has_l4_header(),
        )
    }

    /// Answers a packet that failed with [`DropReason::NoService`] with an
    /// unreachable reply when the responder is enabled.
    pub fn no_service_reply<A, P>(&self, pkt: &mut P, ifindex: u32) -> Result<Disposition, DropReason>
    where
        A: NoBackendReply,
        P: PacketBuffer,
        D: RateLimitMaps,
        E: Env<A>,
    {
        if !self.config.has(Features::NO_BACKEND_RESPONSE) {
            return Err(DropReason::NoService);
        }

        match A::no_service(pkt, self.maps, self.env, ifindex) {
            Ok(()) => {
                self.env.stats_inc(stats::ICMP_NO_SERVICE);
                Ok(Disposition::Redirect)
            }
            Err(e) => {
                self.env.stats_inc(e.stat());
                Err(e)
            }
        }
    }
}
