//! Connect time translation. The destination of a connecting socket is
//! rewritten once so its packets never need per packet translation, the
//! client identity for affinity is its network namespace.

use crate::{
    affinity::{affinity_backend_by_netns, update_affinity_by_netns},
    error::DropReason,
    lookup::{lookup_backend, lookup_reverse_nat, lookup_service, skip_xlate_from_ctx},
    maps::{Directory, Env},
    select::select_random,
};
use log::debug;
use svclb_common::{Features, InetAddr, LbConfig, SvcKey};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SockAddr<A> {
    pub address: A,
    pub port: u16,
}

/// Result of a connect time translation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SockXlate<A> {
    pub backend_id: u32,
    pub rev_nat_index: u16,
    /// Address the socket connected to
    pub frontend: SockAddr<A>,
}

/// Rewrites `dst` to a backend of the service it points at. Returns `None`
/// and leaves `dst` alone when it is not a service or the namespace must
/// reach the frontend itself. There is no flow tuple before the connection
/// exists so the backend is picked at random.
pub fn sock_xlate_fwd<A, D, E>(
    maps: &D,
    env: &E,
    config: &LbConfig,
    dst: &mut SockAddr<A>,
    proto: u8,
    netns_cookie: u64,
) -> Result<Option<SockXlate<A>>, DropReason>
where
    A: InetAddr,
    D: Directory<A>,
    E: Env<A>,
{
    let mut key = SvcKey::new(dst.address, dst.port, proto);
    let Some(svc) = lookup_service(maps, &mut key, true) else {
        return Ok(None);
    };

    if netns_cookie > 0
        && config.has(Features::LOCAL_REDIRECT)
        && svc.is_local_redirect()
        && skip_xlate_from_ctx(maps, netns_cookie, &dst.address, dst.port)
    {
        debug!("[lb] sock netns {} skips {}:{}", netns_cookie, dst.address, dst.port);
        return Ok(None);
    }

    if svc.count == 0 {
        return Err(DropReason::NoService);
    }

    let affinity = config.has(Features::SESSION_AFFINITY) && svc.is_affinity();
    let mut bound = None;
    if affinity {
        bound = affinity_backend_by_netns::<A, _, _>(maps, env, &svc, netns_cookie)
            .and_then(|id| lookup_backend(maps, id).map(|b| (id, b)));
    }

    let (backend_id, backend) = match bound {
        Some(bound) => bound,
        None => {
            let id = select_random(maps, env, &key, &svc).ok_or(DropReason::NoService)?;
            (id, lookup_backend(maps, id).ok_or(DropReason::NoService)?)
        }
    };

    if affinity {
        update_affinity_by_netns::<A, _, _>(maps, env, &svc, netns_cookie, backend_id);
    }

    let frontend = *dst;
    dst.address = backend.address;
    if backend.port != 0 {
        dst.port = backend.port;
    }

    Ok(Some(SockXlate {
        backend_id,
        rev_nat_index: svc.rev_nat_index,
        frontend,
    }))
}

/// Restores the frontend as the peer address reported to the socket.
/// Returns false if the service is gone.
pub fn sock_xlate_rev<A, D>(maps: &D, rev_nat_index: u16, peer: &mut SockAddr<A>) -> bool
where
    A: InetAddr,
    D: Directory<A>,
{
    match lookup_reverse_nat(maps, rev_nat_index) {
        Some(nat) => {
            peer.address = nat.address;
            peer.port = nat.port;
            true
        }
        None => false,
    }
}
