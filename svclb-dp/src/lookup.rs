//! Directory access helpers on top of the raw table contracts.

use crate::maps::ServiceMaps;
use log::debug;
use svclb_common::{
    Backend, Features, InetAddr, LbConfig, RevNat, Scope, Service, SkipKey, SrcRangeKey, SvcKey,
    IPPROTO_ANY,
};

fn lookup_service_any_proto<A: InetAddr, D: ServiceMaps<A>>(
    maps: &D,
    key: &mut SvcKey<A>,
) -> Option<Service> {
    match maps.service_entry(key) {
        Some(svc) => Some(svc),
        None if key.proto != IPPROTO_ANY => {
            key.proto = IPPROTO_ANY;
            maps.service_entry(key)
        }
        None => None,
    }
}

/// Looks up the service frontend of `key`. A service registered for any
/// protocol matches when there is no protocol specific entry. Two scope
/// services are resolved again at the internal scope when `scope_switch`
/// is set, `key` is left pointing at the entry that matched.
pub fn lookup_service<A: InetAddr, D: ServiceMaps<A>>(
    maps: &D,
    key: &mut SvcKey<A>,
    scope_switch: bool,
) -> Option<Service> {
    let proto = key.proto;

    key.backend_slot = 0;
    key.scope = Scope::External;
    let svc = lookup_service_any_proto(maps, key)?;

    if !scope_switch || !svc.is_two_scopes() {
        return Some(svc);
    }

    key.proto = proto;
    key.scope = Scope::Internal;
    lookup_service_any_proto(maps, key)
}

pub fn lookup_backend<A: InetAddr, D: ServiceMaps<A>>(maps: &D, backend_id: u32) -> Option<Backend<A>> {
    let backend = maps.backend_entry(backend_id);
    if backend.is_none() {
        debug!("[lb] backend {} lookup failed", backend_id);
    }
    backend
}

/// Resolves the backend id stored in slot `slot` of the service.
pub fn lookup_backend_slot<A: InetAddr, D: ServiceMaps<A>>(
    maps: &D,
    key: &SvcKey<A>,
    slot: u16,
) -> Option<u32> {
    let entry = maps.service_entry(&key.with_slot(slot));
    if entry.is_none() {
        debug!("[lb] service {}:{} slot {} lookup failed", key.address, key.dport, slot);
    }
    entry.map(|svc| svc.backend_id)
}

pub fn lookup_reverse_nat<A: InetAddr, D: ServiceMaps<A>>(maps: &D, index: u16) -> Option<RevNat<A>> {
    maps.rev_nat_entry(index)
}

/// Source range gate: allow lists pass listed sources only, deny lists
/// reject them. Services without ranges always pass.
pub fn src_range_ok<A: InetAddr, D: ServiceMaps<A>>(
    maps: &D,
    config: &LbConfig,
    svc: &Service,
    saddr: &A,
) -> bool {
    if !config.has(Features::SRC_RANGE_CHECK) || !svc.has_source_range() {
        return true;
    }

    let key = SrcRangeKey::lookup(svc.rev_nat_index, *saddr);
    maps.source_range_entry(&key) ^ svc.is_source_range_deny()
}

/// True if `netns_cookie` must reach `address:port` untranslated.
pub fn skip_xlate_from_ctx<A: InetAddr, D: ServiceMaps<A>>(
    maps: &D,
    netns_cookie: u64,
    address: &A,
    port: u16,
) -> bool {
    maps.skip_entry(&SkipKey {
        netns_cookie,
        address: *address,
        port,
    })
}
