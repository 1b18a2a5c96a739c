//! Backend selection algorithms. Selection never writes any table.

use crate::{
    hash::hash_from_tuple,
    lookup::lookup_backend_slot,
    maps::{Env, ServiceMaps},
};
use log::debug;
use svclb_common::{Algorithm, FlowTuple, InetAddr, LbConfig, Service, SvcKey};

/// Picks a uniformly random slot in `[1, count]`.
pub fn select_random<A, D, E>(maps: &D, env: &E, key: &SvcKey<A>, svc: &Service) -> Option<u32>
where
    A: InetAddr,
    D: ServiceMaps<A>,
    E: Env<A>,
{
    if svc.count == 0 {
        return None;
    }
    let slot = (env.prandom_u32() % svc.count as u32) as u16 + 1;
    lookup_backend_slot(maps, key, slot)
}

/// Reads the service Maglev table at the flow hash bucket. The tuple is in
/// connection tracking order so the ports are swapped back before hashing,
/// affinity services hash without the source port.
pub fn select_maglev<A, D>(
    maps: &D,
    config: &LbConfig,
    tuple: &FlowTuple<A>,
    svc: &Service,
) -> Option<u32>
where
    A: InetAddr,
    D: ServiceMaps<A>,
{
    if config.maglev_lut_size == 0 {
        return None;
    }
    let sport = if svc.is_affinity() { 0 } else { tuple.dport };
    let dport = tuple.sport;
    let index = hash_from_tuple(tuple, sport, dport) % config.maglev_lut_size;

    match maps.maglev_entry(svc.rev_nat_index, index) {
        Some(0) | None => {
            debug!(
                "[lb] no maglev bucket {} for rev nat {}",
                index, svc.rev_nat_index
            );
            None
        }
        id => id,
    }
}

pub fn select_first<A, D>(maps: &D, key: &SvcKey<A>) -> Option<u32>
where
    A: InetAddr,
    D: ServiceMaps<A>,
{
    lookup_backend_slot(maps, key, 1)
}

/// Selects a backend id for a new flow with the algorithm configured for
/// the service.
pub fn select_backend_id<A, D, E>(
    maps: &D,
    env: &E,
    config: &LbConfig,
    key: &SvcKey<A>,
    tuple: &FlowTuple<A>,
    svc: &Service,
) -> Option<u32>
where
    A: InetAddr,
    D: ServiceMaps<A>,
    E: Env<A>,
{
    match config.algorithm(svc) {
        Algorithm::Random => select_random(maps, env, key, svc),
        Algorithm::Maglev => select_maglev(maps, config, tuple, svc),
        Algorithm::First => select_first(maps, key),
    }
}
