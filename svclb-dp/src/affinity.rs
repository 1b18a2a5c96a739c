//! Session affinity: binds a client to the backend it was last served by
//! for `affinity_timeout` seconds.

use crate::maps::{AffinityMaps, Env};
use log::debug;
use svclb_common::{stats, AffinityKey, AffinityMatch, AffinityValue, InetAddr, Service};

fn lookup_affinity<A, D, E>(maps: &D, env: &E, svc: &Service, key: &AffinityKey<A>) -> Option<u32>
where
    A: InetAddr,
    D: AffinityMaps<A>,
    E: Env<A>,
{
    if !svc.is_affinity() {
        return None;
    }

    let val = maps.affinity_entry(key)?;
    let now = env.mono_now();

    // The binding is valid in [last_used, last_used + timeout)
    if val.last_used.saturating_add(svc.affinity_timeout as u64) <= now {
        debug!(
            "[affinity] rev nat {} backend {} expired",
            key.rev_nat_id, val.backend_id
        );
        maps.delete_affinity(key);
        env.stats_inc(stats::AFFINITY_STALE);
        return None;
    }

    let bound = AffinityMatch {
        rev_nat_id: svc.rev_nat_index,
        backend_id: val.backend_id,
    };
    if !maps.affinity_match_entry(&bound) {
        debug!(
            "[affinity] backend {} left rev nat {}",
            val.backend_id, svc.rev_nat_index
        );
        maps.delete_affinity(key);
        env.stats_inc(stats::AFFINITY_STALE);
        return None;
    }

    maps.upsert_affinity(
        key,
        &AffinityValue {
            backend_id: val.backend_id,
            last_used: now,
        },
    );
    env.stats_inc(stats::AFFINITY_HIT);
    Some(val.backend_id)
}

fn update_affinity<A, D, E>(maps: &D, env: &E, key: &AffinityKey<A>, backend_id: u32)
where
    A: InetAddr,
    D: AffinityMaps<A>,
    E: Env<A>,
{
    maps.upsert_affinity(
        key,
        &AffinityValue {
            backend_id,
            last_used: env.mono_now(),
        },
    );
}

/// Backend bound to the client address, refreshing the binding.
pub fn affinity_backend_by_addr<A, D, E>(maps: &D, env: &E, svc: &Service, client: &A) -> Option<u32>
where
    A: InetAddr,
    D: AffinityMaps<A>,
    E: Env<A>,
{
    let key = AffinityKey::by_addr(svc.rev_nat_index, *client);
    lookup_affinity(maps, env, svc, &key)
}

pub fn update_affinity_by_addr<A, D, E>(maps: &D, env: &E, svc: &Service, client: &A, backend_id: u32)
where
    A: InetAddr,
    D: AffinityMaps<A>,
    E: Env<A>,
{
    let key = AffinityKey::by_addr(svc.rev_nat_index, *client);
    update_affinity(maps, env, &key, backend_id)
}

/// Backend bound to the client network namespace.
pub fn affinity_backend_by_netns<A, D, E>(maps: &D, env: &E, svc: &Service, cookie: u64) -> Option<u32>
where
    A: InetAddr,
    D: AffinityMaps<A>,
    E: Env<A>,
{
    let key = AffinityKey::<A>::by_netns(svc.rev_nat_index, cookie);
    lookup_affinity(maps, env, svc, &key)
}

pub fn update_affinity_by_netns<A, D, E>(maps: &D, env: &E, svc: &Service, cookie: u64, backend_id: u32)
where
    A: InetAddr,
    D: AffinityMaps<A>,
    E: Env<A>,
{
    let key = AffinityKey::<A>::by_netns(svc.rev_nat_index, cookie);
    update_affinity(maps, env, &key, backend_id)
}
