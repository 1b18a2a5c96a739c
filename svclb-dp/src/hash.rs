//! Bob Jenkins' lookup3 hash as used for flow to bucket mapping. Changing
//! anything here invalidates every Maglev table built by the control plane.

use svclb_common::{FlowTuple, InetAddr};

const JHASH_INITVAL: u32 = 0xdeadbeef;

pub const HASH_INIT4_SEED: u32 = 0xcafe;
pub const HASH_INIT6_SEED: u32 = 0xeb9f;

#[inline(always)]
fn jhash_mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline(always)]
fn jhash_final(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c.wrapping_sub(b.rotate_left(24))
}

pub fn jhash_3words(a: u32, b: u32, c: u32, initval: u32) -> u32 {
    let initval = initval.wrapping_add(JHASH_INITVAL).wrapping_add(3 << 2);
    jhash_final(
        a.wrapping_add(initval),
        b.wrapping_add(initval),
        c.wrapping_add(initval),
    )
}

/// Hashes a slice of 32-bit words.
pub fn jhash2(words: &[u32], initval: u32) -> u32 {
    let init = JHASH_INITVAL
        .wrapping_add((words.len() as u32) << 2)
        .wrapping_add(initval);
    let (mut a, mut b, mut c) = (init, init, init);

    let mut k = words;
    while k.len() > 3 {
        a = a.wrapping_add(k[0]);
        b = b.wrapping_add(k[1]);
        c = c.wrapping_add(k[2]);
        jhash_mix(&mut a, &mut b, &mut c);
        k = &k[3..];
    }

    match *k {
        [x, y, z] => jhash_final(a.wrapping_add(x), b.wrapping_add(y), c.wrapping_add(z)),
        [x, y] => jhash_final(a.wrapping_add(x), b.wrapping_add(y), c),
        [x] => jhash_final(a.wrapping_add(x), b, c),
        _ => c,
    }
}

/// Flow hash over the tuple source and the given ports. The destination
/// is implied by the per service table the hash indexes.
pub fn hash_from_tuple<A: InetAddr>(tuple: &FlowTuple<A>, sport: u16, dport: u16) -> u32 {
    let octets = tuple.saddr.to_octets();
    let mut words = [0u32; 4];
    for (w, chunk) in words.iter_mut().zip(octets.as_ref().chunks_exact(4)) {
        *w = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    let (src, seed) = if A::LEN == 4 {
        (words[0], HASH_INIT4_SEED)
    } else {
        (jhash2(&words, HASH_INIT6_SEED), HASH_INIT6_SEED)
    };

    jhash_3words(
        src,
        (dport as u32) << 16 | sport as u32,
        tuple.nexthdr as u32,
        seed,
    )
}
