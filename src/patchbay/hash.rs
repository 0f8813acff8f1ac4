// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hash table rebuilding for the patchbay engine (component C6): SYSV
//! `.hash` and GNU `.gnu.hash` payload construction, plus the two hash
//! functions themselves.

const PRIMES: &[u32] = &[
    3, 5, 7, 11, 17, 29, 53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317,
    196613, 393241, 786433,
];

/// The classic ELF SYSV `.hash` string hash.
pub fn sysv_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for &c in name.as_bytes() {
        h = h.wrapping_shl(4).wrapping_add(c as u32);
        let g = h & 0xF000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

/// The GNU `.gnu.hash` string hash: `h(0) = 5381`, `h(i) = h(i-1)*33 + c`.
pub fn gnu_hash(name: &str) -> u32 {
    let mut h: u32 = 5381;
    for &c in name.as_bytes() {
        h = h.wrapping_shl(5).wrapping_add(h).wrapping_add(c as u32);
    }
    h
}

/// Picks the first prime bucket count `>= max(8, nchain/2 + 1)`.
pub fn choose_bucket_count(nchain: u32) -> u32 {
    let target = if nchain < 8 { 8 } else { nchain / 2 + 1 };
    PRIMES.iter().copied().find(|&p| p >= target).unwrap_or(*PRIMES.last().unwrap())
}

/// Serializes a SYSV `.hash` payload: `[nbucket, nchain, buckets[], chains[]]`.
pub fn build_sysv_hash_payload(names: &[&str]) -> Vec<u8> {
    if names.is_empty() {
        return Vec::new();
    }
    let nchain = names.len() as u32;
    let nbucket = choose_bucket_count(nchain);
    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; nchain as usize];

    for sym_index in 1..nchain {
        let name = names[sym_index as usize];
        if name.is_empty() {
            continue;
        }
        let b = (sysv_hash(name) % nbucket) as usize;
        if buckets[b] == 0 {
            buckets[b] = sym_index;
            continue;
        }
        let mut cursor = buckets[b] as usize;
        while chains[cursor] != 0 {
            cursor = chains[cursor] as usize;
        }
        chains[cursor] = sym_index;
    }

    let mut out = Vec::with_capacity(8 + 4 * (buckets.len() + chains.len()));
    out.extend_from_slice(&nbucket.to_le_bytes());
    out.extend_from_slice(&nchain.to_le_bytes());
    for b in &buckets {
        out.extend_from_slice(&b.to_le_bytes());
    }
    for c in &chains {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out
}

/// Serializes a `.gnu.hash` payload using the single-bucket model from spec
/// section 4.6 step 4: `nbuckets=1, symoffset=1, bloom_size=1, bloom_shift=6`.
pub fn build_gnu_hash_payload(names: &[&str]) -> Vec<u8> {
    if names.len() <= 1 {
        return Vec::new();
    }
    let nchain = names.len() as u32;
    let symoffset: u32 = 1;
    let nbuckets: u32 = 1;
    let bloom_size: u32 = 1;
    let bloom_shift: u32 = 6;

    let mut bloom = vec![0u64; bloom_size as usize];
    let mut buckets = vec![0u32; nbuckets as usize];
    let mut last_in_bucket = vec![0u32; nbuckets as usize];
    let mut chain = vec![0u32; (nchain - symoffset) as usize];

    for sym_index in symoffset..nchain {
        let name = names[sym_index as usize];
        if name.is_empty() {
            continue;
        }
        let h = gnu_hash(name);
        let b = (h % nbuckets) as usize;
        if buckets[b] == 0 {
            buckets[b] = sym_index;
        }
        last_in_bucket[b] = sym_index;
        let word = ((h / 64) % bloom_size) as usize;
        let bit1 = h % 64;
        let bit2 = (h >> bloom_shift) % 64;
        bloom[word] |= (1u64 << bit1) | (1u64 << bit2);
    }

    for sym_index in symoffset..nchain {
        let name = names[sym_index as usize];
        if name.is_empty() {
            continue;
        }
        let h = gnu_hash(name);
        let b = (h % nbuckets) as usize;
        let chain_index = (sym_index - symoffset) as usize;
        let mut chain_value = h & !1u32;
        if sym_index == last_in_bucket[b] {
            chain_value |= 1;
        }
        chain[chain_index] = chain_value;
    }

    let mut out = Vec::with_capacity(16 + 8 * bloom.len() + 4 * (buckets.len() + chain.len()));
    out.extend_from_slice(&nbuckets.to_le_bytes());
    out.extend_from_slice(&symoffset.to_le_bytes());
    out.extend_from_slice(&(bloom.len() as u32).to_le_bytes());
    out.extend_from_slice(&bloom_shift.to_le_bytes());
    for w in &bloom {
        out.extend_from_slice(&w.to_le_bytes());
    }
    for b in &buckets {
        out.extend_from_slice(&b.to_le_bytes());
    }
    for c in &chain {
        out.extend_from_slice(&c.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Testable property 3 from spec section 8.
    #[test]
    fn hash_vectors() {
        assert_eq!(sysv_hash(""), 0);
        assert_eq!(sysv_hash("printf"), 0x0779_05A6);
        assert_eq!(gnu_hash(""), 5381);
        assert_eq!(gnu_hash("printf"), 0x156B_71AF);
    }

    #[test]
    fn bucket_count_small_nchain_uses_minimum_target() {
        assert_eq!(choose_bucket_count(1), 11);
    }

    #[test]
    fn bucket_count_picks_first_ge_target() {
        assert_eq!(choose_bucket_count(4), PRIMES.iter().copied().find(|&p| p >= 8).unwrap());
        assert_eq!(choose_bucket_count(20), PRIMES.iter().copied().find(|&p| p >= 11).unwrap());
    }

    #[test]
    fn gnu_hash_single_bucket_payload_shape() {
        let names = ["", "printf", "malloc"];
        let payload = build_gnu_hash_payload(&names);
        assert_eq!(u32::from_le_bytes(payload[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(payload[4..8].try_into().unwrap()), 1);
    }
}
