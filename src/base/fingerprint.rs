//! Cache-key fingerprints.
//!
//! The base-condition cache key is a 128-bit pair of FNV-1a hashes over the
//! serialized `(predicate_id, event_value)` pairs. Three paths exist, sized
//! by the input:
//!
//! - small keys (≤ 16 predicates and ≤ 256 serialized bytes): one pass
//!   through a stack buffer;
//! - medium keys: one pass through a pooled, reusable heap buffer;
//! - oversized keys: hash-only, streaming both FNV states with no buffer.
//!
//! All three serialize the identical byte sequence, so the same semantic
//! input yields byte-identical keys on every path. Divergence here would be
//! a silent correctness bug; the unit tests pin all three paths against each
//! other.

use roaring::RoaringBitmap;

use crate::cache::CacheKey;
use crate::event::EncodedValue;

const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
/// Offset basis for the alternate hash stream. Any constant distinct from
/// the primary basis works; this one is the primary basis folded with the
/// FNV prime once.
const FNV_OFFSET_ALT: u64 = FNV_OFFSET ^ FNV_PRIME;

pub(crate) const SMALL_MAX_PREDICATES: usize = 16;
pub(crate) const SMALL_MAX_BYTES: usize = 256;
pub(crate) const POOLED_MAX_BYTES: usize = 64 * 1024;

/// FNV-1a over `bytes`, from the given offset basis.
#[inline]
fn fnv1a(mut state: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        state ^= u64::from(b);
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

/// Two independent FNV-1a streams folded into one 128-bit digest.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DualFnv {
    primary: u64,
    alternate: u64,
}

impl DualFnv {
    pub(crate) fn new() -> Self {
        DualFnv {
            primary: FNV_OFFSET,
            alternate: FNV_OFFSET_ALT,
        }
    }

    #[inline]
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        self.primary = fnv1a(self.primary, bytes);
        self.alternate = fnv1a(self.alternate, bytes);
    }

    pub(crate) fn digest(self) -> u128 {
        (u128::from(self.primary) << 64) | u128::from(self.alternate)
    }

    pub(crate) fn key(self) -> CacheKey {
        CacheKey(self.digest().to_be_bytes())
    }
}

/// 64-bit FNV-1a over a sorted predicate-id set: base-condition set identity.
pub(crate) fn set_hash(ids: &[u32]) -> u64 {
    let mut state = FNV_OFFSET;
    for &id in ids {
        state = fnv1a(state, &id.to_le_bytes());
    }
    state
}

/// Alternate-basis set hash, used to resolve primary collisions.
pub(crate) fn set_hash_alt(ids: &[u32]) -> u64 {
    let mut state = FNV_OFFSET_ALT;
    for &id in ids {
        state = fnv1a(state, &id.to_le_bytes());
    }
    state
}

/// Content fingerprint of a bitmap, for the eligible-set cache.
pub(crate) fn bitmap_fingerprint(bitmap: &RoaringBitmap) -> u128 {
    let mut fnv = DualFnv::new();
    for value in bitmap {
        fnv.write(&value.to_le_bytes());
    }
    fnv.digest()
}

/// Byte sink for the serialized key. Buffered paths collect bytes; the
/// streaming path hashes them immediately.
trait KeySink {
    /// Returns `false` when the sink cannot take more bytes.
    fn push(&mut self, bytes: &[u8]) -> bool;
}

struct SliceSink<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl KeySink for SliceSink<'_> {
    #[inline]
    fn push(&mut self, bytes: &[u8]) -> bool {
        let end = self.len + bytes.len();
        if end > self.buf.len() {
            return false;
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        true
    }
}

impl KeySink for Vec<u8> {
    #[inline]
    fn push(&mut self, bytes: &[u8]) -> bool {
        self.extend_from_slice(bytes);
        true
    }
}

impl KeySink for DualFnv {
    #[inline]
    fn push(&mut self, bytes: &[u8]) -> bool {
        self.write(bytes);
        true
    }
}

/// Serialize one `(predicate_id, value)` pair. The encoding is
/// deterministic: id, a value tag, then the value payload.
fn write_pair<S: KeySink>(sink: &mut S, predicate_id: u32, value: &EncodedValue) -> bool {
    if !sink.push(&predicate_id.to_le_bytes()) {
        return false;
    }
    match value {
        EncodedValue::Null => sink.push(&[0]),
        EncodedValue::Bool(b) => sink.push(&[1, u8::from(*b)]),
        EncodedValue::Int(i) => sink.push(&[2]) && sink.push(&i.to_le_bytes()),
        EncodedValue::Float(f) => sink.push(&[3]) && sink.push(&f.to_bits().to_le_bytes()),
        EncodedValue::StrId(id) => sink.push(&[4]) && sink.push(&id.to_le_bytes()),
        EncodedValue::Str(s) => {
            sink.push(&[5])
                && sink.push(&(s.len() as u32).to_le_bytes())
                && sink.push(s.as_bytes())
        }
    }
}

fn hash_bytes(bytes: &[u8]) -> CacheKey {
    let mut fnv = DualFnv::new();
    fnv.write(bytes);
    fnv.key()
}

/// Compute the cache key for sorted `(predicate_id, value)` pairs.
///
/// `pooled` is the caller's reusable buffer for the medium path; it is
/// cleared before use and its capacity persists across events.
pub(crate) fn compute_cache_key(
    pairs: &[(u32, &EncodedValue)],
    pooled: &mut Vec<u8>,
) -> CacheKey {
    debug_assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    if pairs.len() <= SMALL_MAX_PREDICATES {
        if let Some(key) = key_via_small(pairs) {
            return key;
        }
    }
    key_via_pooled(pairs, pooled).unwrap_or_else(|| key_via_streaming(pairs))
}

/// Stack-buffer path. `None` when the serialization overflows the buffer.
pub(crate) fn key_via_small(pairs: &[(u32, &EncodedValue)]) -> Option<CacheKey> {
    let mut buf = [0u8; SMALL_MAX_BYTES];
    let mut sink = SliceSink {
        buf: &mut buf,
        len: 0,
    };
    for (id, value) in pairs {
        if !write_pair(&mut sink, *id, value) {
            return None;
        }
    }
    let len = sink.len;
    Some(hash_bytes(&buf[..len]))
}

/// Pooled-buffer path. `None` when the serialization exceeds the pooled cap.
pub(crate) fn key_via_pooled(
    pairs: &[(u32, &EncodedValue)],
    pooled: &mut Vec<u8>,
) -> Option<CacheKey> {
    pooled.clear();
    for (id, value) in pairs {
        write_pair(pooled, *id, value);
        if pooled.len() > POOLED_MAX_BYTES {
            return None;
        }
    }
    Some(hash_bytes(pooled))
}

/// Streaming hash-only path for oversized keys.
pub(crate) fn key_via_streaming(pairs: &[(u32, &EncodedValue)]) -> CacheKey {
    let mut fnv = DualFnv::new();
    for (id, value) in pairs {
        write_pair(&mut fnv, *id, value);
    }
    fnv.key()
}
