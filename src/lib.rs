//! Pocket-dictionary membership filter for 64-bit keys.
//!
//! The filter is a flat array of fixed-size pocket dictionaries: 64-byte
//! blocks that each hold up to 51 quotient/remainder fingerprints behind a
//! 101-bit unary header. Keys are added incrementally with
//! [`PocketFilter::add`] and queried with [`PocketFilter::contains`] (which
//! never reports a false negative) or with the prefetching batch probes
//! [`PocketFilter::contains_batch_64`] and [`PocketFilter::contains_batch_128`].
//! Bulk construction via [`PocketFilter::build`] splits the bucket array into
//! disjoint shards and fills them in parallel.

use rayon::prelude::*;
use std::thread;

const QUOTIENT_RANGE: usize = 50;
const SLOT_CAPACITY: usize = 51;
const HEADER_BITS: usize = QUOTIENT_RANGE + SLOT_CAPACITY;
const HEADER_BYTES: usize = (HEADER_BITS + 7) / 8;
const BUCKET_BYTES: usize = 64;
const HEADER_MASK: u128 = (1u128 << HEADER_BITS) - 1;
const EMPTY_HEADER: u128 = (1u128 << QUOTIENT_RANGE) - 1;
const DEFAULT_KEYS_PER_BUCKET: usize = 45;
const PARALLEL_BUILD_MIN_KEYS: usize = 4096;

// ---------------------------------------------------------------------------
// Bit primitives
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "bmi2")]
unsafe fn select64_bmi2(x: u64, j: u64) -> u64 {
    // SAFETY: caller guarantees BMI2.
    unsafe { std::arch::x86_64::_pdep_u64(1u64 << j, x).trailing_zeros() as u64 }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "bmi2")]
unsafe fn select64_alt_bmi2(x: u64, j: u64) -> u64 {
    // SAFETY: caller guarantees BMI2. The wrapping shift masks the count to
    // six bits, so an all-ones `j` deposits bit 63 instead of overflowing.
    unsafe { std::arch::x86_64::_pdep_u64(1u64.wrapping_shl(j as u32), x).trailing_zeros() as u64 }
}

fn select64_fallback(mut x: u64, j: u64) -> u64 {
    for _ in 0..j {
        x &= x.wrapping_sub(1);
    }
    x.trailing_zeros() as u64
}

/// Position of the `j`th set bit of `x`, counting from bit 0.
///
/// Requires `j < 64`; a rank past the last set bit yields 64.
#[inline]
fn select64(x: u64, j: u64) -> u64 {
    debug_assert!(j < 64);
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("bmi2") {
            // SAFETY: feature detected at runtime.
            return unsafe { select64_bmi2(x, j) };
        }
    }
    select64_fallback(x, j)
}

/// [`select64`] with the rank taken modulo 64, so the all-ones encoding of
/// -1 degrades to an out-of-range select instead of being undefined. Lets
/// callers skip a range test on the rank argument.
#[inline]
fn select64_alt(x: u64, j: u64) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("bmi2") {
            // SAFETY: feature detected at runtime.
            return unsafe { select64_alt_bmi2(x, j) };
        }
    }
    select64_fallback(x, j & 63)
}

/// Position of the `j`th set bit of a 128-bit operand.
#[inline]
fn select128(x: u128, j: u64) -> u64 {
    select128_with_pop(x, j, (x as u64).count_ones() as u64)
}

/// [`select128`] with the low-half popcount supplied by the caller, so one
/// popcount can serve several selects over the same operand.
#[inline]
fn select128_with_pop(x: u128, j: u64, low_pop: u64) -> u64 {
    if j < low_pop {
        select64(x as u64, j)
    } else {
        64 + select64((x >> 64) as u64, j - low_pop)
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn match_mask_avx2(block: &[u8; BUCKET_BYTES], needle: u8) -> u64 {
    use std::arch::x86_64::*;
    // SAFETY: caller guarantees AVX2; the two unaligned loads cover the
    // 64-byte block exactly.
    unsafe {
        let target = _mm256_set1_epi8(needle as i8);
        let low = _mm256_loadu_si256(block.as_ptr() as *const __m256i);
        let high = _mm256_loadu_si256(block.as_ptr().add(32) as *const __m256i);
        let low_mask = _mm256_movemask_epi8(_mm256_cmpeq_epi8(low, target)) as u32;
        let high_mask = _mm256_movemask_epi8(_mm256_cmpeq_epi8(high, target)) as u32;
        (low_mask as u64) | ((high_mask as u64) << 32)
    }
}

fn match_mask_swar(block: &[u8; BUCKET_BYTES], needle: u8) -> u64 {
    const LOW7: u64 = 0x7F7F_7F7F_7F7F_7F7F;
    const GATHER: u64 = 0x0102_0408_1020_4080;
    let broadcast = 0x0101_0101_0101_0101u64.wrapping_mul(needle as u64);
    let mut mask = 0u64;
    for (word_index, chunk) in block.chunks_exact(8).enumerate() {
        let mut word_bytes = [0u8; 8];
        word_bytes.copy_from_slice(chunk);
        let x = u64::from_le_bytes(word_bytes) ^ broadcast;
        // Per-byte zero test without cross-byte carries: the high bit of each
        // byte of `zero` is set exactly when the byte of `x` is zero.
        let zero = !(((x & LOW7).wrapping_add(LOW7)) | x | LOW7);
        mask |= ((zero >> 7).wrapping_mul(GATHER) >> 56) << (word_index * 8);
    }
    mask
}

/// 64-bit mask whose bit `i` is set when `block[i] == needle`.
#[inline]
fn match_mask(block: &[u8; BUCKET_BYTES], needle: u8) -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("avx2") {
            // SAFETY: feature detected at runtime.
            return unsafe { match_mask_avx2(block, needle) };
        }
    }
    match_mask_swar(block, needle)
}

/// Non-temporal read prefetch of a bucket's cache line. A hint only; it has
/// no architectural effect and never faults.
#[inline]
fn prefetch_read(dict: &PocketDict) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch has no effect beyond the cache.
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_NTA};
        _mm_prefetch::<_MM_HINT_NTA>(dict as *const PocketDict as *const i8);
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: prefetch has no effect beyond the cache.
    unsafe {
        core::arch::asm!(
            "prfm pldl1strm, [{addr}]",
            addr = in(reg) dict as *const PocketDict,
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let _ = dict;
}

// ---------------------------------------------------------------------------
// Pocket dictionary
// ---------------------------------------------------------------------------

/// A 64-byte pocket dictionary holding up to 51 fingerprints.
///
/// The first 101 bits form a unary header that partitions the slots among 50
/// quotient classes: a set bit separates consecutive classes and a zero bit
/// is one occupied slot. The remainder tape starts at byte 13 and keeps each
/// class's remainders sorted non-decreasingly. The little-endian `u128` view
/// of the first 16 bytes always satisfies `popcount(header) == 50` with the
/// three padding bits above bit 100 clear.
#[repr(C, align(64))]
#[derive(Clone)]
pub struct PocketDict {
    bytes: [u8; BUCKET_BYTES],
}

impl PocketDict {
    /// Maximum number of fingerprints a dictionary holds.
    pub const CAPACITY: usize = SLOT_CAPACITY;
    /// Number of quotient classes a dictionary partitions its slots into.
    pub const QUOTIENTS: usize = QUOTIENT_RANGE;

    /// Creates an empty dictionary (header `2^50 - 1`, no occupied slots).
    pub fn new() -> Self {
        let mut bytes = [0u8; BUCKET_BYTES];
        bytes[..HEADER_BYTES].copy_from_slice(&EMPTY_HEADER.to_le_bytes()[..HEADER_BYTES]);
        Self { bytes }
    }

    #[inline]
    fn header(&self) -> u128 {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&self.bytes[..16]);
        u128::from_le_bytes(raw) & HEADER_MASK
    }

    #[inline]
    fn store_header(&mut self, header: u128) {
        debug_assert_eq!(header & !HEADER_MASK, 0);
        self.bytes[..HEADER_BYTES].copy_from_slice(&header.to_le_bytes()[..HEADER_BYTES]);
    }

    /// Number of occupied slots, between 0 and [`PocketDict::CAPACITY`].
    pub fn fill(&self) -> usize {
        let last_separator = select128(self.header(), QUOTIENT_RANGE as u64 - 1);
        last_separator as usize - (QUOTIENT_RANGE - 1)
    }

    /// Returns true when every slot is occupied and further adds will fail.
    pub fn is_full(&self) -> bool {
        self.fill() == SLOT_CAPACITY
    }

    #[inline]
    fn probe_tape(&self, rem: u8, begin: u64, end: u64) -> bool {
        debug_assert!(begin <= end && end <= SLOT_CAPACITY as u64);
        let matches = match_mask(&self.bytes, rem) >> HEADER_BYTES;
        (matches & ((1u64 << end) - 1)) >> begin != 0
    }

    /// Returns true when some slot with quotient `quot` holds `rem`.
    ///
    /// Never reports a false negative for a pair previously stored by
    /// [`PocketDict::add`]. All lookup variants return identical answers;
    /// this delegates to the default one.
    #[inline]
    pub fn find(&self, quot: u8, rem: u8) -> bool {
        self.find_v2(quot, rem)
    }

    /// Lookup using one shared low-half popcount and two 128-bit selects.
    pub fn find_v1(&self, quot: u8, rem: u8) -> bool {
        debug_assert!((quot as usize) < QUOTIENT_RANGE);
        let header = self.header();
        let q = quot as u64;
        let low_pop = (header as u64).count_ones() as u64;
        let begin = if q == 0 {
            0
        } else {
            select128_with_pop(header, q - 1, low_pop) + 1 - q
        };
        let end = select128_with_pop(header, q, low_pop) - q;
        self.probe_tape(rem, begin, end)
    }

    /// Lookup replacing the second select with a trailing-zero count of the
    /// shifted header: the next set bit after the run start is its end.
    pub fn find_v2(&self, quot: u8, rem: u8) -> bool {
        debug_assert!((quot as usize) < QUOTIENT_RANGE);
        let header = self.header();
        let q = quot as u64;
        let mut begin = 0u64;
        if q > 0 {
            let low_pop = (header as u64).count_ones() as u64;
            begin = if q - 1 < low_pop {
                select64(header as u64, q - 1) + 1 - q
            } else {
                64 + select64((header >> 64) as u64, q - 1 - low_pop) + 1 - q
            };
        }
        let end = begin + (header >> (begin + q)).trailing_zeros() as u64;
        self.probe_tape(rem, begin, end)
    }

    /// Lookup branching on which 64-bit half of the header holds each
    /// separator, so every select runs on a single word.
    pub fn find_v3(&self, quot: u8, rem: u8) -> bool {
        debug_assert!((quot as usize) < QUOTIENT_RANGE);
        let header = self.header();
        let low = header as u64;
        let high = (header >> 64) as u64;
        let q = quot as u64;
        let (begin, end);
        if q == 0 {
            begin = 0;
            // The first separator sits within the first 52 header bits.
            end = select64(low, 0);
        } else {
            let low_pop = low.count_ones() as u64;
            if q - 1 >= low_pop {
                begin = 64 + select64(high, q - 1 - low_pop) + 1 - q;
                end = 64 + select64(high, q - low_pop) - q;
            } else {
                begin = select64(low, q - 1) + 1 - q;
                end = if q >= low_pop {
                    64 + select64(high, q - low_pop) - q
                } else {
                    select64(low, q) - q
                };
            }
        }
        self.probe_tape(rem, begin, end)
    }

    /// Branch-free lookup. Bit `i` of `(header << 1) | 1` marks where
    /// quotient `i`'s run begins, so a single select finds the run start
    /// without special-casing quotient 0; the half to search is picked
    /// arithmetically from the low-half popcount.
    pub fn find_v4(&self, quot: u8, rem: u8) -> bool {
        debug_assert!((quot as usize) < QUOTIENT_RANGE);
        let header = self.header();
        let q = quot as u64;
        let boundary = (header << 1) | 1;
        let low_pop = (boundary as u64).count_ones() as u64;
        let in_high = (q >= low_pop) as u64;
        let word = [boundary as u64, (boundary >> 64) as u64][in_high as usize];
        let begin_header = in_high * 64 + select64(word, q - in_high * low_pop);
        let begin = begin_header - q;
        let end = begin + (header >> begin_header).trailing_zeros() as u64;
        self.probe_tape(rem, begin, end)
    }

    /// Like [`PocketDict::find_v4`], with the quotient masked to six bits and
    /// the wrapping select form, dropping the rank range test.
    pub fn find_v5(&self, quot: u8, rem: u8) -> bool {
        debug_assert!((quot as usize) < QUOTIENT_RANGE);
        let header = self.header();
        let q = (quot as u64) & 63;
        let boundary = (header << 1) | 1;
        let low_pop = (boundary as u64).count_ones() as u64;
        let in_high = (q >= low_pop) as u64;
        let word = [boundary as u64, (boundary >> 64) as u64][in_high as usize];
        let begin_header = in_high * 64 + select64_alt(word, q.wrapping_sub(in_high * low_pop));
        let begin = begin_header - q;
        let end = begin + (header >> begin_header).trailing_zeros() as u64;
        self.probe_tape(rem, begin, end)
    }

    /// Stores the pair `(quot, rem)`, keeping the quotient's remainders
    /// sorted. Returns false when all 51 slots are already occupied; the
    /// dictionary is unchanged in that case.
    ///
    /// Adding the same pair twice occupies two slots; lookups are unaffected.
    pub fn add(&mut self, quot: u8, rem: u8) -> bool {
        debug_assert!((quot as usize) < QUOTIENT_RANGE);
        let header = self.header();
        debug_assert_eq!(header.count_ones(), QUOTIENT_RANGE as u32);
        let q = quot as u64;
        let last_separator = select128(header, QUOTIENT_RANGE as u64 - 1);
        let fill = last_separator - (QUOTIENT_RANGE as u64 - 1);
        if fill == SLOT_CAPACITY as u64 {
            return false;
        }

        // Header positions of the quotient's run. Inserting a zero bit at
        // `end` appends one slot to the run and shifts later classes up.
        let begin = if q == 0 { 0 } else { select128(header, q - 1) + 1 };
        let end = select128(header, q);
        debug_assert!(begin <= end && end <= HEADER_BITS as u64);
        let new_header = (header & ((1u128 << end) - 1)) | ((header >> end) << (end + 1));
        debug_assert_eq!(new_header.count_ones(), QUOTIENT_RANGE as u32);
        self.store_header(new_header);

        let begin_slot = (begin - q) as usize;
        let end_slot = (end - q) as usize;
        let mut insert_at = begin_slot;
        while insert_at < end_slot {
            if rem <= self.bytes[HEADER_BYTES + insert_at] {
                break;
            }
            insert_at += 1;
        }
        // The final tape byte is unoccupied whenever fill < 51, so the shift
        // discards nothing that is live.
        self.bytes.copy_within(
            HEADER_BYTES + insert_at..BUCKET_BYTES - 1,
            HEADER_BYTES + insert_at + 1,
        );
        self.bytes[HEADER_BYTES + insert_at] = rem;

        debug_assert!(self.find(quot, rem));
        debug_assert!(self.find_v1(quot, rem));
        debug_assert!(self.find_v3(quot, rem));
        debug_assert!(self.find_v4(quot, rem));
        debug_assert!(self.find_v5(quot, rem));
        true
    }
}

impl Default for PocketDict {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Error returned when construction of the filter fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// The provided configuration values are invalid.
    InvalidConfig(&'static str),
}

/// Configuration options for sizing and building a [`PocketFilter`].
#[derive(Clone, Copy, Debug)]
pub struct FilterConfig {
    /// Average number of keys a bucket is sized to absorb (between 1 and 51).
    /// Lower values leave more headroom against hash skew, higher values
    /// trade saturation risk for space.
    pub keys_per_bucket: usize,
    /// Maximum number of worker threads used by the bulk build (0 = auto).
    pub max_threads: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            keys_per_bucket: DEFAULT_KEYS_PER_BUCKET,
            max_threads: 0,
        }
    }
}

fn validate_config(config: &FilterConfig) -> Result<(), BuildError> {
    if config.keys_per_bucket == 0 || config.keys_per_bucket > SLOT_CAPACITY {
        return Err(BuildError::InvalidConfig(
            "keys_per_bucket must be between 1 and 51",
        ));
    }
    Ok(())
}

/// Output of bulk-building a [`PocketFilter`].
pub struct BuildOutput {
    pub filter: PocketFilter,
    /// Keys whose target bucket was already saturated when they arrived.
    pub rejected_keys: Vec<u64>,
    pub total_bytes: usize,
    pub bytes_per_key: f64,
}

/// An incremental pocket-dictionary filter for 64-bit keys.
///
/// Keys are assumed to be well distributed already; the filter derives the
/// bucket index, quotient and remainder directly from key bits. Reads on a
/// frozen filter are pure functions of the bucket bytes and may be shared
/// across threads; mutation requires exclusive access.
pub struct PocketFilter {
    buckets: Box<[PocketDict]>,
    len: usize,
}

#[inline]
fn bucket_index_for(bucket_count: usize, key: u64) -> usize {
    // Multiplicative range reduction of the low key half, as in Lemire.
    (((key & 0xFFFF_FFFF) * bucket_count as u64) >> 32) as usize
}

#[inline]
fn quot_of(key: u64) -> u8 {
    // Top 24 bits scaled into [0, 50).
    (((key >> 40) * QUOTIENT_RANGE as u64) >> 24) as u8
}

#[inline]
fn rem_of(key: u64) -> u8 {
    (key >> 32) as u8
}

impl PocketFilter {
    /// Creates an empty filter sized for `capacity` keys at the default load
    /// of 45 keys per 51-slot bucket.
    pub fn with_capacity(capacity: usize) -> Result<Self, BuildError> {
        Self::with_config(capacity, &FilterConfig::default())
    }

    /// Creates an empty filter sized for `capacity` keys using the supplied
    /// configuration.
    pub fn with_config(capacity: usize, config: &FilterConfig) -> Result<Self, BuildError> {
        validate_config(config)?;
        let bucket_count = (capacity + config.keys_per_bucket - 1) / config.keys_per_bucket;
        // The bucket mapping multiplies a 32-bit key half by the count.
        if bucket_count as u64 > u32::MAX as u64 {
            return Err(BuildError::InvalidConfig("filter size overflow"));
        }
        Ok(Self {
            buckets: vec![PocketDict::new(); bucket_count].into_boxed_slice(),
            len: 0,
        })
    }

    /// Builds a filter from `keys` with the default configuration.
    pub fn build(keys: &[u64]) -> Result<BuildOutput, BuildError> {
        Self::build_with_config(keys, &FilterConfig::default())
    }

    /// Builds a filter from `keys`, inserting in parallel when the key count
    /// warrants it. Keys arriving at a saturated bucket are reported in
    /// [`BuildOutput::rejected_keys`], preserving insertion order per bucket.
    pub fn build_with_config(
        keys: &[u64],
        config: &FilterConfig,
    ) -> Result<BuildOutput, BuildError> {
        let mut filter = Self::with_config(keys.len(), config)?;
        let bucket_count = filter.buckets.len();

        let workers = if config.max_threads == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.max_threads
        };
        let shard_count = workers.min(bucket_count.max(1));

        let rejected_keys = if shard_count <= 1 || keys.len() < PARALLEL_BUILD_MIN_KEYS {
            let mut rejected = Vec::new();
            for &key in keys {
                if !filter.add(key) {
                    rejected.push(key);
                }
            }
            rejected
        } else {
            // One boundary table drives both the key grouping and the slice
            // splits: shard `s` owns buckets `[bounds[s], bounds[s + 1])` and
            // a key's shard is located in the same table, so every group
            // touches exactly its own slice.
            let mut bounds = Vec::with_capacity(shard_count + 1);
            for shard in 0..=shard_count {
                bounds.push(shard * bucket_count / shard_count);
            }

            let mut groups: Vec<Vec<u64>> = Vec::with_capacity(shard_count);
            groups.resize_with(shard_count, Vec::new);
            for &key in keys {
                let bucket = bucket_index_for(bucket_count, key);
                let shard = bounds.partition_point(|&bound| bound <= bucket) - 1;
                groups[shard].push(key);
            }

            let mut shard_slices: Vec<(usize, &mut [PocketDict])> =
                Vec::with_capacity(shard_count);
            let mut rest: &mut [PocketDict] = &mut filter.buckets;
            for window in bounds.windows(2) {
                let (start, bound) = (window[0], window[1]);
                let taken = std::mem::take(&mut rest);
                let (head, tail) = taken.split_at_mut(bound - start);
                shard_slices.push((start, head));
                rest = tail;
            }
            debug_assert!(rest.is_empty());

            let run = move || -> Vec<(Vec<u64>, usize)> {
                shard_slices
                    .into_par_iter()
                    .zip(groups.into_par_iter())
                    .map(|((base, slice), group)| {
                        let mut rejected = Vec::new();
                        let mut inserted = 0usize;
                        for key in group {
                            let bucket = bucket_index_for(bucket_count, key);
                            if slice[bucket - base].add(quot_of(key), rem_of(key)) {
                                inserted += 1;
                            } else {
                                rejected.push(key);
                            }
                        }
                        (rejected, inserted)
                    })
                    .collect()
            };

            let results = if config.max_threads == 0 {
                run()
            } else {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .build()
                    .map_err(|_| BuildError::InvalidConfig("failed to create thread pool"))?
                    .install(run)
            };

            let mut rejected = Vec::new();
            for (shard_rejected, shard_inserted) in results {
                filter.len += shard_inserted;
                rejected.extend(shard_rejected);
            }
            rejected
        };

        let total_bytes = filter.size_in_bytes();
        let bytes_per_key = if keys.is_empty() {
            0.0
        } else {
            total_bytes as f64 / keys.len() as f64
        };
        Ok(BuildOutput {
            filter,
            rejected_keys,
            total_bytes,
            bytes_per_key,
        })
    }

    #[inline]
    fn bucket_index(&self, key: u64) -> usize {
        bucket_index_for(self.buckets.len(), key)
    }

    /// Inserts `key`. Returns false when the target bucket is saturated, in
    /// which case the filter is unchanged; deciding whether to re-hash, grow
    /// or drop the key is the caller's concern.
    pub fn add(&mut self, key: u64) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        let bucket = self.bucket_index(key);
        let inserted = self.buckets[bucket].add(quot_of(key), rem_of(key));
        self.len += inserted as usize;
        inserted
    }

    /// Returns true when `key` is (probably) in the set.
    /// Returns false when `key` is definitely not in the set.
    pub fn contains(&self, key: u64) -> bool {
        if self.buckets.is_empty() {
            return false;
        }
        self.buckets[self.bucket_index(key)].find(quot_of(key), rem_of(key))
    }

    /// Probes 64 keys and returns a mask whose bit `i` is the
    /// [`PocketFilter::contains`] answer for `keys[i]`.
    ///
    /// All bucket indices are computed first, every target line is prefetched
    /// with a non-temporal hint, and only then are the buckets probed, so the
    /// memory latency of scattered buckets overlaps the index arithmetic.
    pub fn contains_batch_64(&self, keys: &[u64; 64]) -> u64 {
        if self.buckets.is_empty() {
            return 0;
        }
        let mut indices = [0usize; 64];
        for (slot, &key) in indices.iter_mut().zip(keys.iter()) {
            *slot = self.bucket_index(key);
        }
        for &index in &indices {
            prefetch_read(&self.buckets[index]);
        }
        let mut mask = 0u64;
        for (bit, (&key, &index)) in keys.iter().zip(indices.iter()).enumerate() {
            if self.buckets[index].find(quot_of(key), rem_of(key)) {
                mask |= 1u64 << bit;
            }
        }
        mask
    }

    /// 128-key variant of [`PocketFilter::contains_batch_64`], with the
    /// prefetches interleaved into the index pass.
    pub fn contains_batch_128(&self, keys: &[u64; 128]) -> u128 {
        if self.buckets.is_empty() {
            return 0;
        }
        let mut indices = [0usize; 128];
        for (slot, &key) in indices.iter_mut().zip(keys.iter()) {
            let index = self.bucket_index(key);
            prefetch_read(&self.buckets[index]);
            *slot = index;
        }
        let mut mask = 0u128;
        for (bit, (&key, &index)) in keys.iter().zip(indices.iter()).enumerate() {
            if self.buckets[index].find(quot_of(key), rem_of(key)) {
                mask |= 1u128 << bit;
            }
        }
        mask
    }

    /// Number of successfully inserted keys.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when no key has been inserted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of 64-byte buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bytes of bucket storage owned by the filter.
    pub fn size_in_bytes(&self) -> usize {
        self.buckets.len() * BUCKET_BYTES
    }

    /// Returns the bucket array.
    pub fn buckets(&self) -> &[PocketDict] {
        &self.buckets
    }
}

#[cfg(test)]
fn quotient_run(dict: &PocketDict, quot: u8) -> Vec<u8> {
    let header = dict.header();
    let q = quot as u64;
    let begin = if q == 0 {
        0
    } else {
        select128(header, q - 1) + 1 - q
    };
    let end = select128(header, q) - q;
    (begin..end)
        .map(|slot| dict.bytes[HEADER_BYTES + slot as usize])
        .collect()
}

#[cfg(test)]
fn assert_dict_invariants(dict: &PocketDict) {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&dict.bytes[..16]);
    let raw = u128::from_le_bytes(raw);
    assert_eq!(
        (raw & HEADER_MASK).count_ones(),
        QUOTIENT_RANGE as u32,
        "header must keep exactly 50 separators"
    );
    assert_eq!(
        (raw >> HEADER_BITS) & 0b111,
        0,
        "padding bits above the header must stay clear"
    );
    for quot in 0..QUOTIENT_RANGE as u8 {
        let run = quotient_run(dict, quot);
        assert!(
            run.windows(2).all(|pair| pair[0] <= pair[1]),
            "quotient {} run must stay sorted: {:?}",
            quot,
            run
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn mix64(mut z: u64) -> u64 {
        z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    #[test]
    fn empty_dict_finds_nothing() {
        let dict = PocketDict::new();
        assert_eq!(dict.fill(), 0);
        assert!(!dict.is_full());
        for quot in 0..PocketDict::QUOTIENTS as u8 {
            assert!(!dict.find(quot, 0));
            assert!(!dict.find(quot, 0xFF));
        }
        assert_dict_invariants(&dict);
    }

    #[test]
    fn single_insert_single_lookup() {
        let mut dict = PocketDict::new();
        assert!(dict.add(0, 0x7F));
        assert!(dict.find(0, 0x7F));
        assert!(!dict.find(0, 0x80));
        assert!(!dict.find(1, 0x7F));
        // Inserting into quotient 0 shifts every separator up by one.
        assert_eq!(dict.header(), ((1u128 << 50) - 1) << 1);
        assert_eq!(dict.bytes[HEADER_BYTES], 0x7F);
        assert_eq!(dict.fill(), 1);
        assert_dict_invariants(&dict);
    }

    #[test]
    fn same_quotient_sorts_out_of_order_inserts() {
        let mut dict = PocketDict::new();
        assert!(dict.add(5, 0x20));
        assert!(dict.add(5, 0x10));
        assert_eq!(quotient_run(&dict, 5), vec![0x10, 0x20]);
        assert!(dict.find(5, 0x10));
        assert!(dict.find(5, 0x20));
        assert!(!dict.find(5, 0x15));
        assert_dict_invariants(&dict);
    }

    #[test]
    fn fill_to_saturation() {
        let mut dict = PocketDict::new();
        for i in 0..PocketDict::CAPACITY {
            let quot = (i % PocketDict::QUOTIENTS) as u8;
            assert!(dict.add(quot, i as u8), "slot {} should fit", i);
            assert_dict_invariants(&dict);
        }
        assert_eq!(dict.fill(), PocketDict::CAPACITY);
        assert!(dict.is_full());
        assert!(!dict.add(0, 0xAA));
        assert!(!dict.add(49, 0x01));
        assert_eq!(dict.fill(), PocketDict::CAPACITY);
        assert_dict_invariants(&dict);
    }

    #[test]
    fn duplicate_adds_occupy_separate_slots() {
        let mut dict = PocketDict::new();
        let mut stored = 0;
        while dict.add(7, 0x3C) {
            stored += 1;
            assert!(dict.find(7, 0x3C));
        }
        assert_eq!(stored, PocketDict::CAPACITY);
        assert!(dict.find(7, 0x3C));
        assert_eq!(quotient_run(&dict, 7), vec![0x3C; PocketDict::CAPACITY]);
    }

    #[test]
    fn variants_agree_on_every_probe() {
        let mut dict = PocketDict::new();
        for i in 0..40u64 {
            let quot = ((i * 7) % PocketDict::QUOTIENTS as u64) as u8;
            let rem = mix64(i) as u8;
            assert!(dict.add(quot, rem));
        }
        for quot in 0..PocketDict::QUOTIENTS as u8 {
            for rem in 0..=255u8 {
                let expected = dict.find_v1(quot, rem);
                assert_eq!(dict.find_v2(quot, rem), expected, "v2 q={} r={}", quot, rem);
                assert_eq!(dict.find_v3(quot, rem), expected, "v3 q={} r={}", quot, rem);
                assert_eq!(dict.find_v4(quot, rem), expected, "v4 q={} r={}", quot, rem);
                assert_eq!(dict.find_v5(quot, rem), expected, "v5 q={} r={}", quot, rem);
                assert_eq!(dict.find(quot, rem), expected, "default q={} r={}", quot, rem);
            }
        }
    }

    #[test]
    fn match_mask_swar_agrees_with_dispatch() {
        let mut block = [0u8; BUCKET_BYTES];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = mix64(i as u64) as u8;
        }
        for needle in [0u8, 1, 0x7F, 0x80, 0xFF, block[13], block[63]] {
            assert_eq!(
                match_mask_swar(&block, needle),
                match_mask(&block, needle),
                "needle {:#x}",
                needle
            );
        }
    }

    #[test]
    fn select64_matches_fallback() {
        for seed in 0..200u64 {
            let x = mix64(seed);
            for j in 0..x.count_ones() as u64 {
                let position = select64(x, j);
                assert_eq!(position, select64_fallback(x, j));
                assert_eq!(x >> position & 1, 1);
                assert_eq!((x & ((1u64 << position) - 1)).count_ones() as u64, j);
            }
        }
    }

    #[test]
    fn select128_crosses_the_half_boundary() {
        let x = (0xF0u128 << 96) | 0xFF;
        assert_eq!(select128(x, 0), 0);
        assert_eq!(select128(x, 7), 7);
        assert_eq!(select128(x, 8), 100);
        assert_eq!(select128(x, 11), 103);
    }

    #[test]
    fn key_decomposition_stays_in_range() {
        for key in [0u64, u64::MAX, 1 << 40, 0xDEAD_BEEF_CAFE_BABE, 1 << 63] {
            assert!((quot_of(key) as usize) < PocketDict::QUOTIENTS);
        }
        assert_eq!(rem_of(0xAB_0000_0000), 0xAB);
        assert_eq!(quot_of(u64::MAX) as usize, PocketDict::QUOTIENTS - 1);
    }

    #[test]
    fn cross_bucket_isolation() {
        let mut filter = PocketFilter::with_capacity(450).expect("filter should size");
        assert_eq!(filter.bucket_count(), 10);
        let key_a = 0u64; // low half 0 lands in bucket 0
        let key_b = 0xB400_0000u64; // low half maps to bucket 7
        assert_eq!(filter.bucket_index(key_a), 0);
        assert_eq!(filter.bucket_index(key_b), 7);
        assert!(!filter.contains(key_b));
        assert!(filter.add(key_a));
        assert!(filter.contains(key_a));
        assert!(!filter.contains(key_b));
    }

    /// Keys spread over two buckets with distinct remainders, so 64 of them
    /// always fit a capacity-64 filter.
    fn spread_key(i: u64) -> u64 {
        (i << 40) | ((i & 0xFF) << 32) | (i << 26)
    }

    #[test]
    fn batch_64_masks_present_and_absent_keys() {
        let mut filter = PocketFilter::with_capacity(64).expect("filter should size");
        let mut keys = [0u64; 64];
        for (i, key) in keys.iter_mut().enumerate() {
            *key = spread_key(i as u64);
            assert!(filter.add(*key), "key {} should insert", i);
        }
        assert_eq!(filter.contains_batch_64(&keys), u64::MAX);

        keys[17] = 200u64 << 32; // remainder 200 was never inserted
        let mask = filter.contains_batch_64(&keys);
        assert_eq!(mask, u64::MAX ^ (1 << 17));
        for (i, &key) in keys.iter().enumerate() {
            assert_eq!(mask >> i & 1 == 1, filter.contains(key));
        }
    }

    #[test]
    fn batch_128_matches_single_probes() {
        let mut filter = PocketFilter::with_capacity(4096).expect("filter should size");
        let mut keys = [0u64; 128];
        for (i, key) in keys.iter_mut().enumerate() {
            *key = mix64(i as u64 ^ 0xC0FF_EE00);
            if i % 2 == 0 {
                filter.add(*key);
            }
        }
        let mask = filter.contains_batch_128(&keys);
        for (i, &key) in keys.iter().enumerate() {
            assert_eq!(
                mask >> i & 1 == 1,
                filter.contains(key),
                "bit {} diverges from contains",
                i
            );
        }
    }

    #[test]
    fn repeated_adds_never_lose_the_key() {
        let mut filter = PocketFilter::with_capacity(100).expect("filter should size");
        let key = 0x1234_5678_9ABC_DEF0u64;
        let mut successes = 0;
        for _ in 0..60 {
            if filter.add(key) {
                successes += 1;
            }
            assert!(filter.contains(key));
        }
        assert_eq!(successes, PocketDict::CAPACITY);
        assert_eq!(filter.len(), PocketDict::CAPACITY);
    }

    #[test]
    fn saturated_bucket_keeps_rejecting() {
        // All keys share a zero low half, so they hammer bucket 0 with
        // distinct remainders and quotient 0.
        let keys: Vec<u64> = (0..60).map(|i| (i as u64) << 32).collect();
        let mut filter = PocketFilter::with_capacity(keys.len()).expect("filter should size");
        let mut rejected = Vec::new();
        for &key in &keys {
            if !filter.add(key) {
                rejected.push(key);
            }
        }
        assert_eq!(rejected, keys[PocketDict::CAPACITY..].to_vec());
        for &key in &keys[..PocketDict::CAPACITY] {
            assert!(filter.contains(key));
        }
        // Saturation is sticky: the bucket never accepts again.
        assert!(!filter.add(keys[55]));
        assert!(!filter.add(0xFE_0000_0000));
    }

    #[test]
    fn zero_capacity_filter_is_inert() {
        let mut filter = PocketFilter::with_capacity(0).expect("filter should size");
        assert_eq!(filter.bucket_count(), 0);
        assert_eq!(filter.size_in_bytes(), 0);
        assert!(!filter.add(42));
        assert!(!filter.contains(42));
        assert!(filter.is_empty());
        assert_eq!(filter.contains_batch_64(&[7u64; 64]), 0);
        assert_eq!(filter.contains_batch_128(&[7u64; 128]), 0);
    }

    #[test]
    fn config_validation() {
        let zero = FilterConfig {
            keys_per_bucket: 0,
            max_threads: 0,
        };
        assert_eq!(
            PocketFilter::with_config(10, &zero).err(),
            Some(BuildError::InvalidConfig(
                "keys_per_bucket must be between 1 and 51"
            ))
        );
        let oversized = FilterConfig {
            keys_per_bucket: PocketDict::CAPACITY + 1,
            max_threads: 0,
        };
        assert!(PocketFilter::with_config(10, &oversized).is_err());

        let filter = PocketFilter::with_capacity(46).expect("filter should size");
        assert_eq!(filter.bucket_count(), 2);
        assert_eq!(filter.size_in_bytes(), 128);
    }

    #[test]
    fn build_from_empty_key_set() {
        let build = PocketFilter::build(&[]).expect("empty build");
        assert_eq!(build.filter.bucket_count(), 0);
        assert!(build.rejected_keys.is_empty());
        assert_eq!(build.bytes_per_key, 0.0);
        assert!(!build.filter.contains(123));
    }

    #[test]
    fn build_accounts_for_every_key() {
        let keys: Vec<u64> = (0..10_000).map(mix64).collect();
        let build = PocketFilter::build(&keys).expect("filter should build");
        assert_eq!(
            build.filter.len() + build.rejected_keys.len(),
            keys.len(),
            "every key is either stored or reported back"
        );
        let rejected: HashSet<u64> = build.rejected_keys.iter().copied().collect();
        for &key in &keys {
            if !rejected.contains(&key) {
                assert!(build.filter.contains(key), "missing key: {}", key);
            }
        }
        assert_eq!(build.total_bytes, build.filter.size_in_bytes());
    }

    #[test]
    fn parallel_build_matches_sequential() {
        let keys: Vec<u64> = (0..20_000).map(|i| mix64(i ^ 0x5EED)).collect();
        let sequential = PocketFilter::build_with_config(
            &keys,
            &FilterConfig {
                keys_per_bucket: 45,
                max_threads: 1,
            },
        )
        .expect("sequential build");
        let parallel = PocketFilter::build_with_config(
            &keys,
            &FilterConfig {
                keys_per_bucket: 45,
                max_threads: 4,
            },
        )
        .expect("parallel build");

        assert_eq!(sequential.filter.len(), parallel.filter.len());
        let mut sequential_rejected = sequential.rejected_keys.clone();
        let mut parallel_rejected = parallel.rejected_keys.clone();
        sequential_rejected.sort_unstable();
        parallel_rejected.sort_unstable();
        assert_eq!(sequential_rejected, parallel_rejected);
        for &key in &keys {
            assert_eq!(
                sequential.filter.contains(key),
                parallel.filter.contains(key),
                "divergence at key {:#x}",
                key
            );
        }
    }

    #[test]
    fn build_rejects_only_on_saturation() {
        // 60 keys into one bucket: 51 fit, the rest are reported back.
        let keys: Vec<u64> = (0..60).map(|i| (i as u64) << 32).collect();
        let build = PocketFilter::build(&keys).expect("filter should build");
        assert_eq!(build.rejected_keys, keys[PocketDict::CAPACITY..].to_vec());
        assert_eq!(build.filter.len(), PocketDict::CAPACITY);
    }
}
