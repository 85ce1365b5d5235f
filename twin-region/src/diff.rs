//! Byte-level three-way merge of a dirtied page against its twin.
//!
//! `write_page_diffs` stores `local[i]` into `dest[i]` exactly where
//! `local[i] != twin[i]` and leaves every other destination byte alone, so
//! concurrent writers each land their own edits. The x86-64 path works in
//! 128-bit chunks with a masked store; the portable path walks 8-byte words
//! and falls back to per-byte stores only for words that differ. Both are
//! byte-exact.
use crate::PAGE_SIZE;

/// Merge one page: apply every byte of `local` that differs from `twin`
/// onto `dest`.
pub fn write_page_diffs(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    assert_eq!(local.len(), PAGE_SIZE);
    assert_eq!(twin.len(), PAGE_SIZE);
    assert_eq!(dest.len(), PAGE_SIZE);

    #[cfg(target_arch = "x86_64")]
    // Safety: SSE2 is baseline on x86-64; lengths checked above.
    unsafe {
        simd::write_page_diffs(local.as_ptr(), twin.as_ptr(), dest.as_mut_ptr())
    }

    #[cfg(not(target_arch = "x86_64"))]
    scalar_page_diffs(local, twin, dest)
}

/// Portable word-at-a-time rendition; also the oracle for the vector path.
#[cfg_attr(target_arch = "x86_64", allow(dead_code))]
pub(crate) fn scalar_page_diffs(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    const WORD: usize = core::mem::size_of::<u64>();

    for offset in (0..PAGE_SIZE).step_by(WORD) {
        let span = offset..offset + WORD;
        let mine = &local[span.clone()];

        if mine != &twin[span.clone()] {
            commit_word(mine, &twin[span.clone()], &mut dest[span]);
        }
    }
}

fn commit_word(local: &[u8], twin: &[u8], dest: &mut [u8]) {
    for index in 0..local.len() {
        if local[index] != twin[index] {
            dest[index] = local[index];
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod simd {
    use core::arch::x86_64::{
        __m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_maskmoveu_si128, _mm_set1_epi8,
        _mm_xor_si128,
    };

    use crate::PAGE_SIZE;

    /// # Safety
    ///
    /// All three pointers must be valid for [`PAGE_SIZE`] bytes; `dest` for
    /// writes. `local`/`twin` must not overlap `dest`.
    pub(super) unsafe fn write_page_diffs(local: *const u8, twin: *const u8, dest: *mut u8) {
        const CHUNK: usize = core::mem::size_of::<__m128i>();
        let allones = _mm_set1_epi8(-1);

        for index in 0..PAGE_SIZE / CHUNK {
            let local_chunk = _mm_loadu_si128(local.add(index * CHUNK) as *const __m128i);
            let twin_chunk = _mm_loadu_si128(twin.add(index * CHUNK) as *const __m128i);

            // Compare bytewise, then invert: the mask selects differing
            // bytes for the masked store.
            let eq_chunk = _mm_cmpeq_epi8(local_chunk, twin_chunk);
            let neq_chunk = _mm_xor_si128(allones, eq_chunk);

            _mm_maskmoveu_si128(local_chunk, neq_chunk, dest.add(index * CHUNK) as *mut i8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    #[test]
    fn untouched_bytes_stay() {
        let twin = page(0);
        let mut local = page(0);
        local[100] = 7;
        local[4095] = 9;

        // Destination already carries another writer's edit at 3000.
        let mut dest = page(0);
        dest[3000] = 0xee;

        write_page_diffs(&local, &twin, &mut dest);

        assert_eq!(dest[100], 7);
        assert_eq!(dest[4095], 9);
        assert_eq!(dest[3000], 0xee);
        assert_eq!(dest[0], 0);
    }

    #[test]
    fn equal_pages_write_nothing() {
        let twin = page(0x5a);
        let local = page(0x5a);
        let mut dest = page(0x11);

        write_page_diffs(&local, &twin, &mut dest);
        assert_eq!(dest, page(0x11));
    }

    proptest! {
        #[test]
        fn merge_applies_exactly_the_differing_bytes(
            twin in proptest::collection::vec(any::<u8>(), PAGE_SIZE),
            edits in proptest::collection::btree_map(0..PAGE_SIZE, any::<u8>(), 0..64),
            dest_fill in any::<u8>(),
        ) {
            let mut local = twin.clone();
            for (&offset, &byte) in &edits {
                local[offset] = byte;
            }

            let mut dest = vec![dest_fill; PAGE_SIZE];
            let before = dest.clone();
            write_page_diffs(&local, &twin, &mut dest);

            for offset in 0..PAGE_SIZE {
                if local[offset] != twin[offset] {
                    prop_assert_eq!(dest[offset], local[offset]);
                } else {
                    prop_assert_eq!(dest[offset], before[offset]);
                }
            }
        }

        #[cfg(target_arch = "x86_64")]
        #[test]
        fn vector_path_matches_scalar(
            twin in proptest::collection::vec(any::<u8>(), PAGE_SIZE),
            local in proptest::collection::vec(any::<u8>(), PAGE_SIZE),
        ) {
            let mut via_simd = vec![0xcd; PAGE_SIZE];
            let mut via_scalar = vec![0xcd; PAGE_SIZE];

            write_page_diffs(&local, &twin, &mut via_simd);
            scalar_page_diffs(&local, &twin, &mut via_scalar);

            prop_assert_eq!(via_simd, via_scalar);
        }
    }

    #[test]
    fn disjoint_writers_both_land() {
        let twin = page(0);

        let mut writer_a = twin.clone();
        writer_a[100..104].copy_from_slice(&[1, 2, 3, 4]);

        let mut writer_b = twin.clone();
        writer_b[3000..3004].copy_from_slice(&[5, 6, 7, 8]);

        let mut persistent = twin.clone();
        write_page_diffs(&writer_a, &twin, &mut persistent);
        write_page_diffs(&writer_b, &twin, &mut persistent);

        assert_eq!(&persistent[100..104], &[1, 2, 3, 4]);
        assert_eq!(&persistent[3000..3004], &[5, 6, 7, 8]);
    }
}
