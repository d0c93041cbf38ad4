// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Computing page digests over signable content.

use crate::embedded_signature::DigestKind;

/// Digest a byte range in page-sized chunks.
///
/// The final chunk may be short; it is hashed as-is without padding. The
/// number of digests returned is `ceil(data.len() / page_size)`.
pub fn compute_paged_digests(kind: DigestKind, data: &[u8], page_size: usize) -> Vec<Vec<u8>> {
    data.chunks(page_size)
        .map(|chunk| kind.digest_data(chunk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_matches_ceiling() {
        let data = vec![0x42u8; 4096 * 3 + 17];
        let digests = compute_paged_digests(DigestKind::Sha256, &data, 4096);
        assert_eq!(digests.len(), 4);
        assert!(digests.iter().all(|d| d.len() == 32));

        let exact = vec![0x42u8; 4096 * 2];
        assert_eq!(
            compute_paged_digests(DigestKind::Sha256, &exact, 4096).len(),
            2
        );
    }

    #[test]
    fn short_tail_hashed_without_padding() {
        let data = vec![1u8; 4100];
        let digests = compute_paged_digests(DigestKind::Sha256, &data, 4096);
        assert_eq!(digests[1], DigestKind::Sha256.digest_data(&[1u8; 4]));
    }

    #[test]
    fn digests_are_deterministic() {
        let data = vec![7u8; 10000];
        assert_eq!(
            compute_paged_digests(DigestKind::Sha256, &data, 4096),
            compute_paged_digests(DigestKind::Sha256, &data, 4096)
        );
    }
}
