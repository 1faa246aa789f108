//! Pure-math K-of-N erasure coding over GF(2⁸): Cauchy encode matrix,
//! fragment-wise encode, and reconstruction of missing data fragments given
//! any K of the N fragments in a stripe. No I/O, no knowledge of peers or
//! placement; `ec-engine` is the only caller.

mod gf;
mod matrix;

use std::collections::HashSet;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected} data fragments, got {got}")]
    WrongFragmentCount { expected: usize, got: usize },

    #[error("fragment length {got} does not match configured fragment_bytes {expected}")]
    WrongFragmentLength { expected: usize, got: usize },

    #[error("decode requires exactly K={k} present ids, got {got}")]
    WrongPresentIdCount { k: usize, got: usize },

    #[error("present ids must be distinct and within [0, N); duplicate or out-of-range id {0}")]
    InvalidPresentId(usize),

    #[error("present ids are linearly dependent; cannot invert the decode matrix")]
    SingularDecodeMatrix,
}

/// A constructed K-of-N Cauchy code over GF(2⁸) for a fixed fragment size.
/// Stateless beyond the encode matrix, which is derived purely from `(k, p)`
/// and cached so every encode/decode call doesn't regenerate it.
#[derive(Debug, Clone)]
pub struct Codec {
    k: usize,
    p: usize,
    fragment_bytes: usize,
    // N x K encode matrix: rows 0..k are the identity, rows k..n are the
    // Cauchy parity generators.
    encode_matrix: Vec<u8>,
}

impl Codec {
    pub fn new(k: usize, p: usize, fragment_bytes: usize) -> Self {
        let n = k + p;
        Self {
            k,
            p,
            fragment_bytes,
            encode_matrix: matrix::gen_cauchy_matrix(n, k),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn p(&self) -> usize {
        self.p
    }

    pub fn n(&self) -> usize {
        self.k + self.p
    }

    fn validate_fragments(&self, data: &[&[u8]]) -> Result<(), CodecError> {
        if data.len() != self.k {
            return Err(CodecError::WrongFragmentCount {
                expected: self.k,
                got: data.len(),
            });
        }
        for fragment in data {
            if fragment.len() != self.fragment_bytes {
                return Err(CodecError::WrongFragmentLength {
                    expected: self.fragment_bytes,
                    got: fragment.len(),
                });
            }
        }
        Ok(())
    }

    /// Compute the `P` parity fragments for `K` data fragments.
    pub fn encode_parity(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, CodecError> {
        self.validate_fragments(data)?;

        let mut parity: Vec<Vec<u8>> = (0..self.p).map(|_| vec![0u8; self.fragment_bytes]).collect();
        let parity_rows = &self.encode_matrix[self.k * self.k..];

        let mut output_refs: Vec<&mut [u8]> = parity.iter_mut().map(|v| v.as_mut_slice()).collect();
        matrix::encode_data(parity_rows, self.p, self.k, data, &mut output_refs);

        Ok(parity)
    }

    /// Reconstruct the data fragments missing from `present_ids` (a
    /// condition: exactly `K` ids, each `< N`, each distinct). `fragments`
    /// has `N` slots; the ones named by `present_ids` must already be
    /// `Some` and hold the fetched bytes (data or parity). On success, any
    /// slot `< K` not in `present_ids` is filled in with the reconstructed
    /// fragment. Parity slots that are missing are left untouched; the
    /// engine never needs to regenerate parity on read.
    pub fn decode(&self, present_ids: &[usize], fragments: &mut [Option<Vec<u8>>]) -> Result<(), CodecError> {
        if present_ids.len() != self.k {
            return Err(CodecError::WrongPresentIdCount {
                k: self.k,
                got: present_ids.len(),
            });
        }

        let mut seen = HashSet::with_capacity(self.k);
        for &id in present_ids {
            if id >= self.n() || !seen.insert(id) {
                return Err(CodecError::InvalidPresentId(id));
            }
        }

        let missing_data_ids: Vec<usize> = (0..self.k).filter(|id| !present_ids.contains(id)).collect();
        if missing_data_ids.is_empty() {
            return Ok(());
        }

        // B = rows `present_ids` of the encode matrix, a K x K submatrix.
        let mut b = vec![0u8; self.k * self.k];
        for (row, &id) in present_ids.iter().enumerate() {
            b[row * self.k..(row + 1) * self.k]
                .copy_from_slice(&self.encode_matrix[id * self.k..(id + 1) * self.k]);
        }

        let b_inv = matrix::invert_matrix(&b, self.k).ok_or(CodecError::SingularDecodeMatrix)?;

        // Decode matrix: rows of B^-1 selected by the missing data ids.
        let errs = missing_data_ids.len();
        let mut decode_matrix = vec![0u8; errs * self.k];
        for (row, &missing_id) in missing_data_ids.iter().enumerate() {
            decode_matrix[row * self.k..(row + 1) * self.k]
                .copy_from_slice(&b_inv[missing_id * self.k..(missing_id + 1) * self.k]);
        }

        let present_fragments: Vec<&[u8]> = present_ids
            .iter()
            .map(|&id| {
                fragments[id]
                    .as_deref()
                    .expect("present_ids entry must already be populated")
            })
            .collect();

        let mut recovered: Vec<Vec<u8>> = (0..errs).map(|_| vec![0u8; self.fragment_bytes]).collect();
        {
            let mut output_refs: Vec<&mut [u8]> = recovered.iter_mut().map(|v| v.as_mut_slice()).collect();
            matrix::encode_data(&decode_matrix, errs, self.k, &present_fragments, &mut output_refs);
        }

        for (missing_id, fragment) in missing_data_ids.into_iter().zip(recovered.into_iter()) {
            fragments[missing_id] = Some(fragment);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_data(k: usize, len: usize, seed: u8) -> Vec<Vec<u8>> {
        (0..k)
            .map(|i| (0..len).map(|b| ((b as u8).wrapping_mul(seed)).wrapping_add(i as u8)).collect())
            .collect()
    }

    #[test]
    fn encode_then_full_decode_is_a_noop() {
        let codec = Codec::new(2, 1, 8);
        let data = sample_data(2, 8, 7);
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let parity = codec.encode_parity(&refs).unwrap();
        assert_eq!(parity.len(), 1);

        let mut fragments: Vec<Option<Vec<u8>>> = vec![Some(data[0].clone()), Some(data[1].clone()), Some(parity[0].clone())];
        codec.decode(&[0, 1], &mut fragments).unwrap();
        assert_eq!(fragments[0].as_ref().unwrap(), &data[0]);
        assert_eq!(fragments[1].as_ref().unwrap(), &data[1]);
    }

    #[test]
    fn reconstructs_single_missing_data_fragment_from_parity() {
        let codec = Codec::new(2, 1, 16);
        let data = sample_data(2, 16, 3);
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let parity = codec.encode_parity(&refs).unwrap();

        // fragment 0 ("data[0]") is missing; present = {1 (data), 2 (parity)}
        let mut fragments: Vec<Option<Vec<u8>>> = vec![None, Some(data[1].clone()), Some(parity[0].clone())];
        codec.decode(&[1, 2], &mut fragments).unwrap();
        assert_eq!(fragments[0].as_ref().unwrap(), &data[0]);
    }

    #[test]
    fn reconstructs_both_data_fragments_when_only_parities_present() {
        // K=2, P=2: losing both data fragments but keeping both parities
        // should still recover exactly, since any 2-of-4 rows are linearly
        // independent in a Cauchy matrix.
        let codec = Codec::new(2, 2, 16);
        let data = sample_data(2, 16, 11);
        let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
        let parity = codec.encode_parity(&refs).unwrap();

        let mut fragments: Vec<Option<Vec<u8>>> = vec![None, None, Some(parity[0].clone()), Some(parity[1].clone())];
        codec.decode(&[2, 3], &mut fragments).unwrap();
        assert_eq!(fragments[0].as_ref().unwrap(), &data[0]);
        assert_eq!(fragments[1].as_ref().unwrap(), &data[1]);
    }

    #[test]
    fn rejects_wrong_present_id_count() {
        let codec = Codec::new(2, 1, 4);
        let mut fragments: Vec<Option<Vec<u8>>> = vec![Some(vec![0; 4]), None, None];
        let err = codec.decode(&[0], &mut fragments).unwrap_err();
        assert_eq!(err, CodecError::WrongPresentIdCount { k: 2, got: 1 });
    }

    #[test]
    fn rejects_duplicate_present_ids() {
        let codec = Codec::new(2, 1, 4);
        let mut fragments: Vec<Option<Vec<u8>>> = vec![Some(vec![0; 4]), None, None];
        let err = codec.decode(&[0, 0], &mut fragments).unwrap_err();
        assert_eq!(err, CodecError::InvalidPresentId(0));
    }

    proptest! {
        #[test]
        fn round_trip_any_k_of_n_for_random_payloads(
            seed in any::<u8>(),
            drop_count in 0usize..=1,
        ) {
            // K=3, P=1 keeps this fast while still exercising multiple present-id subsets.
            let codec = Codec::new(3, 1, 32);
            let data = sample_data(3, 32, seed);
            let refs: Vec<&[u8]> = data.iter().map(|v| v.as_slice()).collect();
            let parity = codec.encode_parity(&refs).unwrap();

            let all: Vec<Vec<u8>> = data.iter().cloned().chain(parity.iter().cloned()).collect();

            // drop up to `drop_count` of the data fragments (P=1 tolerates at most 1 loss)
            let mut fragments: Vec<Option<Vec<u8>>> = all.iter().cloned().map(Some).collect();
            let mut present_ids: Vec<usize> = (0..4).collect();
            for i in 0..drop_count {
                fragments[i] = None;
                present_ids.retain(|&id| id != i);
            }
            // present_ids must have exactly K=3 entries
            present_ids.truncate(3);

            codec.decode(&present_ids, &mut fragments).unwrap();
            for i in 0..3 {
                prop_assert_eq!(fragments[i].as_ref().unwrap(), &data[i]);
            }
        }
    }
}
