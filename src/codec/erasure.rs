//! Erasure Coding using Reed-Solomon
//!
//! Splits data into `data_shards + parity_shards` fragments where any
//! `data_shards` of them reconstruct the input. Padding is recorded in the
//! [`FragmentLayout`] so decoding strips it deterministically.

use super::CodecError;
use crate::crypto::ContentHash;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Largest fragment set GF(2^8) Reed-Solomon can address
const MAX_TOTAL_SHARDS: usize = 256;

/// Configuration for erasure coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (`frag_count`)
    pub data_shards: usize,

    /// Number of parity shards (`parity_count`)
    pub parity_shards: usize,
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Self {
        Self {
            data_shards,
            parity_shards,
        }
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Maximum shards that can be lost
    pub fn max_losses(&self) -> usize {
        self.parity_shards
    }

    /// Overhead factor (total / data)
    pub fn overhead(&self) -> f32 {
        self.total_shards() as f32 / self.data_shards as f32
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.data_shards == 0 {
            return Err(CodecError::InvalidConfig("frag_count must be at least 1".into()));
        }
        if self.total_shards() > MAX_TOTAL_SHARDS {
            return Err(CodecError::InvalidConfig(format!(
                "frag_count + parity_count must not exceed {}, got {}",
                MAX_TOTAL_SHARDS,
                self.total_shards()
            )));
        }
        Ok(())
    }
}

impl Default for ErasureConfig {
    fn default() -> Self {
        // 4 data + 2 parity: survives any two lost fragments at 1.5x overhead
        Self {
            data_shards: 4,
            parity_shards: 2,
        }
    }
}

/// Everything needed to turn a fragment set back into the original bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentLayout {
    pub config: ErasureConfig,

    /// Size of every fragment, padding included
    pub shard_size: usize,

    /// Byte count before padding
    pub original_size: u64,

    /// Hash of the original bytes
    pub checksum: ContentHash,
}

impl FragmentLayout {
    pub fn is_parity(&self, index: usize) -> bool {
        index >= self.config.data_shards
    }
}

/// A single fragment together with the checksum it is expected to have
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Fragment index (0 to total_shards - 1)
    pub index: usize,

    pub data: Vec<u8>,

    /// Recorded checksum; for fragments read back from storage this is the
    /// value from metadata, not a hash of `data`
    pub checksum: ContentHash,
}

impl Fragment {
    /// Build a fragment whose recorded checksum is the hash of its data
    pub fn new(index: usize, data: Vec<u8>) -> Self {
        let checksum = ContentHash::hash(&data);
        Self {
            index,
            data,
            checksum,
        }
    }

    /// Build a fragment read back from storage, checked against `recorded`
    pub fn with_recorded_checksum(index: usize, data: Vec<u8>, recorded: ContentHash) -> Self {
        Self {
            index,
            data,
            checksum: recorded,
        }
    }

    pub fn is_intact(&self) -> bool {
        self.checksum.verify(&self.data)
    }
}

/// Output of encoding one file version
#[derive(Debug, Clone)]
pub struct EncodedVersion {
    pub layout: FragmentLayout,
    pub fragments: Vec<Fragment>,
}

/// Stateless Reed-Solomon encoder/decoder for one erasure configuration
pub struct FragmentCodec {
    config: ErasureConfig,
    // `None` when there is no parity: fragments are plain stripes
    rs: Option<ReedSolomon>,
}

impl FragmentCodec {
    pub fn new(config: ErasureConfig) -> Result<Self, CodecError> {
        config.validate()?;

        let rs = if config.parity_shards > 0 {
            Some(
                ReedSolomon::new(config.data_shards, config.parity_shards)
                    .map_err(|e| CodecError::ErasureCoding(e.to_string()))?,
            )
        } else {
            None
        };

        Ok(Self { config, rs })
    }

    pub fn config(&self) -> ErasureConfig {
        self.config
    }

    /// Encode data into `total_shards` fragments
    pub fn encode(&self, data: &[u8]) -> Result<EncodedVersion, CodecError> {
        let shard_size = self.shard_size_for(data.len());
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.config.total_shards());

        for i in 0..self.config.data_shards {
            let start = (i * shard_size).min(data.len());
            let end = (start + shard_size).min(data.len());

            let mut shard = data[start..end].to_vec();
            shard.resize(shard_size, 0);
            shards.push(shard);
        }

        for _ in 0..self.config.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        if let Some(rs) = &self.rs {
            rs.encode(&mut shards)
                .map_err(|e| CodecError::ErasureCoding(e.to_string()))?;
        }

        let layout = FragmentLayout {
            config: self.config,
            shard_size,
            original_size: data.len() as u64,
            checksum: ContentHash::hash(data),
        };

        let fragments = shards
            .into_iter()
            .enumerate()
            .map(|(index, data)| Fragment::new(index, data))
            .collect();

        Ok(EncodedVersion { layout, fragments })
    }

    /// Decode a set of fragments back to the original bytes
    ///
    /// Fragments may arrive in any order and any subset; ones whose content
    /// does not match their recorded checksum are ignored.
    pub fn decode(&self, layout: &FragmentLayout, fragments: Vec<Fragment>) -> Result<Vec<u8>, CodecError> {
        self.check_layout(layout)?;
        let mut slots = self.collect_usable(layout, fragments)?;

        if let Some(rs) = &self.rs {
            rs.reconstruct_data(&mut slots)
                .map_err(|e| CodecError::ErasureCoding(e.to_string()))?;
        }

        let mut result = Vec::with_capacity(layout.shard_size * self.config.data_shards);
        for slot in slots.iter().take(self.config.data_shards) {
            match slot {
                Some(shard) => result.extend_from_slice(shard),
                None => return Err(CodecError::ErasureCoding("Reconstruction failed".into())),
            }
        }

        result.truncate(layout.original_size as usize);

        if !layout.checksum.verify(&result) {
            return Err(CodecError::ChecksumMismatch(
                "reconstructed content does not match recorded checksum".into(),
            ));
        }

        Ok(result)
    }

    /// Regenerate the complete fragment set from any sufficient subset
    pub fn reconstruct(&self, layout: &FragmentLayout, fragments: Vec<Fragment>) -> Result<Vec<Fragment>, CodecError> {
        self.check_layout(layout)?;
        let mut slots = self.collect_usable(layout, fragments)?;

        if let Some(rs) = &self.rs {
            rs.reconstruct(&mut slots)
                .map_err(|e| CodecError::ErasureCoding(e.to_string()))?;
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.map(|data| Fragment::new(index, data))
                    .ok_or_else(|| CodecError::ErasureCoding(format!("fragment {} was not rebuilt", index)))
            })
            .collect()
    }

    fn shard_size_for(&self, data_len: usize) -> usize {
        ((data_len + self.config.data_shards - 1) / self.config.data_shards).max(1)
    }

    fn check_layout(&self, layout: &FragmentLayout) -> Result<(), CodecError> {
        if layout.config != self.config {
            return Err(CodecError::InvalidConfig(format!(
                "layout uses {}+{}, codec is {}+{}",
                layout.config.data_shards,
                layout.config.parity_shards,
                self.config.data_shards,
                self.config.parity_shards
            )));
        }
        Ok(())
    }

    /// Place verified fragments into their slots, enforcing the `data_shards` minimum
    fn collect_usable(
        &self,
        layout: &FragmentLayout,
        fragments: Vec<Fragment>,
    ) -> Result<Vec<Option<Vec<u8>>>, CodecError> {
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.config.total_shards()];
        let mut rejected = 0usize;

        for fragment in fragments {
            if fragment.index >= slots.len() || slots[fragment.index].is_some() {
                continue;
            }
            if fragment.data.len() != layout.shard_size || !fragment.is_intact() {
                debug!(index = fragment.index, "Dropping fragment that failed verification");
                rejected += 1;
                continue;
            }
            slots[fragment.index] = Some(fragment.data);
        }

        let have = slots.iter().filter(|s| s.is_some()).count();
        let need = self.config.data_shards;
        if have < need {
            if rejected > 0 {
                return Err(CodecError::ChecksumMismatch(format!(
                    "{} fragment(s) failed verification; {} usable, {} needed",
                    rejected, have, need
                )));
            }
            return Err(CodecError::InsufficientFragments { have, need });
        }

        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_erasure_config() {
        let config = ErasureConfig::default();

        assert_eq!(config.total_shards(), 6);
        assert_eq!(config.max_losses(), 2);
        assert!((config.overhead() - 1.5).abs() < f32::EPSILON);
        assert!(ErasureConfig::new(0, 2).validate().is_err());
        assert!(ErasureConfig::new(200, 57).validate().is_err());
    }

    #[test]
    fn test_encode_decode_no_loss() {
        let codec = FragmentCodec::new(ErasureConfig::new(4, 2)).unwrap();
        let original = b"Tessera keeps every byte, even the odd-sized tail.";

        let encoded = codec.encode(original).unwrap();
        assert_eq!(encoded.fragments.len(), 6);
        assert_eq!(
            encoded.fragments.iter().filter(|f| encoded.layout.is_parity(f.index)).count(),
            2
        );

        let decoded = codec.decode(&encoded.layout, encoded.fragments).unwrap();
        assert_eq!(decoded, original.to_vec());
    }

    #[test]
    fn test_any_parity_count_losses_are_tolerated() {
        let codec = FragmentCodec::new(ErasureConfig::new(4, 2)).unwrap();
        let original = sample(10_007);
        let encoded = codec.encode(&original).unwrap();

        for a in 0..6 {
            for b in (a + 1)..6 {
                let subset: Vec<Fragment> = encoded
                    .fragments
                    .iter()
                    .filter(|f| f.index != a && f.index != b)
                    .cloned()
                    .collect();
                let decoded = codec.decode(&encoded.layout, subset).unwrap();
                assert_eq!(decoded, original, "lost fragments {} and {}", a, b);
            }
        }
    }

    #[test]
    fn test_too_many_losses() {
        let codec = FragmentCodec::new(ErasureConfig::new(4, 2)).unwrap();
        let encoded = codec.encode(b"Hello, Tessera!").unwrap();

        let subset: Vec<Fragment> = encoded.fragments.into_iter().skip(3).collect();
        let result = codec.decode(&encoded.layout, subset);

        assert_eq!(
            result,
            Err(CodecError::InsufficientFragments { have: 3, need: 4 })
        );
    }

    #[test]
    fn test_corrupt_fragment_is_treated_as_absent() {
        let codec = FragmentCodec::new(ErasureConfig::new(4, 2)).unwrap();
        let original = sample(4096);
        let encoded = codec.encode(&original).unwrap();

        let mut fragments = encoded.fragments.clone();
        fragments[1].data[0] ^= 0xff;

        // One bad fragment out of six still leaves five usable
        let decoded = codec.decode(&encoded.layout, fragments.clone()).unwrap();
        assert_eq!(decoded, original);

        // With two more missing, only three good ones remain
        fragments.truncate(4);
        let result = codec.decode(&encoded.layout, fragments);
        assert!(matches!(result, Err(CodecError::ChecksumMismatch(_))));
    }

    #[test]
    fn test_reconstruct_regenerates_missing_fragments() {
        let codec = FragmentCodec::new(ErasureConfig::new(3, 2)).unwrap();
        let encoded = codec.encode(&sample(999)).unwrap();

        let survivors: Vec<Fragment> = encoded
            .fragments
            .iter()
            .filter(|f| f.index != 0 && f.index != 4)
            .cloned()
            .collect();
        let rebuilt = codec.reconstruct(&encoded.layout, survivors).unwrap();

        assert_eq!(rebuilt, encoded.fragments);
    }

    #[test]
    fn test_zero_parity_and_empty_input() {
        let codec = FragmentCodec::new(ErasureConfig::new(3, 0)).unwrap();

        let encoded = codec.encode(b"").unwrap();
        assert_eq!(encoded.layout.shard_size, 1);
        assert_eq!(codec.decode(&encoded.layout, encoded.fragments.clone()).unwrap(), Vec::<u8>::new());

        let encoded = codec.encode(b"striped only").unwrap();
        let missing_one: Vec<Fragment> = encoded.fragments.iter().skip(1).cloned().collect();
        assert!(matches!(
            codec.decode(&encoded.layout, missing_one),
            Err(CodecError::InsufficientFragments { have: 2, need: 3 })
        ));
    }

    #[test]
    fn test_layout_mismatch_is_rejected() {
        let codec = FragmentCodec::new(ErasureConfig::new(4, 2)).unwrap();
        let other = FragmentCodec::new(ErasureConfig::new(2, 1)).unwrap();
        let encoded = codec.encode(b"data").unwrap();

        assert!(matches!(
            other.decode(&encoded.layout, encoded.fragments),
            Err(CodecError::InvalidConfig(_))
        ));
    }
}
