//! Digests, byte histograms and entropy over device ranges.
//!
//! All functions read the range in chunks, poll the optional
//! [`ProgressToken`] once per chunk and return `None` when it is stopped.

use crate::error::EngineError;
use crate::io::Device;
use crate::progress::ProgressToken;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Read chunk for analysis passes.
const CHUNK: usize = 0x10_0000;

/// Entropy above which data is considered packed or encrypted.
pub const ENTROPY_THRESHOLD: f64 = 6.5;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    /// MD5
    Md5,
    /// SHA-1
    Sha1,
    /// SHA-224
    Sha224,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashKind {
    /// Every supported algorithm.
    pub const ALL: [HashKind; 6] = [
        HashKind::Md5,
        HashKind::Sha1,
        HashKind::Sha224,
        HashKind::Sha256,
        HashKind::Sha384,
        HashKind::Sha512,
    ];

    /// Lower-case algorithm name.
    pub fn name(self) -> &'static str {
        match self {
            HashKind::Md5 => "md5",
            HashKind::Sha1 => "sha1",
            HashKind::Sha224 => "sha224",
            HashKind::Sha256 => "sha256",
            HashKind::Sha384 => "sha384",
            HashKind::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "");
        HashKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| EngineError::invalid_format("hash", format!("unknown algorithm '{s}'")))
    }
}

/// Feed every byte of `regions` to `sink`, chunk by chunk.
///
/// Returns `false` if the token was stopped before the end.
fn for_each_chunk(
    device: &mut Device<'_>,
    regions: &[(u64, Option<u64>)],
    token: Option<&ProgressToken>,
    status: &str,
    mut sink: impl FnMut(&[u8]),
) -> bool {
    let ranges: Vec<(u64, u64)> = regions
        .iter()
        .map(|&(offset, size)| device.clamp_range(offset, size))
        .collect();
    let total: u64 = ranges.iter().map(|&(_, len)| len).sum();
    let slot = token.map(|t| t.acquire(total));
    if let Some(slot) = &slot {
        slot.set_status(status);
    }

    let mut buf = vec![0u8; CHUNK];
    for (start, len) in ranges {
        let end = start + len;
        let mut pos = start;
        while pos < end {
            if token.map_or(false, ProgressToken::is_stopped) {
                tracing::debug!(offset = pos, status, "analysis cancelled");
                return false;
            }
            let want = usize::try_from(end - pos).unwrap_or(usize::MAX).min(buf.len());
            let n = device.read_into(pos, &mut buf[..want]);
            if n == 0 {
                break;
            }
            sink(&buf[..n]);
            pos += n as u64;
            if let Some(slot) = &slot {
                slot.increment(n as u64);
            }
        }
    }
    true
}

fn digest_regions<D: Digest>(
    device: &mut Device<'_>,
    regions: &[(u64, Option<u64>)],
    token: Option<&ProgressToken>,
) -> Option<String> {
    let mut hasher = D::new();
    let done = for_each_chunk(device, regions, token, "hash", |chunk| hasher.update(chunk));
    done.then(|| hex::encode(hasher.finalize()))
}

/// Digest of `[offset, offset + size)` as lower-case hex.
///
/// `size = None` hashes to the end. Returns `None` if cancelled.
pub fn hash(
    device: &mut Device<'_>,
    kind: HashKind,
    offset: u64,
    size: Option<u64>,
    token: Option<&ProgressToken>,
) -> Option<String> {
    hash_regions(device, kind, &[(offset, size)], token)
}

/// Digest of several regions hashed back to back.
pub fn hash_regions(
    device: &mut Device<'_>,
    kind: HashKind,
    regions: &[(u64, Option<u64>)],
    token: Option<&ProgressToken>,
) -> Option<String> {
    match kind {
        HashKind::Md5 => digest_regions::<Md5>(device, regions, token),
        HashKind::Sha1 => digest_regions::<Sha1>(device, regions, token),
        HashKind::Sha224 => digest_regions::<Sha224>(device, regions, token),
        HashKind::Sha256 => digest_regions::<Sha256>(device, regions, token),
        HashKind::Sha384 => digest_regions::<Sha384>(device, regions, token),
        HashKind::Sha512 => digest_regions::<Sha512>(device, regions, token),
    }
}

/// Histogram of byte values in a range.
pub fn byte_counts(
    device: &mut Device<'_>,
    offset: u64,
    size: Option<u64>,
    token: Option<&ProgressToken>,
) -> Option<[u64; 256]> {
    let mut counts = [0u64; 256];
    let done = for_each_chunk(device, &[(offset, size)], token, "byte counts", |chunk| {
        for &b in chunk {
            counts[b as usize] += 1;
        }
    });
    done.then_some(counts)
}

/// Shannon entropy of a histogram, in bits per byte.
pub fn entropy_of_counts(counts: &[u64; 256]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    let bits: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();
    bits.clamp(0.0, 8.0)
}

/// Shannon entropy of a range, in `[0, 8]`. `None` if cancelled.
pub fn entropy(
    device: &mut Device<'_>,
    offset: u64,
    size: Option<u64>,
    token: Option<&ProgressToken>,
) -> Option<f64> {
    byte_counts(device, offset, size, token).map(|counts| entropy_of_counts(&counts))
}

/// Whether an entropy value suggests packed or encrypted data.
pub fn is_packed(entropy: f64) -> bool {
    entropy > ENTROPY_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_zero() {
        for len in [0usize, 1, 17, 4096] {
            let mut data = vec![0u8; len];
            let mut dev = Device::new(&mut data);
            assert_eq!(entropy(&mut dev, 0, None, None), Some(0.0));
        }
    }

    #[test]
    fn test_entropy_uniform() {
        let mut data: Vec<u8> = (0..=255u8).collect();
        let mut dev = Device::new(&mut data);
        let e = entropy(&mut dev, 0, None, None).unwrap();
        assert_eq!(e, 8.0);
        assert!(is_packed(e));
        assert!(!is_packed(ENTROPY_THRESHOLD));
    }

    #[test]
    fn test_entropy_two_values() {
        let mut data = [0u8, 1].repeat(64);
        let mut dev = Device::new(&mut data);
        let e = entropy(&mut dev, 0, None, None).unwrap();
        assert!((e - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_known_digests() {
        let mut src: &[u8] = b"abc";
        let mut dev = Device::new(&mut src);
        assert_eq!(
            hash(&mut dev, HashKind::Md5, 0, None, None).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hash(&mut dev, HashKind::Sha1, 0, None, None).unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hash(&mut dev, HashKind::Sha256, 0, None, None).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        for kind in HashKind::ALL {
            assert!(hash(&mut dev, kind, 0, None, None).is_some(), "{kind}");
        }
    }

    #[test]
    fn test_hash_regions_concatenate() {
        let mut src: &[u8] = b"a--bc";
        let mut dev = Device::new(&mut src);
        let split = hash_regions(&mut dev, HashKind::Md5, &[(0, Some(1)), (3, None)], None);
        assert_eq!(split.as_deref(), Some("900150983cd24fb0d6963f7d28e17f72"));
    }

    #[test]
    fn test_cancelled() {
        let token = ProgressToken::new();
        token.stop();
        let mut src: &[u8] = b"abc";
        let mut dev = Device::new(&mut src);
        assert_eq!(hash(&mut dev, HashKind::Sha256, 0, None, Some(&token)), None);
        assert_eq!(entropy(&mut dev, 0, None, Some(&token)), None);
    }

    #[test]
    fn test_hash_kind_parse() {
        assert_eq!("SHA-256".parse::<HashKind>().unwrap(), HashKind::Sha256);
        assert_eq!("md5".parse::<HashKind>().unwrap(), HashKind::Md5);
        assert!("crc32".parse::<HashKind>().is_err());
    }

    #[test]
    fn test_byte_counts_range() {
        let mut src: &[u8] = b"aab";
        let mut dev = Device::new(&mut src);
        let counts = byte_counts(&mut dev, 1, Some(10), None).unwrap();
        assert_eq!(counts[b'a' as usize], 1);
        assert_eq!(counts[b'b' as usize], 1);
    }
}
