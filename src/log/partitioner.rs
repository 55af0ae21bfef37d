//! Key to partition mapping.
//!
//! Uses the same murmur2 variant as the Kafka default partitioner so a key
//! lands on the same partition here as it would on a broker, and so the
//! mapping never changes between builds.

/// Returns the partition for `key` in a topic with `num_partitions` partitions.
pub fn partition_for(key: &str, num_partitions: u32) -> u32 {
    if num_partitions == 0 {
        return 0;
    }
    let hash = murmur2(key.as_bytes()) & 0x7fff_ffff;
    (hash as u32) % num_partitions
}

fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h: u32 = SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_partition() {
        for key in ["route_33", "KBZ 123A", "sacco_01", ""] {
            assert_eq!(partition_for(key, 3), partition_for(key, 3));
        }
    }

    #[test]
    fn test_partition_in_range() {
        for i in 0..200 {
            let key = format!("matatu-{i}");
            assert!(partition_for(&key, 7) < 7);
        }
    }

    #[test]
    fn test_zero_partitions() {
        assert_eq!(partition_for("route_33", 0), 0);
    }

    #[test]
    fn test_murmur2_matches_kafka_reference_values() {
        // Values produced by org.apache.kafka.common.utils.Utils.murmur2
        assert_eq!(murmur2(b"21"), -973_932_308);
        assert_eq!(murmur2(b"foobar"), -790_332_482);
        assert_eq!(murmur2(b"a-little-bit-long-string"), -985_981_536);
        assert_eq!(murmur2(b""), 275_646_681);
    }

    #[test]
    fn test_keys_spread_across_partitions() {
        let mut seen = [false; 3];
        for i in 0..50 {
            seen[partition_for(&format!("route_{i}"), 3) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
