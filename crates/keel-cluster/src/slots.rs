//! Hash slot arithmetic: key hashing, slot ranges and the 16384-bit
//! ownership bitmap carried in every heartbeat header.

use serde::{Deserialize, Serialize};

/// Total number of hash slots in the cluster.
pub const SLOT_COUNT: u16 = 16384;

/// Size in bytes of the slot bitmap on the wire (one bit per slot).
pub const SLOT_BITMAP_BYTES: usize = SLOT_COUNT as usize / 8;

/// CRC16 lookup table (CCITT/XMODEM polynomial).
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        let idx = ((crc >> 8) ^ (byte as u16)) as usize;
        crc = (crc << 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Extracts the hashable portion of a key, handling `{hash tags}`.
///
/// The tag is the content between the first `{` and the first `}` after it;
/// an empty or unterminated tag means the whole key is hashed. Tags let
/// callers pin related keys to the same slot.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let after_open = &key[open + 1..];
    let Some(close) = after_open.iter().position(|&b| b == b'}') else {
        return key;
    };
    if close == 0 {
        return key;
    }
    &after_open[..close]
}

/// Computes the hash slot for a key. Returns a value in `[0, 16383]`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(extract_hash_tag(key)) % SLOT_COUNT
}

/// A contiguous, inclusive range of slots.
///
/// Used for the compact textual form in the node table and admin output;
/// the authoritative in-memory representation is [`SlotBitmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16, // inclusive
}

impl SlotRange {
    /// Creates a new slot range (end is inclusive).
    ///
    /// # Panics
    ///
    /// Panics if `start > end` or `end >= SLOT_COUNT`.
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "SlotRange requires start <= end");
        assert!(end < SLOT_COUNT, "slot must be < {SLOT_COUNT}");
        Self { start, end }
    }

    /// Returns the number of slots in this range.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.end - self.start + 1
    }

    /// Returns an iterator over all slots in this range.
    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl std::str::FromStr for SlotRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_slot = |t: &str| -> Result<u16, String> {
            let v: u16 = t.parse().map_err(|_| format!("invalid slot '{t}'"))?;
            if v >= SLOT_COUNT {
                return Err(format!("slot {v} out of range"));
            }
            Ok(v)
        };
        match s.split_once('-') {
            Some((a, b)) => {
                let (start, end) = (parse_slot(a)?, parse_slot(b)?);
                if start > end {
                    return Err(format!("inverted slot range '{s}'"));
                }
                Ok(Self { start, end })
            }
            None => {
                let slot = parse_slot(s)?;
                Ok(Self { start: slot, end: slot })
            }
        }
    }
}

/// A 16384-bit set of slots, stored exactly as it travels in the wire
/// header (one bit per slot, slot 0 at the LSB of byte 0).
#[derive(Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    bits: Box<[u8]>,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self {
            bits: vec![0u8; SLOT_BITMAP_BYTES].into_boxed_slice(),
        }
    }

    /// Builds a bitmap from raw wire bytes.
    ///
    /// Returns `None` unless exactly [`SLOT_BITMAP_BYTES`] are given.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SLOT_BITMAP_BYTES {
            return None;
        }
        Some(Self {
            bits: bytes.to_vec().into_boxed_slice(),
        })
    }

    /// Raw wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn contains(&self, slot: u16) -> bool {
        let (byte, bit) = (slot as usize / 8, slot % 8);
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn insert(&mut self, slot: u16) {
        let (byte, bit) = (slot as usize / 8, slot % 8);
        self.bits[byte] |= 1 << bit;
    }

    pub fn remove(&mut self, slot: u16) {
        let (byte, bit) = (slot as usize / 8, slot % 8);
        self.bits[byte] &= !(1 << bit);
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Number of slots in the set.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Iterates the slots in the set, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..SLOT_COUNT).filter(|&s| self.contains(s))
    }

    /// Collapses the set into sorted, maximal contiguous ranges.
    pub fn ranges(&self) -> Vec<SlotRange> {
        let mut ranges = Vec::new();
        let mut start: Option<u16> = None;
        for slot in 0..SLOT_COUNT {
            match (self.contains(slot), start) {
                (true, None) => start = Some(slot),
                (false, Some(s)) => {
                    ranges.push(SlotRange::new(s, slot - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            ranges.push(SlotRange::new(s, SLOT_COUNT - 1));
        }
        ranges
    }
}

impl std::fmt::Debug for SlotBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotBitmap({} slots)", self.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vectors() {
        assert_eq!(key_slot(b""), 0);
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        // CRC16 XMODEM of "123456789" is 0x31C3 = 12739
        assert_eq!(key_slot(b"123456789"), 12739);
    }

    #[test]
    fn hash_tag_extraction() {
        assert_eq!(key_slot(b"user:{123}:profile"), key_slot(b"123"));
        assert_eq!(key_slot(b"{user}:123"), key_slot(b"user"));
        // empty tag and missing close brace hash the whole key
        assert_eq!(extract_hash_tag(b"foo{}bar"), b"foo{}bar");
        assert_eq!(extract_hash_tag(b"foo{bar"), b"foo{bar");
        // only the first tag matters
        assert_eq!(key_slot(b"{a}{b}"), key_slot(b"a"));
    }

    #[test]
    fn slot_range_parse_and_display() {
        let r: SlotRange = "0-5460".parse().unwrap();
        assert_eq!(r, SlotRange::new(0, 5460));
        assert_eq!(r.to_string(), "0-5460");

        let single: SlotRange = "100".parse().unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single.to_string(), "100");

        assert!("5000-100".parse::<SlotRange>().is_err());
        assert!("16384".parse::<SlotRange>().is_err());
        assert!("x".parse::<SlotRange>().is_err());
    }

    #[test]
    fn bitmap_insert_remove() {
        let mut bm = SlotBitmap::new();
        assert!(bm.is_empty());

        bm.insert(0);
        bm.insert(7);
        bm.insert(8);
        bm.insert(16383);
        assert_eq!(bm.count(), 4);
        assert!(bm.contains(0));
        assert!(bm.contains(16383));
        assert!(!bm.contains(1));

        bm.remove(7);
        assert!(!bm.contains(7));
        assert_eq!(bm.count(), 3);

        bm.clear();
        assert!(bm.is_empty());
    }

    #[test]
    fn bitmap_wire_roundtrip() {
        let mut bm = SlotBitmap::new();
        bm.insert(5);
        bm.insert(9000);
        let restored = SlotBitmap::from_bytes(bm.as_bytes()).unwrap();
        assert_eq!(bm, restored);

        assert!(SlotBitmap::from_bytes(&[0u8; 10]).is_none());
    }

    #[test]
    fn bitmap_ranges_merge_contiguous() {
        let mut bm = SlotBitmap::new();
        for s in 0..=10 {
            bm.insert(s);
        }
        bm.insert(100);
        for s in 16380..SLOT_COUNT {
            bm.insert(s);
        }
        let ranges = bm.ranges();
        assert_eq!(
            ranges,
            vec![
                SlotRange::new(0, 10),
                SlotRange::new(100, 100),
                SlotRange::new(16380, 16383),
            ]
        );
    }
}
