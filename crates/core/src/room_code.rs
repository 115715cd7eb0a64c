//! Room code encoding and decoding
//!
//! Code format: `AAAAAAAA-BBBB-CCCC`
//!
//! - `A`: the host's IPv4 address as 7 symbols plus one checksum symbol
//! - `B`: unix time slice, keeps codes from the same host distinct over time
//! - `C`: slice of a hash of a fresh random value
//!
//! Only segment A carries information a joiner needs. The checksum is typo
//! protection (`sum(octets) mod RADIX`), not an integrity guarantee: a few
//! single-symbol corruptions keep the checksum intact and decode to another
//! address.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RoomCodeError;

/// Symbols used in codes. Excludes 0/O/1/I/L.
pub const ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Numeric base of every code segment
pub const RADIX: u64 = ALPHABET.len() as u64;

/// Symbols in the address segment (value + checksum)
pub const ADDRESS_LEN: usize = 8;

const VALUE_LEN: usize = ADDRESS_LEN - 1;
const TIME_LEN: usize = 4;
const TOKEN_LEN: usize = 4;

/// A validated room code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode {
    text: String,
    address: Ipv4Addr,
}

impl RoomCode {
    /// Encode an address into a fresh room code
    pub fn encode(address: Ipv4Addr) -> Self {
        let unix_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut seed = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut seed);
        let digest = Sha256::digest(seed);
        let token = [digest[0], digest[1], digest[2], digest[3]];

        Self::encode_with(address, unix_time, token)
    }

    /// Encode with explicit time and token bytes
    pub fn encode_with(address: Ipv4Addr, unix_time: u64, token: [u8; 4]) -> Self {
        let time_slice = unix_time % RADIX.pow(TIME_LEN as u32);

        let mut text = address_segment(address);
        text.push('-');
        text.push_str(&to_symbols(time_slice, TIME_LEN));
        text.push('-');
        text.extend(token.iter().take(TOKEN_LEN).map(|b| symbol(u64::from(*b) % RADIX)));

        Self { text, address }
    }

    /// Parse user input into a room code
    ///
    /// Input is case-insensitive and may omit the dashes.
    pub fn parse(s: &str) -> Result<Self, RoomCodeError> {
        let address = decode(s)?;
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let full_len = ADDRESS_LEN + TIME_LEN + TOKEN_LEN;
        let text = if normalized.len() == full_len && normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            format!(
                "{}-{}-{}",
                &normalized[..ADDRESS_LEN],
                &normalized[ADDRESS_LEN..ADDRESS_LEN + TIME_LEN],
                &normalized[ADDRESS_LEN + TIME_LEN..]
            )
        } else {
            normalized[..ADDRESS_LEN].to_string()
        };

        Ok(Self { text, address })
    }

    /// The reachability address carried in the code
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.text
    }
}

/// Encode the 8-symbol address segment (deterministic)
pub fn address_segment(address: Ipv4Addr) -> String {
    let value = u64::from(u32::from(address));
    let mut segment = to_symbols(value, VALUE_LEN);
    segment.push(symbol(checksum(address.octets())));
    segment
}

/// Decode the address from a room code
pub fn decode(code: &str) -> Result<Ipv4Addr, RoomCodeError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(RoomCodeError::Empty);
    }

    let segment: Vec<char> = if code.contains('-') {
        code.split('-').next().unwrap_or_default().chars().collect()
    } else {
        code.chars().take(ADDRESS_LEN).collect()
    };

    let mut value: u64 = 0;
    let mut digits = Vec::with_capacity(ADDRESS_LEN);
    for c in &segment {
        digits.push(index_of(*c).ok_or(RoomCodeError::InvalidCharacter(*c))?);
    }

    if digits.len() != ADDRESS_LEN {
        return Err(RoomCodeError::InvalidLength {
            expected: ADDRESS_LEN,
            actual: digits.len(),
        });
    }

    for digit in &digits[..VALUE_LEN] {
        value = value * RADIX + digit;
    }

    // No encoder output exceeds 32 bits, so this can only be corruption
    let value = u32::try_from(value).map_err(|_| RoomCodeError::InvalidChecksum)?;
    let address = Ipv4Addr::from(value);

    if checksum(address.octets()) != digits[VALUE_LEN] {
        return Err(RoomCodeError::InvalidChecksum);
    }

    Ok(address)
}

fn checksum(octets: [u8; 4]) -> u64 {
    octets.iter().map(|o| u64::from(*o)).sum::<u64>() % RADIX
}

fn symbol(index: u64) -> char {
    ALPHABET[index as usize] as char
}

fn index_of(c: char) -> Option<u64> {
    let upper = c.to_ascii_uppercase();
    if !upper.is_ascii() {
        return None;
    }
    ALPHABET
        .iter()
        .position(|b| *b == upper as u8)
        .map(|i| i as u64)
}

fn to_symbols(mut value: u64, len: usize) -> String {
    let mut out = vec!['A'; len];
    for slot in out.iter_mut().rev() {
        *slot = symbol(value % RADIX);
        value /= RADIX;
    }
    out.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alphabet_excludes_ambiguous() {
        for c in ['0', 'O', '1', 'I', 'L'] {
            assert!(!ALPHABET.contains(&(c as u8)));
        }
        let mut sorted = ALPHABET.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ALPHABET.len());
    }

    #[test]
    fn test_example_address() {
        let ip = Ipv4Addr::new(192, 168, 1, 100);
        let segment = address_segment(ip);
        assert_eq!(segment.len(), ADDRESS_LEN);
        assert_eq!(segment, address_segment(ip));
        assert_eq!(decode(&segment).unwrap(), ip);

        let other = address_segment(Ipv4Addr::new(192, 168, 1, 101));
        assert_ne!(segment, other);
        assert_eq!(decode(&other).unwrap(), Ipv4Addr::new(192, 168, 1, 101));
    }

    #[test]
    fn test_full_code_layout() {
        let code = RoomCode::encode(Ipv4Addr::new(10, 0, 0, 1));
        let parts: Vec<&str> = code.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 4);
        assert_eq!(parts[2].len(), 4);
        assert!(code
            .as_str()
            .bytes()
            .all(|b| b == b'-' || ALPHABET.contains(&b)));
        assert_eq!(code.address(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_encode_with_is_deterministic() {
        let ip = Ipv4Addr::new(172, 16, 0, 50);
        let a = RoomCode::encode_with(ip, 1_700_000_000, [1, 2, 3, 4]);
        let b = RoomCode::encode_with(ip, 1_700_000_000, [1, 2, 3, 4]);
        assert_eq!(a, b);

        let c = RoomCode::encode_with(ip, 1_700_000_001, [1, 2, 3, 4]);
        assert_ne!(a.as_str(), c.as_str());
        assert_eq!(c.address(), ip);
    }

    #[test]
    fn test_roundtrip_edge_and_sampled_addresses() {
        let mut addresses = vec![
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(255, 255, 255, 255),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(172, 16, 0, 50),
            Ipv4Addr::new(192, 168, 1, 100),
        ];
        // Stride through the whole space
        let mut v: u32 = 7;
        for _ in 0..5000 {
            addresses.push(Ipv4Addr::from(v));
            v = v.wrapping_mul(2_654_435_761).wrapping_add(12_345);
        }

        for ip in addresses {
            let code = RoomCode::encode(ip);
            assert_eq!(decode(code.as_str()).unwrap(), ip, "code {}", code);
        }
    }

    #[test]
    fn test_decode_is_case_insensitive_and_tolerates_missing_dashes() {
        let ip = Ipv4Addr::new(192, 168, 1, 100);
        let code = RoomCode::encode_with(ip, 42, [9, 8, 7, 6]);

        let lower = code.as_str().to_lowercase();
        assert_eq!(decode(&lower).unwrap(), ip);

        let undashed = code.as_str().replace('-', "");
        assert_eq!(decode(&undashed).unwrap(), ip);

        let parsed = RoomCode::parse(&undashed.to_lowercase()).unwrap();
        assert_eq!(parsed, code);
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(decode(""), Err(RoomCodeError::Empty));
        assert_eq!(decode("   "), Err(RoomCodeError::Empty));
        assert_eq!(
            decode("ABC-DEFG-HJKM"),
            Err(RoomCodeError::InvalidLength {
                expected: 8,
                actual: 3
            })
        );
        assert_eq!(decode("ABCDEFG0"), Err(RoomCodeError::InvalidCharacter('0')));
        assert_eq!(decode("OBCDEFGH"), Err(RoomCodeError::InvalidCharacter('O')));
    }

    #[test]
    fn test_decode_rejects_overflowing_value() {
        // All-max symbols exceed 32 bits
        let code = "99999999";
        assert_eq!(decode(code), Err(RoomCodeError::InvalidChecksum));
    }

    #[test]
    fn test_single_symbol_flips_are_mostly_rejected() {
        let ip = Ipv4Addr::new(192, 168, 1, 100);
        let segment: Vec<u8> = address_segment(ip).into_bytes();

        let mut rejected = 0;
        let mut coincidental = 0;
        for pos in 0..ADDRESS_LEN {
            for &replacement in ALPHABET {
                if replacement == segment[pos] {
                    continue;
                }
                let mut flipped = segment.clone();
                flipped[pos] = replacement;
                let flipped = String::from_utf8(flipped).unwrap();

                match decode(&flipped) {
                    Err(RoomCodeError::InvalidChecksum) | Err(RoomCodeError::InvalidCharacter(_)) => {
                        rejected += 1
                    }
                    Err(other) => panic!("unexpected error {other:?}"),
                    Ok(decoded) => {
                        // Known limitation: the checksum only catches most typos
                        assert_ne!(decoded, ip);
                        assert!(pos < VALUE_LEN, "checksum symbol flip must never pass");
                        assert_eq!(checksum(decoded.octets()), checksum(ip.octets()));
                        coincidental += 1;
                    }
                }
            }
        }

        assert!(rejected > coincidental * 10, "{rejected} vs {coincidental}");
    }

    #[test]
    fn test_room_code_serde_as_string() {
        let code = RoomCode::encode_with(Ipv4Addr::new(10, 1, 2, 3), 99, [0, 0, 0, 0]);
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, format!("\"{}\"", code));

        let back: RoomCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);

        assert!(serde_json::from_str::<RoomCode>("\"AAAAAAA0\"").is_err());
    }
}
