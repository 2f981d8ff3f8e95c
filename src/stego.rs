/// Invisible card encoding for advertised names.
///
/// An encoded name is a visible ASCII prefix followed by six zero-width
/// markers:
///
/// ```text
///   "CARD_" [suit] [separator] [b3] [b2] [b1] [b0]
/// ```
///
/// The suit marker is one of four code points, the separator repeats the
/// Hearts marker, and the rank is four bits, most significant first, each
/// one of two further code points. Every card encodes to the same number of
/// characters, so the name length says nothing about the card.
use heapless::{String, Vec};

use crate::card::{Card, Suit};
use crate::config::MarkerSet;
use crate::defaults::{MARKER_COUNT, MAX_SSID_LEN, RANK_BITS};

/// An encoded name. Capacity is the 802.11 SSID limit.
pub type EncodedName = String<MAX_SSID_LEN>;

/// Encode `card` behind `prefix`.
///
/// Returns `None` only when the result would not fit in an SSID, which a
/// validated [`Config`](crate::config::Config) rules out.
pub fn encode_name(card: &Card, prefix: &str, markers: &MarkerSet) -> Option<EncodedName> {
    let mut name = EncodedName::new();
    name.push_str(prefix).ok()?;
    name.push(markers.suits[card.suit().index()]).ok()?;
    name.push(markers.separator()).ok()?;
    for bit in (0..RANK_BITS).rev() {
        let marker = if (card.rank() >> bit) & 1 == 1 {
            markers.bit_one
        } else {
            markers.bit_zero
        };
        name.push(marker).ok()?;
    }
    Some(name)
}

/// Recover a card from an advertised name.
///
/// Anything that is not exactly `prefix` + six well-placed markers with a
/// rank in 1–13 is rejected, so ordinary network names decode to `None`.
pub fn decode_name(name: &str, prefix: &str, markers: &MarkerSet) -> Option<Card> {
    let payload = name.strip_prefix(prefix)?;

    let mut chars: Vec<char, MARKER_COUNT> = Vec::new();
    for c in payload.chars() {
        chars.push(c).ok()?;
    }
    if chars.len() != MARKER_COUNT {
        return None;
    }

    let suit_idx = markers.suits.iter().position(|&m| m == chars[0])?;
    let suit = Suit::from_count(suit_idx as u8 + 1)?;

    if chars[1] != markers.separator() {
        return None;
    }

    let mut rank = 0u8;
    for &c in &chars[2..] {
        let bit = if c == markers.bit_one {
            1
        } else if c == markers.bit_zero {
            0
        } else {
            return None;
        };
        rank = (rank << 1) | bit;
    }

    Card::new(suit, rank)
}

/// True if `name` starts with `prefix` and carries only invisible markers
/// after it. Cheap pre-filter for scanners before a full decode.
pub fn looks_encoded(name: &str, prefix: &str, markers: &MarkerSet) -> bool {
    match name.strip_prefix(prefix) {
        Some(rest) => !rest.is_empty() && rest.chars().all(|c| markers.all().contains(&c)),
        None => false,
    }
}
