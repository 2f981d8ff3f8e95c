/// Playing-card value types.
///
/// A card is entered as two tap counts: the suit (1–4) and the rank (1–13).
/// Both types refuse out-of-range values at construction, so a `Card` that
/// exists is always a real card.
use core::fmt;

/// Card suit, numbered by the tap count that selects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Suit {
    Hearts = 1,
    Spades = 2,
    Clubs = 3,
    Diamonds = 4,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Hearts, Suit::Spades, Suit::Clubs, Suit::Diamonds];

    /// Map a tap count to a suit. Returns `None` outside 1–4.
    pub const fn from_count(count: u8) -> Option<Self> {
        match count {
            1 => Some(Suit::Hearts),
            2 => Some(Suit::Spades),
            3 => Some(Suit::Clubs),
            4 => Some(Suit::Diamonds),
            _ => None,
        }
    }

    /// Tap count (and wire value) for this suit.
    pub const fn count(self) -> u8 {
        self as u8
    }

    /// Zero-based index into per-suit tables.
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Suit::Hearts => "hearts",
            Suit::Spades => "spades",
            Suit::Clubs => "clubs",
            Suit::Diamonds => "diamonds",
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Suit::Hearts => '♥',
            Suit::Spades => '♠',
            Suit::Clubs => '♣',
            Suit::Diamonds => '♦',
        }
    }
}

impl TryFrom<u8> for Suit {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Suit::from_count(value).ok_or(value)
    }
}

/// Lowest valid rank (Ace).
pub const MIN_RANK: u8 = 1;
/// Highest valid rank (King).
pub const MAX_RANK: u8 = 13;

/// A decoded playing card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Card {
    suit: Suit,
    rank: u8,
}

impl Card {
    /// Build a card, rejecting ranks outside 1–13.
    pub const fn new(suit: Suit, rank: u8) -> Option<Self> {
        if rank >= MIN_RANK && rank <= MAX_RANK {
            Some(Self { suit, rank })
        } else {
            None
        }
    }

    pub const fn suit(&self) -> Suit {
        self.suit
    }

    pub const fn rank(&self) -> u8 {
        self.rank
    }

    /// Short rank label: "A", "2".."10", "J", "Q", "K".
    pub fn rank_label(&self) -> &'static str {
        const LABELS: [&str; 13] = [
            "A", "2", "3", "4", "5", "6", "7", "8", "9", "10", "J", "Q", "K",
        ];
        LABELS[(self.rank - MIN_RANK) as usize]
    }

    /// Every valid card, suit-major.
    pub fn all() -> impl Iterator<Item = Card> {
        Suit::ALL.into_iter().flat_map(|suit| {
            (MIN_RANK..=MAX_RANK).map(move |rank| Card { suit, rank })
        })
    }
}

/// Formats as the short form, e.g. `Q♥`.
impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.rank_label(), self.suit.symbol())
    }
}

/// Bounded string for a formatted card name ("10♦" is 6 bytes).
pub type CardLabel = heapless::String<8>;

/// Format a card into a fixed-capacity label.
pub fn format_card(card: &Card, buf: &mut CardLabel) {
    use core::fmt::Write;
    buf.clear();
    let _ = write!(buf, "{card}");
}
