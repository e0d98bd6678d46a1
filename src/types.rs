// =============================================================================
// Shared types used across the Meridian core
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One unit of subscription on the streaming transport. The set is closed:
/// these five names are the only valid channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    MarketData,
    Orders,
    Positions,
    Account,
    Strategies,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::MarketData,
        Channel::Orders,
        Channel::Positions,
        Channel::Account,
        Channel::Strategies,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::Orders => "orders",
            Self::Positions => "positions",
            Self::Account => "account",
            Self::Strategies => "strategies",
        }
    }

    /// Parse a wire channel name. Returns `None` for anything outside the
    /// closed set.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "market_data" => Some(Self::MarketData),
            "orders" => Some(Self::Orders),
            "positions" => Some(Self::Positions),
            "account" => Some(Self::Account),
            "strategies" => Some(Self::Strategies),
            _ => None,
        }
    }

    /// Stable index into per-channel arrays (delivery bookkeeping,
    /// channel-sequence tracking).
    pub fn index(&self) -> usize {
        match self {
            Self::MarketData => 0,
            Self::Orders => 1,
            Self::Positions => 2,
            Self::Account => 3,
            Self::Strategies => 4,
        }
    }

    fn bit(&self) -> u8 {
        1 << self.index()
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compact bitmask over the five channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub const EMPTY: ChannelSet = ChannelSet(0);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        let mut set = Self::empty();
        for ch in Channel::ALL {
            set.insert(ch);
        }
        set
    }

    pub fn insert(&mut self, ch: Channel) {
        self.0 |= ch.bit();
    }

    pub fn remove(&mut self, ch: Channel) {
        self.0 &= !ch.bit();
    }

    pub fn contains(&self, ch: Channel) -> bool {
        self.0 & ch.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Union with another set.
    pub fn union(&self, other: ChannelSet) -> ChannelSet {
        ChannelSet(self.0 | other.0)
    }

    /// Intersection with another set.
    pub fn intersect(&self, other: ChannelSet) -> ChannelSet {
        ChannelSet(self.0 & other.0)
    }

    /// Channels present in `self` but not in `other`.
    pub fn difference(&self, other: ChannelSet) -> ChannelSet {
        ChannelSet(self.0 & !other.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        Channel::ALL.into_iter().filter(|ch| self.contains(*ch))
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        let mut set = Self::empty();
        for ch in iter {
            set.insert(ch);
        }
        set
    }
}

// ---------------------------------------------------------------------------
// Order primitives
// ---------------------------------------------------------------------------

/// Order / position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts; used in PnL arithmetic.
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Buy => Side::Sell,
            Self::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

impl Default for OrderType {
    fn default() -> Self {
        Self::Market
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

// ---------------------------------------------------------------------------
// Streaming client attributes
// ---------------------------------------------------------------------------

/// Delivery cadence class. Terminal clients tick fast (~100 ms), web clients
/// slow (~250 ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Fast,
    Slow,
}

impl ClientKind {
    /// Map the `type` upgrade query parameter. Unknown values fall back to
    /// the fast/terminal class.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("web") => Self::Slow,
            _ => Self::Fast,
        }
    }
}

/// Per-client wire encoding, selected at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    Binary,
    Json,
}

impl WireFormat {
    /// Map the `format` upgrade query parameter. Binary is the default.
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("json") => Self::Json,
            _ => Self::Binary,
        }
    }
}

/// Per-asset balance as reported by the account monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_roundtrip() {
        for ch in Channel::ALL {
            assert_eq!(Channel::parse(ch.as_str()), Some(ch));
        }
        assert_eq!(Channel::parse("order_book"), None);
    }

    #[test]
    fn channel_set_operations() {
        let mut set = ChannelSet::empty();
        assert!(set.is_empty());

        set.insert(Channel::Account);
        set.insert(Channel::Positions);
        assert_eq!(set.len(), 2);
        assert!(set.contains(Channel::Account));
        assert!(!set.contains(Channel::Orders));

        let mut other = ChannelSet::empty();
        other.insert(Channel::Positions);
        other.insert(Channel::Orders);

        let added = other.difference(set);
        assert!(added.contains(Channel::Orders));
        assert!(!added.contains(Channel::Positions));

        let union = set.union(other);
        assert_eq!(union.len(), 3);

        set.remove(Channel::Account);
        assert!(!set.contains(Channel::Account));
    }

    #[test]
    fn channel_set_iteration_order_is_stable() {
        let set: ChannelSet = [Channel::Strategies, Channel::MarketData].into_iter().collect();
        let collected: Vec<Channel> = set.iter().collect();
        assert_eq!(collected, vec![Channel::MarketData, Channel::Strategies]);
    }

    #[test]
    fn client_kind_from_query() {
        assert_eq!(ClientKind::from_query(Some("tui")), ClientKind::Fast);
        assert_eq!(ClientKind::from_query(Some("web")), ClientKind::Slow);
        assert_eq!(ClientKind::from_query(None), ClientKind::Fast);
        assert_eq!(ClientKind::from_query(Some("mobile")), ClientKind::Fast);
    }

    #[test]
    fn wire_format_from_query() {
        assert_eq!(WireFormat::from_query(Some("json")), WireFormat::Json);
        assert_eq!(WireFormat::from_query(Some("binary")), WireFormat::Binary);
        assert_eq!(WireFormat::from_query(None), WireFormat::Binary);
    }

    #[test]
    fn side_direction() {
        assert_eq!(Side::Buy.direction(), 1.0);
        assert_eq!(Side::Sell.direction(), -1.0);
        assert_eq!(Side::Buy.opposite(), Side::Sell);
    }
}
