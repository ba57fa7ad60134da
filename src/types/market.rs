//! Perpetual market metadata read from the market registry, and collateral pool addresses.

use num_bigint::BigInt;
use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::subaccount::ZERO_YIELD_INDEX;

/// Atomic resolution of the settlement asset: one quantum is 10^-6 of a unit.
pub const QUOTE_ATOMIC_RESOLUTION: i32 = -6;

/// Module name the collateral pool addresses are derived from.
pub const COLLATERAL_POOL_MODULE: &str = "subaccounts";

/// Module account funding claimed yield.
pub const YIELD_POOL_MODULE: &str = "yield_pool";

/// Module account covering liquidation losses. Isolated markets suffix their id.
pub const INSURANCE_FUND_MODULE: &str = "insurance_fund";

/// Module account receiving the protocol's share of trading fees.
pub const FEE_COLLECTOR_MODULE: &str = "fee_collector";

/// How positions in a market are collateralized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// Shares collateral with every other cross position of the account.
    Cross,
    /// Collateralized on its own, backed by a dedicated pool.
    Isolated,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketType::Cross => write!(f, "cross"),
            MarketType::Isolated => write!(f, "isolated"),
        }
    }
}

/// Margin parameters shared by a group of markets.
///
/// Between the two open-interest caps (quote quantums of market-wide open
/// interest) the initial margin rises linearly from `initial_margin_ppm` to
/// 100%. An upper cap of zero disables the scaling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityTier {
    pub id: u32,
    pub name: String,
    /// Initial margin as parts per million of notional.
    pub initial_margin_ppm: u32,
    /// Maintenance margin as parts per million of the initial margin.
    pub maintenance_fraction_ppm: u32,
    #[serde(default)]
    pub open_interest_lower_cap: u64,
    #[serde(default)]
    pub open_interest_upper_cap: u64,
}

/// Everything the ledger needs to know about one perpetual market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerpetualInfo {
    pub id: u32,
    pub ticker: String,
    pub market_type: MarketType,
    /// Oracle price in settlement-asset units per base unit.
    pub price: Decimal,
    /// Base quantums per unit is 10^-atomic_resolution.
    pub atomic_resolution: i32,
    #[serde(with = "crate::utils::bigint_str")]
    pub funding_index: BigInt,
    pub yield_index: String,
    pub liquidity_tier: LiquidityTier,
    #[serde(with = "crate::utils::bigint_str")]
    pub open_interest: BigInt,
}

impl PerpetualInfo {
    /// A cross market with zero funding and yield history.
    pub fn new(
        id: u32,
        ticker: impl Into<String>,
        market_type: MarketType,
        price: Decimal,
        atomic_resolution: i32,
        liquidity_tier: LiquidityTier,
    ) -> Self {
        Self {
            id,
            ticker: ticker.into(),
            market_type,
            price,
            atomic_resolution,
            funding_index: BigInt::default(),
            yield_index: ZERO_YIELD_INDEX.to_string(),
            liquidity_tier,
            open_interest: BigInt::default(),
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.market_type == MarketType::Isolated
    }

    /// Positions in a market without a valid oracle price cannot be modified.
    pub fn is_updatable(&self) -> bool {
        !self.price.is_zero()
    }

    /// Pool backing positions in this market.
    pub fn collateral_pool(&self) -> Address {
        match self.market_type {
            MarketType::Cross => Address::cross_collateral_pool(),
            MarketType::Isolated => Address::isolated_collateral_pool(self.id),
        }
    }

    /// Insurance fund backing liquidations in this market.
    pub fn insurance_fund(&self) -> Address {
        match self.market_type {
            MarketType::Cross => Address::insurance_fund(),
            MarketType::Isolated => Address::isolated_insurance_fund(self.id),
        }
    }
}

/// A 20-byte account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Address of a module account: the first 20 bytes of `sha256(name)`.
    pub fn module(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[..20]);
        Self(bytes)
    }

    /// Shared pool backing every account without an isolated position.
    pub fn cross_collateral_pool() -> Self {
        Self::module(COLLATERAL_POOL_MODULE)
    }

    /// Dedicated pool backing positions in one isolated market.
    pub fn isolated_collateral_pool(perpetual_id: u32) -> Self {
        Self::module(&format!("{}:{}", COLLATERAL_POOL_MODULE, perpetual_id))
    }

    pub fn yield_pool() -> Self {
        Self::module(YIELD_POOL_MODULE)
    }

    pub fn insurance_fund() -> Self {
        Self::module(INSURANCE_FUND_MODULE)
    }

    pub fn isolated_insurance_fund(perpetual_id: u32) -> Self {
        Self::module(&format!("{}:{}", INSURANCE_FUND_MODULE, perpetual_id))
    }

    pub fn fee_collector() -> Self {
        Self::module(FEE_COLLECTOR_MODULE)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tier() -> LiquidityTier {
        LiquidityTier {
            id: 0,
            name: "Large-Cap".to_string(),
            initial_margin_ppm: 50_000,
            maintenance_fraction_ppm: 600_000,
            ..LiquidityTier::default()
        }
    }

    #[test]
    fn test_pool_addresses_are_distinct() {
        let cross = Address::cross_collateral_pool();
        assert_ne!(cross, Address::isolated_collateral_pool(3));
        assert_ne!(
            Address::isolated_collateral_pool(3),
            Address::isolated_collateral_pool(4)
        );
        assert_eq!(cross, Address::module("subaccounts"));
    }

    #[test]
    fn test_insurance_fund_follows_market_type() {
        let cross = PerpetualInfo::new(0, "BTC-USD", MarketType::Cross, dec!(1), -6, tier());
        let isolated = PerpetualInfo::new(3, "ISO-USD", MarketType::Isolated, dec!(1), -6, tier());
        assert_eq!(cross.insurance_fund(), Address::insurance_fund());
        assert_eq!(isolated.insurance_fund(), Address::isolated_insurance_fund(3));
        assert_ne!(Address::insurance_fund(), Address::fee_collector());
    }

    #[test]
    fn test_address_hex_roundtrip() {
        let addr = Address::isolated_collateral_pool(7);
        let text = addr.to_string();
        assert_eq!(text.len(), 40);
        assert_eq!(text.parse::<Address>().unwrap(), addr);
        assert!("zz".parse::<Address>().is_err());
    }

    #[test]
    fn test_market_pool_follows_type() {
        let cross = PerpetualInfo::new(0, "BTC-USD", MarketType::Cross, dec!(50000), -10, tier());
        let isolated =
            PerpetualInfo::new(3, "ISO-USD", MarketType::Isolated, dec!(1), -6, tier());
        assert_eq!(cross.collateral_pool(), Address::cross_collateral_pool());
        assert_eq!(isolated.collateral_pool(), Address::isolated_collateral_pool(3));
    }

    #[test]
    fn test_zero_price_is_not_updatable() {
        let mut market =
            PerpetualInfo::new(0, "BTC-USD", MarketType::Cross, dec!(50000), -10, tier());
        assert!(market.is_updatable());
        market.price = Decimal::ZERO;
        assert!(!market.is_updatable());
    }
}
