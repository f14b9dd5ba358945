//! Sync-checksum engine.
//!
//! The syncable projection is everything that shapes a product's downstream
//! representation. Unordered parts are sorted before encoding, the projection is
//! serialized with a fixed field order, and the bytes are hashed with SHA-256.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::association::AssociationPlan;
use crate::product::{Product, SystemListing};
use crate::SyncError;

pub const CHECKSUM_VERSION: &str = "checksum.v1";
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Lowercase hex SHA-256 digest of a syncable projection.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct SyncChecksum(String);

impl SyncChecksum {
    /// # Errors
    /// Returns [`SyncError::Format`] unless `value` is exactly 64 lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self, SyncError> {
        let valid = value.len() == CHECKSUM_HEX_LEN
            && value.bytes().all(|byte| matches!(byte, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(SyncError::Format(format!(
                "checksum MUST be {CHECKSUM_HEX_LEN} lowercase hex characters, got `{value}`"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SyncChecksum {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SyncChecksum> for String {
    fn from(value: SyncChecksum) -> Self {
        value.0
    }
}

impl Display for SyncChecksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ProjectedPrice {
    pub tier: String,
    pub net_minor: i64,
    pub gross_minor: i64,
}

/// Field order here is the encoding order and part of the checksum format.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct SyncProjection {
    pub sku: String,
    pub name: String,
    pub short_description: String,
    pub long_description: String,
    pub weight_grams: u64,
    pub categories: Vec<u64>,
    pub prices: Vec<ProjectedPrice>,
    pub stock: i64,
    pub tax_rate_bp: u32,
}

#[derive(Serialize)]
struct ChecksumEnvelope<'a> {
    version: &'static str,
    projection: &'a SyncProjection,
}

/// Build the canonical projection for one (product, system) pair.
///
/// Total over its inputs: absent optional values coerce to empty or zero.
#[must_use]
pub fn syncable_projection(
    product: &Product,
    listing: &SystemListing,
    associations: &AssociationPlan,
) -> SyncProjection {
    let mut categories = associations.external_ids.iter().map(|id| id.get()).collect::<Vec<_>>();
    categories.sort_unstable();
    categories.dedup();

    let mut prices = product
        .prices
        .iter()
        .map(|price| ProjectedPrice {
            tier: price.tier.clone(),
            net_minor: price.net_minor,
            gross_minor: price.gross_minor,
        })
        .collect::<Vec<_>>();
    prices.sort_by(|left, right| {
        (&left.tier, left.net_minor, left.gross_minor).cmp(&(
            &right.tier,
            right.net_minor,
            right.gross_minor,
        ))
    });

    SyncProjection {
        sku: product.sku.clone(),
        name: listing.effective_name(product).to_string(),
        short_description: listing.effective_short_description(product).to_string(),
        long_description: listing.effective_long_description(product).to_string(),
        weight_grams: product.weight_grams.unwrap_or(0),
        categories,
        prices,
        stock: listing.effective_stock(product),
        tax_rate_bp: listing.effective_tax_rate_bp(product),
    }
}

/// # Errors
/// Returns [`SyncError::Serialization`] if the projection cannot be encoded.
pub fn calculate_checksum(projection: &SyncProjection) -> Result<SyncChecksum, SyncError> {
    let encoded =
        serde_json::to_vec(&ChecksumEnvelope { version: CHECKSUM_VERSION, projection })
            .map_err(|err| SyncError::Serialization(format!("failed to encode projection: {err}")))?;

    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(SyncChecksum(hex::encode(hasher.finalize())))
}

/// True when nothing was stored yet or the stored digest differs.
#[must_use]
pub fn needs_sync(current: &SyncChecksum, stored: Option<&SyncChecksum>) -> bool {
    stored != Some(current)
}
