use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Credits charged for a plain text-to-image thumbnail.
pub const BASE_COST: i32 = 5;

/// Credits charged when a permitted reference image conditions the generation.
pub const REFERENCE_IMAGE_COST: i32 = 15;

/// Queue priority for tiers without a dedicated class. Lower is served first.
pub const DEFAULT_PRIORITY: u32 = 4;

/// Subscription level of an account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Tier {
    None,
    Free,
    Creator,
    Pro,
}

impl Tier {
    /// Queue priority derived from the tier: pro < creator < free < default.
    pub fn priority(self) -> u32 {
        match self {
            Tier::Pro => 1,
            Tier::Creator => 2,
            Tier::Free => 3,
            Tier::None => DEFAULT_PRIORITY,
        }
    }

    pub fn allows_reference_image(self) -> bool {
        matches!(self, Tier::Creator | Tier::Pro)
    }

    /// Free-tier artifacts must carry the brand mark.
    pub fn requires_watermark(self) -> bool {
        self == Tier::Free
    }

    /// Credits a generation costs for this tier.
    pub fn generation_cost(self, uses_reference_image: bool) -> i32 {
        if uses_reference_image && self.allows_reference_image() {
            REFERENCE_IMAGE_COST
        } else {
            BASE_COST
        }
    }
}

/// The ledger-relevant slice of a user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub tier: Tier,
    pub credits: i32,
    pub total_credits: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
