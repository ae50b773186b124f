//! Profile, currency and cosmetic ownership store.
//!
//! The room itself only ever calls [`ProfileStore::award_round_currency`].
//! The remaining operations belong to the shop and session-start flows served
//! next to the room; they share the same store so balances stay consistent.

use crate::settlement::Award;
use async_trait::async_trait;
use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

pub const STARTER_COSMETIC: &str = "none";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProfileError {
    #[error("unknown cosmetic '{0}'")]
    UnknownCosmetic(String),
    #[error("cosmetic '{0}' is already owned")]
    AlreadyOwned(String),
    #[error("cosmetic '{0}' is not owned")]
    NotOwned(String),
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("profile store unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: Uuid,
    pub coins: u64,
    pub equipped_cosmetic: String,
    pub rounds_played: u32,
    pub rounds_won: u32,
}

/// What every profile operation hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub profile: Profile,
    pub owned_cosmetics: Vec<String>,
}

/// Read-only cosmetic price list.
#[derive(Debug, Clone)]
pub struct Catalog {
    prices: HashMap<String, u64>,
}

impl Catalog {
    pub fn new(items: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut prices: HashMap<String, u64> = items.into_iter().collect();
        prices.entry(STARTER_COSMETIC.to_string()).or_insert(0);
        Self { prices }
    }

    pub fn price(&self, cosmetic_id: &str) -> Option<u64> {
        self.prices.get(cosmetic_id).copied()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(
            [
                ("cap", 100),
                ("beanie", 150),
                ("tophat", 300),
                ("crown", 1000),
            ]
            .into_iter()
            .map(|(id, price)| (id.to_string(), price)),
        )
    }
}

/// Ownership is enforced here, in the shop flow. The room shows whatever
/// well-formed `cosmeticId` a join carries.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_or_create_profile(&self, user_id: Uuid) -> Result<ProfileView, ProfileError>;

    /// Debits the price and grants ownership in one conditional step.
    async fn purchase_cosmetic(
        &self,
        user_id: Uuid,
        cosmetic_id: &str,
    ) -> Result<ProfileView, ProfileError>;

    async fn equip_cosmetic(
        &self,
        user_id: Uuid,
        cosmetic_id: &str,
    ) -> Result<ProfileView, ProfileError>;

    /// Credits a finished round. Not idempotent: a retried batch pays twice.
    async fn award_round_currency(&self, batch: Vec<Award>) -> Result<(), ProfileError>;
}

#[derive(Debug, Clone)]
struct StoredProfile {
    profile: Profile,
    owned: BTreeSet<String>,
}

impl StoredProfile {
    fn new(user_id: Uuid) -> Self {
        Self {
            profile: Profile {
                user_id,
                coins: 0,
                equipped_cosmetic: STARTER_COSMETIC.to_string(),
                rounds_played: 0,
                rounds_won: 0,
            },
            owned: BTreeSet::from([STARTER_COSMETIC.to_string()]),
        }
    }

    fn view(&self) -> ProfileView {
        ProfileView {
            profile: self.profile.clone(),
            owned_cosmetics: self.owned.iter().cloned().collect(),
        }
    }
}

/// In-process store. Every operation runs under one lock, which is what makes
/// the purchase check-and-debit atomic.
pub struct MemoryProfileStore {
    catalog: Catalog,
    profiles: Mutex<HashMap<Uuid, StoredProfile>>,
}

impl MemoryProfileStore {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    fn with_profile<T>(
        &self,
        user_id: Uuid,
        f: impl FnOnce(&Catalog, &mut StoredProfile) -> Result<T, ProfileError>,
    ) -> Result<T, ProfileError> {
        let mut profiles = self.profiles.lock().map_err(|_| ProfileError::Unavailable)?;
        let stored = profiles
            .entry(user_id)
            .or_insert_with(|| StoredProfile::new(user_id));
        f(&self.catalog, stored)
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_or_create_profile(&self, user_id: Uuid) -> Result<ProfileView, ProfileError> {
        self.with_profile(user_id, |_, stored| Ok(stored.view()))
    }

    async fn purchase_cosmetic(
        &self,
        user_id: Uuid,
        cosmetic_id: &str,
    ) -> Result<ProfileView, ProfileError> {
        self.with_profile(user_id, |catalog, stored| {
            let price = catalog
                .price(cosmetic_id)
                .ok_or_else(|| ProfileError::UnknownCosmetic(cosmetic_id.to_string()))?;
            if stored.owned.contains(cosmetic_id) {
                return Err(ProfileError::AlreadyOwned(cosmetic_id.to_string()));
            }
            if stored.profile.coins < price {
                return Err(ProfileError::InsufficientFunds {
                    needed: price,
                    available: stored.profile.coins,
                });
            }
            stored.profile.coins -= price;
            stored.owned.insert(cosmetic_id.to_string());
            info!("{} bought {} for {}", user_id, cosmetic_id, price);
            Ok(stored.view())
        })
    }

    async fn equip_cosmetic(
        &self,
        user_id: Uuid,
        cosmetic_id: &str,
    ) -> Result<ProfileView, ProfileError> {
        self.with_profile(user_id, |_, stored| {
            if !stored.owned.contains(cosmetic_id) {
                return Err(ProfileError::NotOwned(cosmetic_id.to_string()));
            }
            stored.profile.equipped_cosmetic = cosmetic_id.to_string();
            Ok(stored.view())
        })
    }

    async fn award_round_currency(&self, batch: Vec<Award>) -> Result<(), ProfileError> {
        let mut profiles = self.profiles.lock().map_err(|_| ProfileError::Unavailable)?;
        for award in batch {
            let stored = profiles
                .entry(award.user_id)
                .or_insert_with(|| StoredProfile::new(award.user_id));
            stored.profile.coins += u64::from(award.amount);
            stored.profile.rounds_played += 1;
            if award.is_winner {
                stored.profile.rounds_won += 1;
            }
            debug!("Credited {} coins to {}", award.amount, award.user_id);
        }
        Ok(())
    }
}
