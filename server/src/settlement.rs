//! End-of-round ranking and currency awards.

use crate::config::RoomConfig;
use crate::profile::ProfileStore;
use crate::session::PlayerRecord;
use coinfall_shared::FinalStanding;
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// Currency owed to one linked profile for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Award {
    pub user_id: Uuid,
    pub amount: u32,
    pub is_winner: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// Rows for the `gameOver` frame, best score first.
    pub standings: Vec<FinalStanding>,
    /// Only players with a linked profile appear here.
    pub awards: Vec<Award>,
}

/// Orders players by score, highest first. Ties keep roster order.
pub fn rank(players: &[PlayerRecord]) -> Vec<&PlayerRecord> {
    let mut ranked: Vec<&PlayerRecord> = players.iter().collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked
}

/// Score converts 1:1 to coins, plus the participation bonus for everyone and
/// the winner bonus for the top player if they caught anything.
pub fn round_award(rank: usize, score: u32, config: &RoomConfig) -> u32 {
    let winner_bonus = if is_winner(rank, score) {
        config.winner_bonus
    } else {
        0
    };
    score + winner_bonus + config.participation_bonus
}

fn is_winner(rank: usize, score: u32) -> bool {
    rank == 0 && score > 0
}

pub fn settle(players: &[PlayerRecord], config: &RoomConfig) -> Settlement {
    let mut standings = Vec::with_capacity(players.len());
    let mut awards = Vec::new();

    for (position, player) in rank(players).into_iter().enumerate() {
        let winner = is_winner(position, player.score);
        let mut standing = player.standing();
        standing.is_winner = Some(winner);

        if let Some(user_id) = player.user_id {
            let amount = round_award(position, player.score, config);
            standing.coins_earned = Some(amount);
            awards.push(Award {
                user_id,
                amount,
                is_winner: winner,
            });
        }
        standings.push(standing);
    }

    Settlement { standings, awards }
}

/// Hands the batch to the profile store without waiting for it.
///
/// A failed write is logged and dropped; the round never blocks on it and the
/// batch is not retried.
pub fn dispatch(store: Arc<dyn ProfileStore>, awards: Vec<Award>) {
    if awards.is_empty() {
        return;
    }
    tokio::spawn(async move {
        let count = awards.len();
        match store.award_round_currency(awards).await {
            Ok(()) => info!("Settled round awards for {} players", count),
            Err(e) => warn!("Dropping round awards for {} players: {}", count, e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Catalog, MemoryProfileStore, ProfileError};
    use crate::session::PlayerRecord;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn linked(id: u32, score: u32) -> PlayerRecord {
        let mut player = PlayerRecord::new(
            id,
            id as u64,
            format!("p{}", id),
            "#fff".to_string(),
            None,
            Some(Uuid::from_u128(id as u128)),
            400.0,
        );
        player.score = score;
        player
    }

    #[test]
    fn test_award_amounts() {
        let config = RoomConfig::default();
        let players = vec![linked(1, 10), linked(2, 30), linked(3, 0)];

        let settlement = settle(&players, &config);
        let amounts: Vec<u32> = settlement.awards.iter().map(|a| a.amount).collect();

        assert_eq!(amounts, vec![105, 35, 25]);
        assert_eq!(settlement.standings[0].player_id, 2);
        assert_eq!(settlement.standings[0].is_winner, Some(true));
        assert_eq!(settlement.standings[1].is_winner, Some(false));
        assert!(settlement.awards[0].is_winner);
    }

    #[test]
    fn test_no_winner_bonus_without_score() {
        let config = RoomConfig::default();
        let settlement = settle(&[linked(1, 0), linked(2, 0)], &config);

        assert!(settlement.awards.iter().all(|a| a.amount == 25 && !a.is_winner));
        assert_eq!(settlement.standings[0].is_winner, Some(false));
    }

    #[test]
    fn test_unlinked_players_ranked_but_not_awarded() {
        let config = RoomConfig::default();
        let mut guest = linked(1, 50);
        guest.user_id = None;

        let settlement = settle(&[guest, linked(2, 20)], &config);

        assert_eq!(settlement.standings.len(), 2);
        assert_eq!(settlement.standings[0].coins_earned, None);
        assert_eq!(settlement.standings[0].is_winner, Some(true));
        assert_eq!(settlement.awards.len(), 1);
        assert_eq!(settlement.awards[0].amount, 45);
    }

    #[test]
    fn test_rank_is_stable_for_ties() {
        let players = vec![linked(1, 10), linked(2, 10), linked(3, 20)];
        let ids: Vec<u32> = rank(&players).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProfileStore for FailingStore {
        async fn get_or_create_profile(
            &self,
            _user_id: Uuid,
        ) -> Result<crate::profile::ProfileView, ProfileError> {
            Err(ProfileError::Unavailable)
        }

        async fn purchase_cosmetic(
            &self,
            _user_id: Uuid,
            _cosmetic_id: &str,
        ) -> Result<crate::profile::ProfileView, ProfileError> {
            Err(ProfileError::Unavailable)
        }

        async fn equip_cosmetic(
            &self,
            _user_id: Uuid,
            _cosmetic_id: &str,
        ) -> Result<crate::profile::ProfileView, ProfileError> {
            Err(ProfileError::Unavailable)
        }

        async fn award_round_currency(&self, _batch: Vec<Award>) -> Result<(), ProfileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProfileError::Unavailable)
        }
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failure_without_retry() {
        let store = Arc::new(FailingStore {
            calls: AtomicUsize::new(0),
        });
        dispatch(store.clone(), settle(&[linked(1, 10)], &RoomConfig::default()).awards);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_credits_profiles() {
        let store = Arc::new(MemoryProfileStore::new(Catalog::default()));
        let players = vec![linked(1, 30)];
        dispatch(store.clone(), settle(&players, &RoomConfig::default()).awards);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = store
            .get_or_create_profile(Uuid::from_u128(1))
            .await
            .unwrap();
        assert_eq!(view.profile.coins, 105);
        assert_eq!(view.profile.rounds_won, 1);
    }
}
