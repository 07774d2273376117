//! Point-in-time view of the active funding round.
//!
//! `RoundSnapshotBuilder` combines the registry's active-round pointer,
//! the round and token metadata reads, and the historical contribution
//! logs into one immutable `RoundSnapshot`. The result is either a
//! complete, internally consistent snapshot or nothing: any failed read
//! aborts the build, and an inactive registry yields `Ok(None)`.

use std::fmt;

use bigdecimal::num_bigint::{BigInt, Sign};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use chain::{Address, ChainError, ContributionEvent, CoordinatorPubKey, U256};
use chain::{ContractBinder, FundingRound, NativeToken, RoundRegistry};

/// Lifecycle phase of a round. Cancellation and finalization are terminal
/// flags on the contract; the three time-based phases are derived from the
/// deadlines at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    Contributing,
    Voting,
    Tallying,
    Finalized,
    Cancelled,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStatus::Contributing => "Contributing",
            RoundStatus::Voting => "Voting",
            RoundStatus::Tallying => "Tallying",
            RoundStatus::Finalized => "Finalized",
            RoundStatus::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// Immutable snapshot of the active round.
///
/// Monetary fields are scaled by the token's decimals and are exact:
/// `total_funds == matching_pool + contributions` holds by construction.
#[derive(Debug, Clone, Serialize)]
pub struct RoundSnapshot {
    pub round_address: Address,
    pub coordinator_address: Address,
    pub coordinator_pub_key: CoordinatorPubKey,
    pub native_token_address: Address,
    pub native_token_symbol: String,
    pub native_token_decimals: u8,
    pub status: RoundStatus,
    pub contribution_deadline: DateTime<Utc>,
    pub voting_deadline: DateTime<Utc>,
    pub total_funds: BigDecimal,
    pub matching_pool: BigDecimal,
    pub contributions: BigDecimal,
}

pub struct RoundSnapshotBuilder<C> {
    chain: C,
}

impl<C> RoundSnapshotBuilder<C>
where
    C: RoundRegistry + ContractBinder,
{
    pub fn new(chain: C) -> Self {
        Self { chain }
    }

    /// Builds a snapshot against the current clock. The clock is read once
    /// so both deadline comparisons see the same instant.
    pub async fn build(&self) -> Result<Option<RoundSnapshot>, ChainError> {
        self.build_at(Utc::now()).await
    }

    /// Builds a snapshot evaluating the time-based phases at `now`.
    pub async fn build_at(&self, now: DateTime<Utc>) -> Result<Option<RoundSnapshot>, ChainError> {
        let round_address = self.chain.current_round_address().await?;
        if round_address == Address::zero() {
            return Ok(None);
        }

        // The metadata reads are independent of each other, and the log
        // scan only needs the round address, so everything fans out here.
        // All reads land before status derivation.
        let round = self.chain.bind_round(round_address);
        let (
            coordinator_address,
            coordinator_pub_key,
            native_token_address,
            contribution_deadline_raw,
            voting_deadline_raw,
            is_finalized,
            is_cancelled,
            matching_pool_size,
            events,
        ) = tokio::try_join!(
            round.coordinator_address(),
            round.coordinator_pub_key(),
            round.native_token_address(),
            round.contribution_deadline(),
            round.voting_deadline(),
            round.is_finalized(),
            round.is_cancelled(),
            round.matching_pool_size(),
            round.contribution_events(0),
        )?;

        let token = self.chain.bind_token(native_token_address);
        let (native_token_symbol, native_token_decimals, registry_balance) = tokio::try_join!(
            token.symbol(),
            token.decimals(),
            token.balance_of(self.chain.address()),
        )?;

        let contribution_deadline =
            deadline_from_secs(contribution_deadline_raw, "contributionDeadline")?;
        let voting_deadline = deadline_from_secs(voting_deadline_raw, "votingDeadline")?;

        let (status, matching_pool_raw) = if is_cancelled {
            // A cancelled round holds no matching funds by definition,
            // whatever the registry's live balance says.
            (RoundStatus::Cancelled, BigInt::from(0u8))
        } else if is_finalized {
            // Finalization freezes the pool size in the contract; the live
            // balance is no longer authoritative.
            (RoundStatus::Finalized, u256_to_bigint(matching_pool_size))
        } else {
            let status = if now < contribution_deadline {
                RoundStatus::Contributing
            } else if now < voting_deadline {
                RoundStatus::Voting
            } else {
                RoundStatus::Tallying
            };
            (status, u256_to_bigint(registry_balance))
        };

        // Logs that matched the topic but carried no decodable arguments
        // count as zero rather than failing the build.
        let contributions_raw: BigInt = events
            .iter()
            .filter_map(|ev| ev.amount)
            .map(u256_to_bigint)
            .sum();
        let total_funds_raw = &matching_pool_raw + &contributions_raw;

        Ok(Some(RoundSnapshot {
            round_address,
            coordinator_address,
            coordinator_pub_key,
            native_token_address,
            native_token_symbol,
            native_token_decimals,
            status,
            contribution_deadline,
            voting_deadline,
            total_funds: scale_amount(total_funds_raw, native_token_decimals),
            matching_pool: scale_amount(matching_pool_raw, native_token_decimals),
            contributions: scale_amount(contributions_raw, native_token_decimals),
        }))
    }
}

fn u256_to_bigint(value: U256) -> BigInt {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    BigInt::from_bytes_be(Sign::Plus, &buf)
}

/// Moves the decimal point of a raw token amount left by `decimals`
/// places without loss of precision.
fn scale_amount(raw: BigInt, decimals: u8) -> BigDecimal {
    BigDecimal::new(raw, i64::from(decimals))
}

fn deadline_from_secs(raw: U256, field: &str) -> Result<DateTime<Utc>, ChainError> {
    if raw > U256::from(i64::MAX as u64) {
        return Err(ChainError::malformed(format!(
            "{field} does not fit a unix timestamp: {raw}"
        )));
    }
    DateTime::from_timestamp(raw.as_u64() as i64, 0)
        .ok_or_else(|| ChainError::malformed(format!("{field} is out of range: {raw}")))
}
