//! Read-only capability seam over the funding-round contracts.
//!
//! The traits here describe what the snapshot logic needs from the chain:
//! a registry that knows the active round, the round's metadata accessors,
//! and the native token's ERC20 views. `eth` provides the JSON-RPC backed
//! implementation; tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod eth;

pub use ethers::types::{Address, U256};

/// Failure modes of a remote contract read.
///
/// `Transport` covers anything the RPC layer reports (network errors,
/// node unavailable, undecodable ABI responses). `Malformed` is raised
/// when a value came back but cannot mean what the contract promises,
/// e.g. a deadline that does not fit a unix timestamp. Neither is ever
/// swallowed: any error aborts the whole snapshot build.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed on-chain value: {0}")]
    Malformed(String),
}

impl ChainError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Elliptic-curve public key of the round coordinator. Opaque data as far
/// as this crate is concerned; no curve checks are performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorPubKey {
    pub x: U256,
    pub y: U256,
}

/// One historical contribution log entry. `amount` is `None` when the log
/// matched the event topic but its arguments could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContributionEvent {
    pub amount: Option<U256>,
}

/// The registry (factory) contract tracking the active round.
#[async_trait]
pub trait RoundRegistry: Send + Sync {
    /// Address of the registry contract itself. The live matching pool is
    /// the token balance held at this address.
    fn address(&self) -> Address;

    /// Address of the currently active round. The all-zero address is the
    /// on-chain convention for "no active round".
    async fn current_round_address(&self) -> Result<Address, ChainError>;
}

/// Read accessors of a funding round contract.
#[async_trait]
pub trait FundingRound: Send + Sync {
    async fn coordinator_address(&self) -> Result<Address, ChainError>;
    async fn coordinator_pub_key(&self) -> Result<CoordinatorPubKey, ChainError>;
    async fn native_token_address(&self) -> Result<Address, ChainError>;
    /// Raw seconds-since-epoch, unvalidated.
    async fn contribution_deadline(&self) -> Result<U256, ChainError>;
    /// Raw seconds-since-epoch, unvalidated.
    async fn voting_deadline(&self) -> Result<U256, ChainError>;
    async fn is_finalized(&self) -> Result<bool, ChainError>;
    async fn is_cancelled(&self) -> Result<bool, ChainError>;
    /// Matching pool size recorded by the contract at finalization time.
    async fn matching_pool_size(&self) -> Result<U256, ChainError>;
    /// Every `NewContribution` log emitted by this round, starting at
    /// `from_block`, in chain order.
    async fn contribution_events(
        &self,
        from_block: u64,
    ) -> Result<Vec<ContributionEvent>, ChainError>;
}

/// ERC20 views of the round's native token.
#[async_trait]
pub trait NativeToken: Send + Sync {
    async fn symbol(&self) -> Result<String, ChainError>;
    async fn decimals(&self) -> Result<u8, ChainError>;
    async fn balance_of(&self, holder: Address) -> Result<U256, ChainError>;
}

/// Constructs round/token handles at addresses discovered during a build.
pub trait ContractBinder: Send + Sync {
    type Round: FundingRound;
    type Token: NativeToken;

    fn bind_round(&self, address: Address) -> Self::Round;
    fn bind_token(&self, address: Address) -> Self::Token;
}
