//! JSON-RPC backed implementation of the capability traits.
//!
//! Contracts are bound with runtime-parsed human-readable ABIs covering
//! only the read methods this service consumes. Event logs are fetched
//! raw and decoded per entry so that a single undecodable log does not
//! fail the whole query.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{parse_abi, Abi, RawLog};
use ethers::contract::{Contract, EthEvent};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::Filter;

use crate::{
    Address, ChainError, ContractBinder, ContributionEvent, CoordinatorPubKey, FundingRound,
    NativeToken, RoundRegistry, U256,
};

const REGISTRY_ABI: &[&str] = &["function getCurrentRound() view returns (address)"];

const ROUND_ABI: &[&str] = &[
    "function maci() view returns (address)",
    "function coordinatorPubKey() view returns (uint256, uint256)",
    "function nativeToken() view returns (address)",
    "function contributionDeadline() view returns (uint256)",
    "function votingDeadline() view returns (uint256)",
    "function isFinalized() view returns (bool)",
    "function isCancelled() view returns (bool)",
    "function matchingPoolSize() view returns (uint256)",
];

const TOKEN_ABI: &[&str] = &[
    "function symbol() view returns (string)",
    "function decimals() view returns (uint8)",
    "function balanceOf(address) view returns (uint256)",
];

#[derive(Debug, Clone, EthEvent)]
#[ethevent(name = "NewContribution")]
pub struct NewContribution {
    #[ethevent(indexed)]
    pub sender: Address,
    pub amount: U256,
}

/// Shared provider plus the parsed ABIs needed to bind contracts.
#[derive(Clone)]
pub struct EthChain {
    client: Arc<Provider<Http>>,
    registry_address: Address,
    registry: Contract<Provider<Http>>,
    round_abi: Abi,
    token_abi: Abi,
}

impl EthChain {
    pub fn connect(rpc_url: &str, registry_address: Address) -> Result<Self, ChainError> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(ChainError::transport)?;
        let client = Arc::new(provider);
        let registry_abi = parse_abi(REGISTRY_ABI).map_err(ChainError::transport)?;
        let round_abi = parse_abi(ROUND_ABI).map_err(ChainError::transport)?;
        let token_abi = parse_abi(TOKEN_ABI).map_err(ChainError::transport)?;
        let registry = Contract::new(registry_address, registry_abi, Arc::clone(&client));
        Ok(Self {
            client,
            registry_address,
            registry,
            round_abi,
            token_abi,
        })
    }
}

#[async_trait]
impl RoundRegistry for EthChain {
    fn address(&self) -> Address {
        self.registry_address
    }

    async fn current_round_address(&self) -> Result<Address, ChainError> {
        self.registry
            .method::<_, Address>("getCurrentRound", ())
            .map_err(ChainError::transport)?
            .call()
            .await
            .map_err(ChainError::transport)
    }
}

impl ContractBinder for EthChain {
    type Round = EthRound;
    type Token = EthToken;

    fn bind_round(&self, address: Address) -> EthRound {
        EthRound {
            client: Arc::clone(&self.client),
            address,
            contract: Contract::new(address, self.round_abi.clone(), Arc::clone(&self.client)),
        }
    }

    fn bind_token(&self, address: Address) -> EthToken {
        EthToken {
            contract: Contract::new(address, self.token_abi.clone(), Arc::clone(&self.client)),
        }
    }
}

pub struct EthRound {
    client: Arc<Provider<Http>>,
    address: Address,
    contract: Contract<Provider<Http>>,
}

impl EthRound {
    async fn read<D: ethers::abi::Detokenize + Send>(&self, name: &str) -> Result<D, ChainError> {
        self.contract
            .method::<_, D>(name, ())
            .map_err(ChainError::transport)?
            .call()
            .await
            .map_err(ChainError::transport)
    }
}

#[async_trait]
impl FundingRound for EthRound {
    async fn coordinator_address(&self) -> Result<Address, ChainError> {
        self.read("maci").await
    }

    async fn coordinator_pub_key(&self) -> Result<CoordinatorPubKey, ChainError> {
        let (x, y) = self.read::<(U256, U256)>("coordinatorPubKey").await?;
        Ok(CoordinatorPubKey { x, y })
    }

    async fn native_token_address(&self) -> Result<Address, ChainError> {
        self.read("nativeToken").await
    }

    async fn contribution_deadline(&self) -> Result<U256, ChainError> {
        self.read("contributionDeadline").await
    }

    async fn voting_deadline(&self) -> Result<U256, ChainError> {
        self.read("votingDeadline").await
    }

    async fn is_finalized(&self) -> Result<bool, ChainError> {
        self.read("isFinalized").await
    }

    async fn is_cancelled(&self) -> Result<bool, ChainError> {
        self.read("isCancelled").await
    }

    async fn matching_pool_size(&self) -> Result<U256, ChainError> {
        self.read("matchingPoolSize").await
    }

    async fn contribution_events(
        &self,
        from_block: u64,
    ) -> Result<Vec<ContributionEvent>, ChainError> {
        let filter = Filter::new()
            .address(self.address)
            .event(&NewContribution::abi_signature())
            .from_block(from_block);
        let logs = self
            .client
            .get_logs(&filter)
            .await
            .map_err(ChainError::transport)?;
        Ok(logs
            .into_iter()
            .map(|log| {
                let raw = RawLog {
                    topics: log.topics,
                    data: log.data.to_vec(),
                };
                ContributionEvent {
                    amount: NewContribution::decode_log(&raw).ok().map(|ev| ev.amount),
                }
            })
            .collect())
    }
}

pub struct EthToken {
    contract: Contract<Provider<Http>>,
}

#[async_trait]
impl NativeToken for EthToken {
    async fn symbol(&self) -> Result<String, ChainError> {
        self.contract
            .method::<_, String>("symbol", ())
            .map_err(ChainError::transport)?
            .call()
            .await
            .map_err(ChainError::transport)
    }

    async fn decimals(&self) -> Result<u8, ChainError> {
        // Detokenized as uint256; the ABI type is uint8 so the range check
        // only trips on a token that violates its own interface.
        let raw = self
            .contract
            .method::<_, U256>("decimals", ())
            .map_err(ChainError::transport)?
            .call()
            .await
            .map_err(ChainError::transport)?;
        if raw > U256::from(u8::MAX) {
            return Err(ChainError::malformed(format!(
                "token decimals out of range: {raw}"
            )));
        }
        Ok(raw.as_u64() as u8)
    }

    async fn balance_of(&self, holder: Address) -> Result<U256, ChainError> {
        self.contract
            .method::<_, U256>("balanceOf", holder)
            .map_err(ChainError::transport)?
            .call()
            .await
            .map_err(ChainError::transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    #[test]
    fn connect_parses_all_abis() {
        let chain = EthChain::connect("http://127.0.0.1:8545", Address::zero())
            .expect("abis should parse");
        assert_eq!(chain.address(), Address::zero());
    }

    #[test]
    fn contribution_event_signature_is_stable() {
        assert_eq!(
            NewContribution::abi_signature(),
            "NewContribution(address,uint256)"
        );
    }

    #[test]
    fn decodes_contribution_log() {
        let sender = Address::from_low_u64_be(7);
        let mut data = [0u8; 32];
        U256::from(42u64).to_big_endian(&mut data);
        let raw = RawLog {
            topics: vec![NewContribution::signature(), H256::from(sender)],
            data: data.to_vec(),
        };
        let ev = NewContribution::decode_log(&raw).expect("log should decode");
        assert_eq!(ev.sender, sender);
        assert_eq!(ev.amount, U256::from(42u64));
    }

    #[test]
    fn truncated_log_fails_to_decode() {
        let raw = RawLog {
            topics: vec![NewContribution::signature()],
            data: Vec::new(),
        };
        assert!(NewContribution::decode_log(&raw).is_err());
    }
}
