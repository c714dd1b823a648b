// src/blockchain/zksync_client.rs
//! zkSync Era state anchor.
//!
//! Submits `transitState(id, oldState, newState, isOldStateGenesis, proof)` to
//! the state contract through a zkSync wallet and reads the outcome from the
//! transaction receipt.
//!
//! A transition whose `newState` the contract already holds for the identity
//! is never sent again. `submit` answers with a `state:<id>:<newState>`
//! transaction id whose status comes from the contract's state record, and a
//! reverted duplicate of a landed transition reports the landed one.

use crate::blockchain::anchor::{AnchorError, AnchorStatus, AnchorTransition, StateAnchor};
use async_trait::async_trait;
use ethers_contract::BaseContract;
use ethers_core::{
    abi::parse_abi,
    types::{Address, Bytes, H256, U256},
    utils::hex,
};
use k256::ecdsa::SigningKey;
use log::{debug, info};
use std::sync::Arc;
use zksync_web3_rs::{
    contract::Contract,
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{Signer, Wallet},
    zks_wallet::ZKSWallet,
};

const STATE_ABI: [&str; 3] = [
    "function transitState(uint256 id, uint256 oldState, uint256 newState, bool isOldStateGenesis, bytes proof)",
    "function stateExists(uint256 id, uint256 state) view returns (bool)",
    "function getStateInfoByIdAndState(uint256 id, uint256 state) view returns ((uint256,uint256,uint256,uint256,uint256,uint256,uint256))",
];

/// Transaction ids of transitions found already anchored.
const LANDED_PREFIX: &str = "state:";

/// `(id, state, replacedByState, createdAtTimestamp, replacedAtTimestamp, createdAtBlock, replacedAtBlock)`
type StateInfo = (U256, U256, U256, U256, U256, U256, U256);

/// Gas limit for one state transition.
const TRANSITION_GAS: u64 = 3_000_000;

type EraWallet = ZKSWallet<SignerMiddleware<Arc<Provider<Http>>, Wallet<SigningKey>>, SigningKey>;

#[derive(Clone)]
pub struct ZkSyncStateAnchor {
    provider: Arc<Provider<Http>>,
    wallet: EraWallet,
    contract_address: Address,
    state_contract: BaseContract,
}

fn unavailable<E: std::fmt::Display>(e: E) -> AnchorError {
    AnchorError::Unavailable(e.to_string())
}

impl ZkSyncStateAnchor {
    /// Connects to `rpc_url` and signs with `private_key` (hex, `0x` optional).
    pub async fn new(rpc_url: &str, private_key: &str, contract_address: &str) -> Result<Self, AnchorError> {
        let provider = Arc::new(Provider::<Http>::try_from(rpc_url).map_err(|e| AnchorError::Config(e.to_string()))?);
        let key_bytes = hex::decode(private_key.trim_start_matches("0x")).map_err(|e| AnchorError::Config(e.to_string()))?;
        let signing_key = SigningKey::from_slice(&key_bytes).map_err(|e| AnchorError::Config(e.to_string()))?;
        let contract_address: Address = contract_address
            .parse()
            .map_err(|e| AnchorError::Config(format!("invalid contract address: {}", e)))?;
        let abi = parse_abi(&STATE_ABI).map_err(|e| AnchorError::Config(e.to_string()))?;

        let chain_id = provider.get_chainid().await.map_err(unavailable)?.as_u64();
        let l2_wallet = Wallet::from(signing_key).with_chain_id(chain_id);
        let signer_middleware = SignerMiddleware::new(provider.clone(), l2_wallet.clone());
        let wallet = ZKSWallet::new(l2_wallet, None, Some(signer_middleware), None)
            .map_err(|e| AnchorError::Config(e.to_string()))?;

        info!("zkSync anchor ready (chain {}, contract {:?})", chain_id, contract_address);
        Ok(Self { provider, wallet, contract_address, state_contract: BaseContract::from(abi) })
    }

    pub fn address(&self) -> Address {
        self.wallet.l2_address()
    }

    /// Block and timestamp at which `state` was anchored for `id`, if it was.
    async fn anchored(&self, id: U256, state: U256) -> Result<Option<(u64, i64)>, AnchorError> {
        let contract = Contract::new(self.contract_address, self.state_contract.clone(), self.provider.clone());
        let exists = contract
            .method::<_, bool>("stateExists", (id, state))
            .map_err(|e| AnchorError::Config(e.to_string()))?
            .call()
            .await
            .map_err(unavailable)?;
        if !exists {
            return Ok(None);
        }
        let info = contract
            .method::<_, StateInfo>("getStateInfoByIdAndState", (id, state))
            .map_err(|e| AnchorError::Config(e.to_string()))?
            .call()
            .await
            .map_err(unavailable)?;
        Ok(Some((info.5.as_u64(), info.3.as_u64() as i64)))
    }
}

fn landed_tx_id(id: U256, state: U256) -> String {
    format!("{}{:x}:{:x}", LANDED_PREFIX, id, state)
}

fn parse_landed_tx_id(tx_id: &str) -> Option<(U256, U256)> {
    let (id, state) = tx_id.strip_prefix(LANDED_PREFIX)?.split_once(':')?;
    Some((U256::from_str_radix(id, 16).ok()?, U256::from_str_radix(state, 16).ok()?))
}

/// `(id, newState)` of a `transitState` call's input data.
fn transition_in(state_contract: &BaseContract, input: &[u8]) -> Option<(U256, U256)> {
    if input.len() < 4 {
        return None;
    }
    let (id, _old, new, _genesis, _proof): (U256, U256, U256, bool, Bytes) =
        state_contract.decode("transitState", input).ok()?;
    Some((id, new))
}

/// Contract arguments of a transition.
fn transition_params(transition: &AnchorTransition) -> Result<(U256, U256, U256, bool, Bytes), AnchorError> {
    let id = transition
        .did
        .id_bytes()
        .ok_or_else(|| AnchorError::Rejected(format!("{} has no on-chain identifier", transition.did)))?;
    Ok((
        U256::from_little_endian(&id),
        U256::from_big_endian(&transition.previous_state.0),
        U256::from_big_endian(&transition.new_state.0),
        transition.is_old_state_genesis,
        Bytes::from(transition.proof.clone()),
    ))
}

#[async_trait]
impl StateAnchor for ZkSyncStateAnchor {
    async fn submit(&self, transition: &AnchorTransition) -> Result<String, AnchorError> {
        let params = transition_params(transition)?;
        let (id, new_state) = (params.0, params.2);
        if self.anchored(id, new_state).await?.is_some() {
            info!("state {} of {} is already anchored; not resending", transition.new_state, transition.did);
            return Ok(landed_tx_id(id, new_state));
        }

        let era = self.wallet.get_era_provider().map_err(unavailable)?;
        let contract = Contract::new(self.contract_address, self.state_contract.clone(), era);

        let call = contract
            .method::<_, H256>("transitState", params)
            .map_err(|e| AnchorError::Config(e.to_string()))?
            .gas(U256::from(TRANSITION_GAS));
        let pending = call.send().await.map_err(unavailable)?;
        let tx_hash = pending.tx_hash();
        debug!("submitted transitState for {}: {:?}", transition.did, tx_hash);
        Ok(format!("{:?}", tx_hash))
    }

    async fn status(&self, tx_id: &str) -> Result<AnchorStatus, AnchorError> {
        if let Some((id, state)) = parse_landed_tx_id(tx_id) {
            return Ok(match self.anchored(id, state).await? {
                Some((block, timestamp)) => AnchorStatus::Confirmed { block, timestamp },
                None => AnchorStatus::Failed { reason: format!("state {:x} of identity {:x} is not anchored", state, id) },
            });
        }
        let hash: H256 = tx_id.parse().map_err(|_| AnchorError::UnknownTransaction(tx_id.to_string()))?;
        let receipt = match self.provider.get_transaction_receipt(hash).await.map_err(unavailable)? {
            Some(receipt) => receipt,
            None => return Ok(AnchorStatus::Pending),
        };
        if receipt.status.map(|s| s.as_u64()) != Some(1) {
            // A duplicate of a landed transition reverts on the old state check.
            let sent = self.provider.get_transaction(hash).await.map_err(unavailable)?;
            if let Some((id, state)) = sent.and_then(|tx| transition_in(&self.state_contract, tx.input.as_ref())) {
                if let Some((block, timestamp)) = self.anchored(id, state).await? {
                    debug!("{} reverted but state {:x} is anchored", tx_id, state);
                    return Ok(AnchorStatus::Confirmed { block, timestamp });
                }
            }
            return Ok(AnchorStatus::Failed { reason: "transaction reverted".into() });
        }
        let block_number = match receipt.block_number {
            Some(number) => number,
            None => return Ok(AnchorStatus::Pending),
        };
        let block = self.provider.get_block(block_number).await.map_err(unavailable)?;
        let timestamp = block.map(|b| b.timestamp.as_u64() as i64).unwrap_or_default();
        Ok(AnchorStatus::Confirmed { block: block_number.as_u64(), timestamp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::did::Did;
    use crate::models::state::KeyType;
    use crate::utils::crypto::Hash;

    #[test]
    fn test_state_abi_parses() {
        let abi = parse_abi(&STATE_ABI).unwrap();
        assert!(abi.function("transitState").is_ok());
        assert!(abi.function("stateExists").is_ok());
        assert_eq!(abi.function("getStateInfoByIdAndState").unwrap().outputs.len(), 1);
    }

    #[test]
    fn test_landed_tx_id() {
        let (id, state) = (U256::from(0x1234u64), U256::MAX);
        let tx_id = landed_tx_id(id, state);
        assert!(tx_id.starts_with(LANDED_PREFIX));
        assert_eq!(parse_landed_tx_id(&tx_id), Some((id, state)));
        assert_eq!(parse_landed_tx_id(&format!("{:?}", H256::zero())), None);
        assert_eq!(parse_landed_tx_id("state:zz:01"), None);
    }

    #[test]
    fn test_reverted_input_names_its_transition() {
        let state_contract = BaseContract::from(parse_abi(&STATE_ABI).unwrap());
        let did = Did::from_genesis("iden3", "zksync", KeyType::BabyJubJub, &Hash::from_u64(5));
        let transition = AnchorTransition {
            did,
            previous_state: Hash::from_u64(5),
            new_state: Hash::from_u64(6),
            is_old_state_genesis: false,
            proof: vec![1, 2, 3],
        };
        let params = transition_params(&transition).unwrap();
        let input = state_contract.encode("transitState", params.clone()).unwrap();
        assert_eq!(transition_in(&state_contract, input.as_ref()), Some((params.0, U256::from(6))));
        assert_eq!(transition_in(&state_contract, &[0u8; 3]), None);
    }

    #[test]
    fn test_transition_params() {
        let did = Did::from_genesis("iden3", "zksync", KeyType::BabyJubJub, &Hash::from_u64(77));
        let transition = AnchorTransition {
            did,
            previous_state: Hash::from_u64(77),
            new_state: Hash::from_u64(78),
            is_old_state_genesis: true,
            proof: vec![0xaa],
        };
        let (_, old, new, genesis, proof) = transition_params(&transition).unwrap();
        assert_eq!(old, U256::from(77));
        assert_eq!(new, U256::from(78));
        assert!(genesis);
        assert_eq!(proof.to_vec(), vec![0xaa]);

        let foreign = AnchorTransition { did: Did::parse("did:x:alice").unwrap(), ..transition };
        assert!(matches!(transition_params(&foreign), Err(AnchorError::Rejected(_))));
    }
}
