//! JSON-RPC ledger backed by the deployed platform contract.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::{
    contract::{abigen, parse_log, ContractError, ContractFactory, EthEvent},
    middleware::SignerMiddleware,
    providers::{Http, Middleware, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, Bytes, TransactionReceipt, U256, U64},
};
use tracing::{debug, info};

use super::{ContributionId, EventKind, Ledger, LedgerEvent, ReviewResult};
use crate::{
    calldata::Calldata, error::LedgerError, toolchain::VerifierContract,
    utils::EncryptedCoordinates,
};

abigen!(
    CsPlatform,
    r#"[
        function createContribution(string imageUrl) external
        function assignContribution() external
        function updateCoordinates(uint256 contributionId, bytes coordinates) external
        function reviewContribution(uint256 contributionId, uint8 result) external
        function updateVerifier(address verifier, uint256 contributionId) external
        event ContributionCreated(address participant, string imageUrl, uint256 contributionId)
        event ContributionAssigned(address participant, string imageUrl, uint256 contributionId, address reviewer)
        event CoordinateUpdated(uint256 contributionId, address participant, bytes coordinates)
        event ContributionReviewed(uint256 contributionId, address participant, address reviewer, string imageUrl, uint8 result)
        event VerifierUpdated(uint256 contributionId, address participant, address reviewer, string imageUrl, address verifier)
    ]"#
);

abigen!(
    Groth16Verifier,
    r#"[
        function verifyProof(uint256[2] _pA, uint256[2][2] _pB, uint256[2] _pC, uint256[1] _pubSignals) external view returns (bool)
    ]"#
);

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

pub struct EvmLedger {
    provider: Provider<Http>,
    platform: Address,
    chain_id: u64,
}

impl EvmLedger {
    pub async fn connect(rpc_url: &str, platform: Address) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(rpc)?;
        let chain_id = provider.get_chainid().await.map_err(rpc)?.as_u64();
        info!(rpc_url, chain_id, platform = ?platform, "Connected to ledger");
        Ok(Self {
            provider,
            platform,
            chain_id,
        })
    }

    fn client(&self, wallet: &LocalWallet) -> Arc<Client> {
        Arc::new(SignerMiddleware::new(
            self.provider.clone(),
            wallet.clone().with_chain_id(self.chain_id),
        ))
    }

    fn platform(&self, wallet: &LocalWallet) -> CsPlatform<Client> {
        CsPlatform::new(self.platform, self.client(wallet))
    }

    fn reader(&self) -> CsPlatform<Provider<Http>> {
        CsPlatform::new(self.platform, Arc::new(self.provider.clone()))
    }

    async fn query<E: EthEvent>(&self) -> Result<Vec<E>, LedgerError> {
        self.reader()
            .event::<E>()
            .from_block(0u64)
            .query()
            .await
            .map_err(contract_error)
    }
}

fn rpc(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Rpc(e.to_string())
}

fn contract_error<M: Middleware>(e: ContractError<M>) -> LedgerError {
    if e.is_revert() {
        LedgerError::Reverted(
            e.decode_revert::<String>()
                .unwrap_or_else(|| e.to_string()),
        )
    } else {
        LedgerError::Rpc(e.to_string())
    }
}

fn id_from(value: U256) -> Result<ContributionId, LedgerError> {
    if value > U256::from(u64::MAX) {
        return Err(LedgerError::Decode(format!("contribution id {value} overflows u64")));
    }
    Ok(ContributionId(value.as_u64()))
}

/// Await the transaction's receipt and fail on revert.
async fn confirm<M: Middleware>(
    call: ethers::contract::builders::ContractCall<M, ()>,
) -> Result<TransactionReceipt, LedgerError> {
    let pending = call.send().await.map_err(contract_error)?;
    let receipt = pending.await.map_err(rpc)?.ok_or(LedgerError::Dropped)?;
    if receipt.status != Some(U64::one()) {
        return Err(LedgerError::Reverted(format!(
            "transaction {:?} failed",
            receipt.transaction_hash
        )));
    }
    debug!(tx = ?receipt.transaction_hash, gas_used = ?receipt.gas_used, "Transaction confirmed");
    Ok(receipt)
}

fn first_event<E: EthEvent>(receipt: &TransactionReceipt) -> Result<E, LedgerError> {
    receipt
        .logs
        .iter()
        .find_map(|log| parse_log::<E>(log.clone()).ok())
        .ok_or_else(|| LedgerError::Decode(format!("receipt has no {} event", E::name())))
}

#[async_trait]
impl Ledger for EvmLedger {
    async fn create_contribution(
        &self,
        participant: &LocalWallet,
        image_url: &str,
    ) -> Result<ContributionId, LedgerError> {
        let receipt = confirm(
            self.platform(participant)
                .create_contribution(image_url.to_string()),
        )
        .await?;
        let event: ContributionCreatedFilter = first_event(&receipt)?;
        id_from(event.contribution_id)
    }

    async fn assign_contribution(&self, reviewer: &LocalWallet) -> Result<ContributionId, LedgerError> {
        let receipt = confirm(self.platform(reviewer).assign_contribution()).await?;
        let event: ContributionAssignedFilter = first_event(&receipt)?;
        id_from(event.contribution_id)
    }

    async fn update_coordinates(
        &self,
        participant: &LocalWallet,
        id: ContributionId,
        coordinates: &EncryptedCoordinates,
    ) -> Result<(), LedgerError> {
        confirm(
            self.platform(participant)
                .update_coordinates(U256::from(id.0), Bytes::from(coordinates.to_bytes())),
        )
        .await?;
        Ok(())
    }

    async fn review_contribution(
        &self,
        reviewer: &LocalWallet,
        id: ContributionId,
        result: ReviewResult,
    ) -> Result<(), LedgerError> {
        confirm(
            self.platform(reviewer)
                .review_contribution(U256::from(id.0), result as u8),
        )
        .await?;
        Ok(())
    }

    async fn update_verifier(
        &self,
        participant: &LocalWallet,
        id: ContributionId,
        verifier: Address,
    ) -> Result<(), LedgerError> {
        confirm(
            self.platform(participant)
                .update_verifier(verifier, U256::from(id.0)),
        )
        .await?;
        info!(id = %id, verifier = ?verifier, "Verifier linked");
        Ok(())
    }

    async fn deploy_verifier(
        &self,
        deployer: &LocalWallet,
        contract: &VerifierContract,
    ) -> Result<Address, LedgerError> {
        if contract.bytecode.is_empty() {
            return Err(LedgerError::Reverted(format!(
                "verifier for circuit {} has no bytecode",
                contract.circuit_id
            )));
        }
        let factory = ContractFactory::new(
            GROTH16VERIFIER_ABI.clone(),
            Bytes::from(contract.bytecode.clone()),
            self.client(deployer),
        );
        let deployed = factory
            .deploy(())
            .map_err(contract_error)?
            .send()
            .await
            .map_err(contract_error)?;
        Ok(deployed.address())
    }

    async fn verify_proof(
        &self,
        caller: &LocalWallet,
        verifier: Address,
        calldata: &Calldata,
    ) -> Result<bool, LedgerError> {
        let contract = Groth16Verifier::new(verifier, self.client(caller));
        contract
            .verify_proof(calldata.a, calldata.b, calldata.c, calldata.input)
            .from(caller.address())
            .call()
            .await
            .map_err(contract_error)
    }

    async fn events(&self, kind: EventKind) -> Result<Vec<LedgerEvent>, LedgerError> {
        let events = match kind {
            EventKind::ContributionCreated => self
                .query::<ContributionCreatedFilter>()
                .await?
                .into_iter()
                .map(|e| {
                    Ok(LedgerEvent::ContributionCreated {
                        participant: e.participant,
                        image_url: e.image_url,
                        id: id_from(e.contribution_id)?,
                    })
                })
                .collect::<Result<Vec<_>, LedgerError>>()?,
            EventKind::ContributionAssigned => self
                .query::<ContributionAssignedFilter>()
                .await?
                .into_iter()
                .map(|e| {
                    Ok(LedgerEvent::ContributionAssigned {
                        id: id_from(e.contribution_id)?,
                        participant: e.participant,
                        image_url: e.image_url,
                        reviewer: e.reviewer,
                    })
                })
                .collect::<Result<Vec<_>, LedgerError>>()?,
            EventKind::CoordinateUpdated => self
                .query::<CoordinateUpdatedFilter>()
                .await?
                .into_iter()
                .map(|e| {
                    Ok(LedgerEvent::CoordinateUpdated {
                        id: id_from(e.contribution_id)?,
                        participant: e.participant,
                        coordinates: EncryptedCoordinates::from_bytes(&e.coordinates)?,
                    })
                })
                .collect::<Result<Vec<_>, LedgerError>>()?,
            EventKind::ContributionReviewed => self
                .query::<ContributionReviewedFilter>()
                .await?
                .into_iter()
                .map(|e| {
                    Ok(LedgerEvent::ContributionReviewed {
                        id: id_from(e.contribution_id)?,
                        participant: e.participant,
                        reviewer: e.reviewer,
                        image_url: e.image_url,
                        result: ReviewResult::try_from(e.result)?,
                    })
                })
                .collect::<Result<Vec<_>, LedgerError>>()?,
            EventKind::VerifierUpdated => self
                .query::<VerifierUpdatedFilter>()
                .await?
                .into_iter()
                .map(|e| {
                    Ok(LedgerEvent::VerifierUpdated {
                        id: id_from(e.contribution_id)?,
                        participant: e.participant,
                        reviewer: e.reviewer,
                        image_url: e.image_url,
                        verifier: e.verifier,
                    })
                })
                .collect::<Result<Vec<_>, LedgerError>>()?,
        };
        Ok(events)
    }
}
