//! Cyclo leveraged vault: lock sFLR for cysFLR plus an ERC-1155 receipt
//!
//! The receipt id is the sFLR price at lock time. Unlocking burns cysFLR
//! together with the same amount of that receipt, so the burn has to match
//! the recorded receipt balance exactly.

use super::{
    abi, decoded, ensure_allowance, require, unsupported, ConnectorContext, ProtocolConnector, Request,
};
use crate::error::{AgentError, AgentResult};
use crate::math::ReceiptId;
use crate::operation::{Bound, Operation, OperationKind, Protocol};
use crate::tx::engine::Execution;

use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use tracing::{info, warn};

const PROTOCOL: Protocol = Protocol::Cyclo;

/// Result of a lock: the execution and the receipt it minted, when observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub execution: Execution,
    pub receipt_id: Option<ReceiptId>,
    /// cysFLR minted under `receipt_id`
    pub minted: Option<U256>,
}

pub struct Cyclo {
    ctx: ConnectorContext,
}

impl Cyclo {
    pub fn new(ctx: ConnectorContext) -> Self {
        Self { ctx }
    }

    fn vault(&self, operation: &'static str) -> AgentResult<Address> {
        require(self.ctx.contracts.cyclo_cysflr_vault, PROTOCOL, operation, "Cyclo cysFLR vault")
    }

    fn receipt_contract(&self, operation: &'static str) -> AgentResult<Address> {
        require(self.ctx.contracts.cyclo_cysflr_receipt, PROTOCOL, operation, "Cyclo receipt")
    }

    pub fn encode_lock(&self, assets: U256, recipient: Address, min_share_ratio: U256) -> AgentResult<Operation> {
        let to = self.vault("lock")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::MintAgainstCollateral,
            "lock",
            to,
            abi::encode_call(
                "deposit(uint256,address,uint256,bytes)",
                &[
                    Token::Uint(assets),
                    Token::Address(recipient),
                    Token::Uint(min_share_ratio),
                    Token::Bytes(Vec::new()),
                ],
            ),
        )
        .with_bound(Bound::MinShareRatio(min_share_ratio)))
    }

    pub fn encode_unlock(
        &self,
        shares: U256,
        recipient: Address,
        owner: Address,
        receipt_id: ReceiptId,
    ) -> AgentResult<Operation> {
        let to = self.vault("unlock")?;
        Ok(Operation::new(
            PROTOCOL,
            OperationKind::BurnAndUnlock,
            "unlock",
            to,
            abi::encode_call(
                "redeem(uint256,address,address,uint256,bytes)",
                &[
                    Token::Uint(shares),
                    Token::Address(recipient),
                    Token::Address(owner),
                    Token::Uint(receipt_id.price()),
                    Token::Bytes(Vec::new()),
                ],
            ),
        ))
    }

    /// Lock `assets` sFLR, minting cysFLR and a receipt to `recipient`
    pub async fn lock(&self, assets: U256, recipient: Address, min_share_ratio: U256) -> AgentResult<Lock> {
        let operation = self.encode_lock(assets, recipient, min_share_ratio)?;
        let account = self.ctx.require_account(PROTOCOL, "lock")?;
        let asset = self.vault_asset().await?;
        ensure_allowance(&self.ctx, PROTOCOL, "lock", asset, account, operation.to, assets).await?;

        info!(
            "Locking {} sFLR in Cyclo for {:?} (min share ratio {})",
            assets, recipient, min_share_ratio
        );
        let execution = self.ctx.execute(operation).await?;

        let minted = execution.receipt().and_then(|receipt| {
            receipt
                .logs
                .iter()
                .filter_map(abi::decode_transfer_single)
                .find(|transfer| transfer.from.is_zero() && transfer.to == recipient)
        });
        if execution.is_confirmed() && minted.is_none() {
            warn!("Lock {:?} confirmed without a receipt mint log", execution.tx_hash);
        }

        Ok(Lock {
            receipt_id: minted.as_ref().map(|t| ReceiptId::from_price(t.id)),
            minted: minted.map(|t| t.value),
            execution,
        })
    }

    /// Burn `shares` cysFLR with receipt `receipt_id` and release the sFLR to `recipient`
    pub async fn unlock(
        &self,
        shares: U256,
        recipient: Address,
        owner: Address,
        receipt_id: ReceiptId,
    ) -> AgentResult<Execution> {
        let operation = self.encode_unlock(shares, recipient, owner, receipt_id)?;
        let recorded = self.receipt_balance(owner, receipt_id).await?;
        receipt_id
            .ensure_exact_burn(recorded, shares)
            .map_err(|e| AgentError::configuration(PROTOCOL, "unlock", e.to_string()))?;

        info!(
            "Unlocking {} cysFLR from Cyclo receipt {} to {:?}",
            shares, receipt_id.price(), recipient
        );
        self.ctx.execute(operation).await
    }

    pub async fn cysflr_balance(&self, owner: Address) -> AgentResult<U256> {
        let to = self.vault("cysflr_balance")?;
        let calldata = abi::encode_call("balanceOf(address)", &[Token::Address(owner)]);
        self.read_uint("cysflr_balance", to, calldata).await
    }

    /// Receipt balance of `owner` under `receipt_id`
    pub async fn receipt_balance(&self, owner: Address, receipt_id: ReceiptId) -> AgentResult<U256> {
        let to = self.receipt_contract("receipt_balance")?;
        let calldata = abi::encode_call(
            "balanceOf(address,uint256)",
            &[Token::Address(owner), Token::Uint(receipt_id.price())],
        );
        self.read_uint("receipt_balance", to, calldata).await
    }

    /// Collateral token of the vault (sFLR)
    pub async fn vault_asset(&self) -> AgentResult<Address> {
        let to = self.vault("vault_asset")?;
        let output = self
            .ctx
            .read(PROTOCOL, "vault_asset", to, abi::encode_call("asset()", &[]))
            .await?;
        decoded(PROTOCOL, "vault_asset", abi::decode_address(&output))
    }

    /// cysFLR minted for locking `assets` at `price` (1e18-scaled)
    pub fn preview_lock(&self, price: U256, assets: U256) -> AgentResult<U256> {
        ReceiptId::from_price(price)
            .shares_for_assets(assets)
            .map_err(|e| AgentError::configuration(PROTOCOL, "preview_lock", e.to_string()))
    }

    async fn read_uint(&self, operation: &'static str, to: Address, calldata: Bytes) -> AgentResult<U256> {
        let output = self.ctx.read(PROTOCOL, operation, to, calldata).await?;
        decoded(PROTOCOL, operation, abi::decode_uint(&output))
    }
}

impl ProtocolConnector for Cyclo {
    fn protocol(&self) -> Protocol {
        PROTOCOL
    }

    fn context(&self) -> &ConnectorContext {
        &self.ctx
    }

    fn encode(&self, request: &Request) -> AgentResult<Operation> {
        match request {
            Request::Lock {
                assets,
                recipient,
                min_share_ratio,
            } => self.encode_lock(*assets, *recipient, *min_share_ratio),
            Request::Unlock {
                shares,
                recipient,
                owner,
                receipt_id,
            } => self.encode_unlock(*shares, *recipient, *owner, *receipt_id),
            other => Err(unsupported(PROTOCOL, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::LogRecord;
    use crate::error::ErrorKind;
    use crate::math::WAD;
    use crate::testing::{address_output, signing_context, test_address, uint_output, FakeEndpoint};
    use ethers::types::H256;
    use std::sync::Arc;

    const PRICE: u64 = 250_000_000_000_000_000;

    fn cyclo(endpoint: Arc<FakeEndpoint>) -> Cyclo {
        Cyclo::new(signing_context(endpoint))
    }

    fn mint_log(to: Address, id: U256, value: U256) -> LogRecord {
        LogRecord {
            address: Address::repeat_byte(0xd3),
            topics: vec![
                abi::event_topic(abi::TRANSFER_SINGLE),
                H256::from(Address::repeat_byte(0x19)),
                H256::zero(),
                H256::from(to),
            ],
            data: ethers::abi::encode(&[Token::Uint(id), Token::Uint(value)]).into(),
        }
    }

    #[tokio::test]
    async fn test_lock_returns_minted_receipt() {
        let endpoint = FakeEndpoint::new(14);
        endpoint.respond(abi::selector("asset()"), address_output(Address::repeat_byte(0x12)));
        endpoint.respond(abi::selector("allowance(address,address)"), uint_output(U256::MAX));
        let recipient = test_address();
        let minted = U256::from(25) * WAD;
        endpoint.emit_logs(vec![mint_log(recipient, U256::from(PRICE), minted)]);

        let lock = cyclo(endpoint.clone())
            .lock(U256::from(100) * WAD, recipient, U256::from(PRICE))
            .await
            .unwrap();
        assert!(lock.execution.is_confirmed());
        assert_eq!(lock.receipt_id, Some(ReceiptId::from_price(U256::from(PRICE))));
        assert_eq!(lock.minted, Some(minted));

        let sent = endpoint.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..4], &abi::selector("deposit(uint256,address,uint256,bytes)"));
    }

    #[tokio::test]
    async fn test_lock_without_allowance_is_refused() {
        let endpoint = FakeEndpoint::new(14);
        endpoint.respond(abi::selector("asset()"), address_output(Address::repeat_byte(0x12)));
        endpoint.respond(abi::selector("allowance(address,address)"), uint_output(U256::zero()));

        let err = cyclo(endpoint.clone())
            .lock(WAD, test_address(), U256::zero())
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Configuration { .. }));
        assert!(endpoint.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_requires_exact_receipt_balance() {
        let endpoint = FakeEndpoint::new(14);
        endpoint.respond(abi::selector("balanceOf(address,uint256)"), uint_output(U256::from(25) * WAD));
        let connector = cyclo(endpoint.clone());
        let receipt_id = ReceiptId::from_price(U256::from(PRICE));

        let err = connector
            .unlock(U256::from(20) * WAD, test_address(), test_address(), receipt_id)
            .await
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Configuration { .. }));
        assert!(endpoint.sent().is_empty());

        connector
            .unlock(U256::from(25) * WAD, test_address(), test_address(), receipt_id)
            .await
            .unwrap();
        assert_eq!(endpoint.sent().len(), 1);
    }

    #[test]
    fn test_preview_lock_uses_receipt_price() {
        let connector = Cyclo::new(crate::protocols::ConnectorContext::read_only(
            FakeEndpoint::new(14),
            crate::config::NetworkContracts::flare_mainnet(),
        ));
        // 100 sFLR locked at a price of 0.25 mints 25 cysFLR
        assert_eq!(
            connector.preview_lock(U256::from(PRICE), U256::from(100) * WAD).unwrap(),
            U256::from(25) * WAD
        );
    }
}
