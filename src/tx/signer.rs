//! Transaction signing at the key-holder boundary

use crate::chain::{GasPrice, RawFailure};
use crate::config::WalletConfig;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, Signature, TransactionRequest, H256, U256};
use tracing::info;

/// Fully priced transaction awaiting a signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub nonce: u64,
    pub gas_limit: U256,
    pub fees: GasPrice,
    pub chain_id: u64,
}

impl UnsignedTransaction {
    /// Typed transaction matching the fee model of `fees`
    pub fn to_typed(&self, from: Address) -> TypedTransaction {
        match self.fees {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(self.to)
                .data(self.data.clone())
                .value(self.value)
                .nonce(self.nonce)
                .gas(self.gas_limit)
                .gas_price(price)
                .chain_id(self.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(self.to)
                .data(self.data.clone())
                .value(self.value)
                .nonce(self.nonce)
                .gas(self.gas_limit)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(self.chain_id)
                .into(),
        }
    }
}

/// Signed transaction; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub unsigned: UnsignedTransaction,
    pub signature: Signature,
    /// RLP-encoded bytes as broadcast
    pub raw: Bytes,
    pub hash: H256,
}

impl SignedTransaction {
    pub fn nonce(&self) -> u64 {
        self.unsigned.nonce
    }
}

/// Holder of a signing key. Implementations never expose the key material.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, tx: &TypedTransaction) -> Result<Signature, RawFailure>;
}

#[async_trait]
impl TransactionSigner for LocalWallet {
    fn address(&self) -> Address {
        Signer::address(self)
    }

    async fn sign(&self, tx: &TypedTransaction) -> Result<Signature, RawFailure> {
        Signer::sign_transaction(self, tx)
            .await
            .map_err(|e| RawFailure::Signing(e.to_string()))
    }
}

/// Sign `unsigned` with `signer`
pub async fn sign_transaction(
    signer: &dyn TransactionSigner,
    unsigned: UnsignedTransaction,
) -> Result<SignedTransaction, RawFailure> {
    let tx = unsigned.to_typed(signer.address());
    let signature = signer.sign(&tx).await?;
    let raw = tx.rlp_signed(&signature);
    let hash = tx.hash(&signature);
    Ok(SignedTransaction {
        unsigned,
        signature,
        raw,
        hash,
    })
}

/// Load the wallet named by the configuration, if any
pub fn load_wallet(config: &WalletConfig, chain_id: u64) -> Result<Option<LocalWallet>, RawFailure> {
    let Some(var) = &config.private_key_env else {
        return Ok(None);
    };

    let key = std::env::var(var)
        .map_err(|_| RawFailure::Configuration(format!("{} is not set", var)))?;
    let wallet = key
        .trim()
        .parse::<LocalWallet>()
        .map_err(|e| RawFailure::Configuration(format!("Invalid private key in {}: {}", var, e)))?
        .with_chain_id(chain_id);

    info!("Loaded signing account {:?}", Signer::address(&wallet));
    Ok(Some(wallet))
}
