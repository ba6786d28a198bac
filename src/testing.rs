//! Scriptable in-memory network endpoint for pipeline tests

use crate::chain::{GasPrice, LogRecord, NetworkEndpoint, RawFailure, Receipt};
use crate::config::{ExecutionConfig, NetworkContracts};
use crate::protocols::ConnectorContext;
use crate::tx::engine::ExecutionEngine;
use crate::tx::signer::TransactionSigner;

use async_trait::async_trait;
use chrono::Utc;
use ethers::abi::{self, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{keccak256, rlp::Rlp};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Well-known development key; never holds funds
pub const TEST_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

pub fn test_wallet(chain_id: u64) -> LocalWallet {
    TEST_KEY.parse::<LocalWallet>().unwrap().with_chain_id(chain_id)
}

pub fn test_address() -> Address {
    Signer::address(&test_wallet(14))
}

/// Connector context on the mainnet address book, signing with the test wallet
pub fn signing_context(endpoint: Arc<FakeEndpoint>) -> ConnectorContext {
    let signer: Arc<dyn TransactionSigner> = Arc::new(test_wallet(endpoint.chain_id));
    let engine = ExecutionEngine::new(endpoint.clone(), signer, &ExecutionConfig::default(), 100);
    ConnectorContext::read_only(endpoint, NetworkContracts::flare_mainnet()).with_engine(Arc::new(engine))
}

/// ABI-encoded return value of consecutive uint256 words
pub fn uints_output(values: &[U256]) -> Result<Bytes, RawFailure> {
    let tokens: Vec<Token> = values.iter().map(|v| Token::Uint(*v)).collect();
    Ok(Bytes::from(abi::encode(&tokens)))
}

pub fn uint_output(value: U256) -> Result<Bytes, RawFailure> {
    uints_output(&[value])
}

pub fn address_output(address: Address) -> Result<Bytes, RawFailure> {
    Ok(Bytes::from(abi::encode(&[Token::Address(address)])))
}

/// Transaction accepted by the fake network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub from: Address,
    pub nonce: u64,
    pub hash: H256,
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
}

#[derive(Default)]
struct FakeState {
    nonces: HashMap<Address, u64>,
    block: u64,
    timestamp: u64,
    estimates: VecDeque<Result<U256, RawFailure>>,
    send_failures: VecDeque<RawFailure>,
    sent: Vec<SentTransaction>,
    receipts: HashMap<H256, Receipt>,
    revert_inclusions: bool,
    receipt_logs: Vec<LogRecord>,
    hidden_polls: u32,
    polls: HashMap<H256, u32>,
    calls: HashMap<[u8; 4], VecDeque<Result<Bytes, RawFailure>>>,
    call_log: Vec<TypedTransaction>,
    queued: BTreeMap<(Address, u64), SentTransaction>,
}

impl FakeState {
    /// Include `tx` in a new block
    fn mine(&mut self, tx: SentTransaction) {
        self.nonces.insert(tx.from, tx.nonce + 1);
        self.block += 1;
        let receipt = Receipt {
            tx_hash: tx.hash,
            block_number: self.block,
            block_hash: Some(H256::from_low_u64_be(self.block)),
            success: !self.revert_inclusions,
            gas_used: U256::from(60_000),
            logs: self.receipt_logs.clone(),
        };
        self.receipts.insert(tx.hash, receipt);
        self.sent.push(tx);
    }
}

/// In-memory chain that mines each accepted transaction as soon as its nonce is next
pub struct FakeEndpoint {
    chain_id: u64,
    state: Mutex<FakeState>,
}

impl FakeEndpoint {
    pub fn new(chain_id: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            state: Mutex::new(FakeState {
                block: 1_000,
                timestamp: Utc::now().timestamp().max(0) as u64,
                ..Default::default()
            }),
        })
    }

    /// Set the network's next nonce for `account`
    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.state.lock().unwrap().nonces.insert(account, nonce);
    }

    pub fn network_nonce(&self, account: Address) -> u64 {
        self.state
            .lock()
            .unwrap()
            .nonces
            .get(&account)
            .copied()
            .unwrap_or_default()
    }

    /// Latest block time; starts at the local clock
    pub fn set_block_timestamp(&self, timestamp: u64) {
        self.state.lock().unwrap().timestamp = timestamp;
    }

    /// Queue the result of the next `estimate_gas` call; unscripted calls return 100k
    pub fn script_estimate(&self, result: Result<U256, RawFailure>) {
        self.state.lock().unwrap().estimates.push_back(result);
    }

    /// Fail the next sends with these failures, in order
    pub fn fail_sends(&self, failures: Vec<RawFailure>) {
        self.state.lock().unwrap().send_failures.extend(failures);
    }

    /// Include every later transaction with a failed status
    pub fn revert_inclusions(&self) {
        self.state.lock().unwrap().revert_inclusions = true;
    }

    /// Logs attached to every later receipt
    pub fn emit_logs(&self, logs: Vec<LogRecord>) {
        self.state.lock().unwrap().receipt_logs = logs;
    }

    /// Receipts stay invisible for this many polls per transaction
    pub fn hide_receipts(&self, polls: u32) {
        self.state.lock().unwrap().hidden_polls = polls;
    }

    /// Queue a response for `call` on the function with this selector.
    /// The last queued response repeats once the others are used.
    pub fn respond(&self, selector: [u8; 4], result: Result<Bytes, RawFailure>) {
        self.state
            .lock()
            .unwrap()
            .calls
            .entry(selector)
            .or_default()
            .push_back(result);
    }

    /// Accepted transactions waiting on a lower nonce
    pub fn queued(&self) -> Vec<SentTransaction> {
        self.state.lock().unwrap().queued.values().cloned().collect()
    }

    /// Mined transactions, in block order
    pub fn sent(&self) -> Vec<SentTransaction> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn calls(&self) -> Vec<TypedTransaction> {
        self.state.lock().unwrap().call_log.clone()
    }
}

#[async_trait]
impl NetworkEndpoint for FakeEndpoint {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn block_number(&self) -> Result<u64, RawFailure> {
        Ok(self.state.lock().unwrap().block)
    }

    async fn block_timestamp(&self) -> Result<u64, RawFailure> {
        Ok(self.state.lock().unwrap().timestamp)
    }

    async fn call(&self, tx: &TypedTransaction, _block: Option<u64>) -> Result<Bytes, RawFailure> {
        let mut state = self.state.lock().unwrap();
        state.call_log.push(tx.clone());

        let data = tx.data().cloned().unwrap_or_default();
        if data.len() < 4 {
            return Ok(Bytes::new());
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&data[..4]);

        match state.calls.get_mut(&selector) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| Ok(Bytes::new())),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| Ok(Bytes::new())),
            None => Ok(Bytes::new()),
        }
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> Result<U256, RawFailure> {
        self.state
            .lock()
            .unwrap()
            .estimates
            .pop_front()
            .unwrap_or_else(|| Ok(U256::from(100_000)))
    }

    async fn gas_price(&self) -> Result<GasPrice, RawFailure> {
        Ok(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(50_000_000_000u64),
            max_priority_fee_per_gas: U256::from(2_000_000_000u64),
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RawFailure> {
        let mut state = self.state.lock().unwrap();
        if let Some(failure) = state.send_failures.pop_front() {
            return Err(failure);
        }

        let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(&raw))
            .map_err(|e| RawFailure::rpc(-32602, format!("rlp: {}", e)))?;
        let from = signature
            .recover(tx.sighash())
            .map_err(|e| RawFailure::rpc(-32000, format!("invalid sender: {}", e)))?;
        let hash = H256::from(keccak256(&raw));

        if state.sent.iter().any(|sent| sent.hash == hash)
            || state.queued.values().any(|queued| queued.hash == hash)
        {
            return Err(RawFailure::rpc(-32000, "already known"));
        }

        let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or_default();
        let expected = state.nonces.get(&from).copied().unwrap_or_default();
        if nonce < expected {
            return Err(RawFailure::rpc(-32000, "nonce too low"));
        }

        let pending = SentTransaction {
            from,
            nonce,
            hash,
            to: tx.to().and_then(|to| to.as_address().copied()),
            data: tx.data().cloned().unwrap_or_default(),
            value: tx.value().copied().unwrap_or_default(),
        };
        // Future nonces wait in the pool until the hole below them is filled
        if nonce > expected {
            if state.queued.contains_key(&(from, nonce)) {
                return Err(RawFailure::rpc(-32000, "replacement transaction underpriced"));
            }
            state.queued.insert((from, nonce), pending);
            return Ok(hash);
        }

        state.mine(pending);
        loop {
            let expected = state.nonces.get(&from).copied().unwrap_or_default();
            match state.queued.remove(&(from, expected)) {
                Some(next) => state.mine(next),
                None => break,
            }
        }

        Ok(hash)
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<Receipt>, RawFailure> {
        let mut state = self.state.lock().unwrap();
        let hidden = state.hidden_polls;
        let polls = state.polls.entry(tx_hash).or_default();
        if *polls < hidden {
            *polls += 1;
            return Ok(None);
        }
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RawFailure> {
        Ok(self.network_nonce(address))
    }
}
