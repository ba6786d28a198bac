//! Calldata encoding and return-data decoding helpers

use crate::chain::LogRecord;
use crate::error::ErrorKind;

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, H256, U256};
use sha3::{Digest, Keccak256};

/// 4-byte function or error selector of a canonical signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash[..4]);
    out
}

/// Topic hash of a canonical event signature
pub fn event_topic(signature: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

/// Selector followed by the ABI-encoded arguments
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

fn decode(types: &[ParamType], output: &[u8]) -> Result<Vec<Token>, ErrorKind> {
    abi::decode(types, output)
        .map_err(|e| ErrorKind::configuration(format!("unexpected return data: {}", e)))
}

pub fn decode_uint(output: &[u8]) -> Result<U256, ErrorKind> {
    Ok(decode_uints(output, 1)?[0])
}

/// Leading `count` uint256 words of a return value
pub fn decode_uints(output: &[u8], count: usize) -> Result<Vec<U256>, ErrorKind> {
    let types = vec![ParamType::Uint(256); count];
    decode(&types, output)?
        .into_iter()
        .map(|token| {
            token
                .into_uint()
                .ok_or_else(|| ErrorKind::configuration("expected uint256 return value"))
        })
        .collect()
}

pub fn decode_address(output: &[u8]) -> Result<Address, ErrorKind> {
    decode(&[ParamType::Address], output)?
        .into_iter()
        .next()
        .and_then(Token::into_address)
        .ok_or_else(|| ErrorKind::configuration("expected address return value"))
}

/// ERC-1155 `TransferSingle` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSingle {
    pub operator: Address,
    pub from: Address,
    pub to: Address,
    pub id: U256,
    pub value: U256,
}

pub const TRANSFER_SINGLE: &str = "TransferSingle(address,address,address,uint256,uint256)";

/// Decode a `TransferSingle` log, `None` for any other log
pub fn decode_transfer_single(log: &LogRecord) -> Option<TransferSingle> {
    if log.topics.len() != 4 || log.topics[0] != event_topic(TRANSFER_SINGLE) {
        return None;
    }
    let words = decode_uints(&log.data, 2).ok()?;
    Some(TransferSingle {
        operator: Address::from(log.topics[1]),
        from: Address::from(log.topics[2]),
        to: Address::from(log.topics[3]),
        id: words[0],
        value: words[1],
    })
}
