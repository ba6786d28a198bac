//! Failure classification
//!
//! Maps every `RawFailure` the pipeline can observe onto the stable
//! `ErrorKind` taxonomy. Pure and deterministic: no I/O, no clocks.

use crate::chain::RawFailure;
use crate::error::{ErrorKind, RevertCategory, RevertReason};
use crate::protocols::abi::selector;

use ethers::abi::{self, ParamType, Token};
use lazy_static::lazy_static;
use tracing::debug;

/// `Error(string)`
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// `Panic(uint256)`
const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

const NONCE_MARKERS: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "replacement transaction underpriced",
    "already used",
];

const CONFIGURATION_MARKERS: &[&str] = &[
    "insufficient funds",
    "intrinsic gas too low",
    "exceeds block gas limit",
    "invalid sender",
];

const TRANSIENT_MARKERS: &[&str] = &["timeout", "timed out", "header not found", "rate limit"];

struct KnownError {
    selector: [u8; 4],
    name: &'static str,
    params: Vec<ParamType>,
    category: RevertCategory,
}

impl KnownError {
    fn new(signature: &'static str, params: Vec<ParamType>, category: RevertCategory) -> Self {
        let name = signature.split('(').next().unwrap_or(signature);
        Self {
            selector: selector(signature),
            name,
            params,
            category,
        }
    }
}

lazy_static! {
    /// Custom errors raised by the supported protocols and their token contracts
    static ref KNOWN_ERRORS: Vec<KnownError> = vec![
        KnownError::new(
            "MinSharesRatio(uint256,uint256)",
            vec![ParamType::Uint(256), ParamType::Uint(256)],
            RevertCategory::SlippageExceeded,
        ),
        KnownError::new(
            "ERC20InsufficientAllowance(address,uint256,uint256)",
            vec![ParamType::Address, ParamType::Uint(256), ParamType::Uint(256)],
            RevertCategory::InsufficientAllowance,
        ),
        KnownError::new(
            "ERC20InsufficientBalance(address,uint256,uint256)",
            vec![ParamType::Address, ParamType::Uint(256), ParamType::Uint(256)],
            RevertCategory::InsufficientBalance,
        ),
        KnownError::new(
            "ERC1155InsufficientBalance(address,uint256,uint256,uint256)",
            vec![
                ParamType::Address,
                ParamType::Uint(256),
                ParamType::Uint(256),
                ParamType::Uint(256),
            ],
            RevertCategory::ReceiptMismatch,
        ),
        KnownError::new(
            "ERC4626ExceededMaxWithdraw(address,uint256,uint256)",
            vec![ParamType::Address, ParamType::Uint(256), ParamType::Uint(256)],
            RevertCategory::InsufficientBalance,
        ),
    ];
}

/// Classify a raw failure
pub fn classify(failure: &RawFailure) -> ErrorKind {
    let cause = failure.to_string();
    match failure {
        RawFailure::Transport(_) | RawFailure::RateLimited(_) => ErrorKind::Transient { cause },
        RawFailure::Signing(_) | RawFailure::Configuration(_) => ErrorKind::Configuration { cause },
        RawFailure::ReceiptTimeout | RawFailure::Cancelled(_) => ErrorKind::Timeout { cause },
        RawFailure::Rpc {
            code,
            message,
            data,
        } => classify_rpc(*code, message, data.as_deref(), cause),
    }
}

fn classify_rpc(code: i64, message: &str, data: Option<&[u8]>, cause: String) -> ErrorKind {
    let lower = message.to_lowercase();

    // Revert evidence wins over message text; reasons may mention nonces
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        let reason = decode_revert(data).unwrap_or_else(|| reason_from_message(message));
        return ErrorKind::revert(reason, cause);
    }

    if code == 3 || lower.starts_with("execution reverted") {
        return ErrorKind::revert(reason_from_message(message), cause);
    }

    if contains_any(&lower, NONCE_MARKERS) {
        return ErrorKind::NonceConflict { cause };
    }

    if lower.contains("revert") {
        return ErrorKind::revert(reason_from_message(message), cause);
    }

    if contains_any(&lower, CONFIGURATION_MARKERS) || code == -32602 || code == -32601 {
        return ErrorKind::Configuration { cause };
    }

    if contains_any(&lower, TRANSIENT_MARKERS)
        || matches!(code, -32005 | -32603 | 429)
        || (-32099..=-32000).contains(&code)
    {
        return ErrorKind::Transient { cause };
    }

    ErrorKind::Configuration { cause }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

/// Decode an ABI revert payload into a reason, if it is recognizable
pub fn decode_revert(data: &[u8]) -> Option<RevertReason> {
    if data.len() < 4 {
        return None;
    }
    let (head, body) = data.split_at(4);

    if head == ERROR_STRING_SELECTOR {
        let tokens = abi::decode(&[ParamType::String], body).ok()?;
        let message = match tokens.into_iter().next()? {
            Token::String(message) => message,
            _ => return None,
        };
        let category = categorize(&message);
        return Some(RevertReason::new(message, category));
    }

    if head == PANIC_SELECTOR {
        let tokens = abi::decode(&[ParamType::Uint(256)], body).ok()?;
        let code = tokens.into_iter().next()?.into_uint()?;
        return Some(RevertReason::new(
            format!("panic {:#04x}", code.low_u64()),
            RevertCategory::Other,
        ));
    }

    let Some(known) = KNOWN_ERRORS.iter().find(|known| head == known.selector) else {
        debug!("Unrecognized revert selector 0x{}", hex::encode(head));
        return None;
    };
    let message = match abi::decode(&known.params, body) {
        Ok(tokens) => {
            let args: Vec<String> = tokens.iter().map(Token::to_string).collect();
            format!("{}({})", known.name, args.join(", "))
        }
        Err(_) => known.name.to_string(),
    };
    Some(RevertReason::new(message, known.category))
}

/// Reason from a node message such as "execution reverted: Too little received"
pub fn reason_from_message(message: &str) -> RevertReason {
    let trimmed = message.trim();
    let lower = trimmed.to_lowercase();
    let stripped = if lower.starts_with("execution reverted:") {
        trimmed["execution reverted:".len()..].trim()
    } else if lower.starts_with("execution reverted") || lower.is_empty() {
        ""
    } else {
        trimmed
    };

    if stripped.is_empty() {
        return RevertReason::opaque();
    }
    RevertReason::new(stripped, categorize(stripped))
}

/// Category of a human-readable revert message
pub fn categorize(message: &str) -> RevertCategory {
    let lower = message.to_lowercase();

    if contains_any(
        &lower,
        &["too little received", "too much requested", "slippage", "min share"],
    ) {
        RevertCategory::SlippageExceeded
    } else if contains_any(&lower, &["too old", "deadline", "expired"]) {
        RevertCategory::DeadlineExpired
    } else if contains_any(&lower, &["receipt", "erc1155"]) {
        RevertCategory::ReceiptMismatch
    } else if lower.contains("allowance") {
        RevertCategory::InsufficientAllowance
    } else if contains_any(&lower, &["exceeds balance", "insufficient balance"]) {
        RevertCategory::InsufficientBalance
    } else if contains_any(&lower, &["cooldown", "not claimable", "period", "not ready"]) {
        RevertCategory::WithdrawalNotReady
    } else {
        RevertCategory::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, Bytes, U256};
    use proptest::prelude::*;

    fn error_string(message: &str) -> Bytes {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::String(message.to_string())]));
        Bytes::from(data)
    }

    #[test]
    fn test_transport_failures_are_transient() {
        assert!(classify(&RawFailure::Transport("connection reset".into())).is_retryable());
        assert!(classify(&RawFailure::RateLimited("429".into())).is_retryable());
        assert!(classify(&RawFailure::rpc(-32005, "limit exceeded")).is_retryable());
        assert!(classify(&RawFailure::rpc(-32000, "header not found")).is_retryable());
    }

    #[test]
    fn test_nonce_errors() {
        for message in [
            "nonce too low",
            "Nonce too high",
            "replacement transaction underpriced",
        ] {
            assert!(matches!(
                classify(&RawFailure::rpc(-32000, message)),
                ErrorKind::NonceConflict { .. }
            ));
        }
    }

    #[test]
    fn test_revert_mentioning_nonce_stays_a_revert() {
        for message in [
            "execution reverted: signature already used",
            "execution reverted: invalid nonce",
        ] {
            let kind = classify(&RawFailure::revert(message, None));
            assert!(matches!(kind, ErrorKind::Revert { .. }), "{} -> {:?}", message, kind);
        }

        let kind = classify(&RawFailure::rpc(
            -32000,
            "execution reverted: permit already used",
        ));
        assert!(matches!(kind, ErrorKind::Revert { .. }));

        let kind = classify(&RawFailure::Rpc {
            code: -32000,
            message: "nonce already used".into(),
            data: Some(error_string("nonce already used")),
        });
        assert_eq!(
            kind.revert_reason().and_then(|r| r.message.as_deref()),
            Some("nonce already used")
        );
    }

    #[test]
    fn test_allowance_revert_from_message() {
        let kind = classify(&RawFailure::revert(
            "execution reverted: insufficient allowance",
            None,
        ));
        let reason = kind.revert_reason().unwrap();
        assert_eq!(reason.message.as_deref(), Some("insufficient allowance"));
        assert_eq!(reason.category, RevertCategory::InsufficientAllowance);
    }

    #[test]
    fn test_revert_data_takes_precedence_over_message() {
        let kind = classify(&RawFailure::revert(
            "execution reverted",
            Some(error_string("Too little received")),
        ));
        let reason = kind.revert_reason().unwrap();
        assert_eq!(reason.message.as_deref(), Some("Too little received"));
        assert_eq!(reason.category, RevertCategory::SlippageExceeded);
    }

    #[test]
    fn test_bare_revert_is_opaque() {
        let kind = classify(&RawFailure::revert("execution reverted", None));
        assert_eq!(kind.revert_reason(), Some(&RevertReason::opaque()));
    }

    #[test]
    fn test_revert_categories() {
        assert_eq!(categorize("Transaction too old"), RevertCategory::DeadlineExpired);
        assert_eq!(
            categorize("ERC20: transfer amount exceeds balance"),
            RevertCategory::InsufficientBalance
        );
        assert_eq!(categorize("Withdrawal period not claimable"), RevertCategory::WithdrawalNotReady);
        assert_eq!(categorize("Pausable: paused"), RevertCategory::Other);
    }

    #[test]
    fn test_custom_error_decoding() {
        let mut data = selector("ERC20InsufficientAllowance(address,uint256,uint256)").to_vec();
        data.extend(abi::encode(&[
            Token::Address(Address::repeat_byte(0x11)),
            Token::Uint(U256::from(5)),
            Token::Uint(U256::from(10)),
        ]));
        let reason = decode_revert(&data).unwrap();
        assert_eq!(reason.category, RevertCategory::InsufficientAllowance);
        assert!(reason
            .message
            .unwrap()
            .starts_with("ERC20InsufficientAllowance("));

        let mut panic = PANIC_SELECTOR.to_vec();
        panic.extend(abi::encode(&[Token::Uint(U256::from(0x11))]));
        assert_eq!(decode_revert(&panic).unwrap().message.as_deref(), Some("panic 0x11"));

        assert!(decode_revert(&[0xde, 0xad]).is_none());
        assert!(decode_revert(&[0xde, 0xad, 0xbe, 0xef]).is_none());
    }

    #[test]
    fn test_user_actionable_errors_are_configuration() {
        for failure in [
            RawFailure::rpc(-32000, "insufficient funds for gas * price + value"),
            RawFailure::rpc(-32602, "invalid argument 0"),
            RawFailure::Signing("key unavailable".into()),
            RawFailure::Configuration("no signing account".into()),
        ] {
            assert!(matches!(classify(&failure), ErrorKind::Configuration { .. }));
        }
    }

    #[test]
    fn test_timeouts() {
        assert!(matches!(classify(&RawFailure::ReceiptTimeout), ErrorKind::Timeout { .. }));
        assert!(matches!(
            classify(&RawFailure::Cancelled("deadline".into())),
            ErrorKind::Timeout { .. }
        ));
    }

    fn raw_failure() -> impl Strategy<Value = RawFailure> {
        prop_oneof![
            ".*".prop_map(RawFailure::Transport),
            ".*".prop_map(RawFailure::RateLimited),
            ".*".prop_map(RawFailure::Signing),
            Just(RawFailure::ReceiptTimeout),
            (any::<i64>(), ".*", proptest::option::of(proptest::collection::vec(any::<u8>(), 0..100)))
                .prop_map(|(code, message, data)| RawFailure::Rpc {
                    code,
                    message,
                    data: data.map(Bytes::from),
                }),
        ]
    }

    proptest! {
        #[test]
        fn prop_classification_is_deterministic(failure in raw_failure()) {
            prop_assert_eq!(classify(&failure), classify(&failure.clone()));
        }
    }
}
