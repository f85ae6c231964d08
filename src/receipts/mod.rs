//! Hash-chained, signed receipts for successful ledger operations. Each
//! receipt commits to the operation, the resulting balances, and the state
//! digest the bank reached, and links to the receipt before it.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ledger::{AccountId, Amount};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Deposit,
    Withdraw,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptBody {
    pub seq: u64,
    pub op: OpKind,
    pub account: AccountId,
    pub amount: Amount,
    pub new_balance: Amount,
    pub total_balance: Amount,
    pub state_digest: [u8; 32],
    pub prev: Option<[u8; 32]>,
}

impl ReceiptBody {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"bank-receipt");
        hasher.update(self.seq.to_le_bytes());
        match self.op {
            OpKind::Deposit => hasher.update(b"deposit"),
            OpKind::Withdraw => hasher.update(b"withdraw"),
        }
        hasher.update((self.account.len() as u64).to_le_bytes());
        hasher.update(self.account.as_bytes());
        hasher.update(self.amount.to_le_bytes());
        hasher.update(self.new_balance.to_le_bytes());
        hasher.update(self.total_balance.to_le_bytes());
        hasher.update(self.state_digest);
        match &self.prev {
            Some(prev) => {
                hasher.update([1u8]);
                hasher.update(prev);
            }
            None => hasher.update([0u8]),
        }
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedReceipt {
    pub body: ReceiptBody,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedReceipt {
    pub fn sign(key: &SigningKey, body: ReceiptBody) -> Self {
        let signature = key.sign(&body.digest()).to_bytes().to_vec();
        Self { body, signature }
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), ReceiptError> {
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| ReceiptError::MalformedSignature { seq: self.body.seq })?;
        key.verify_strict(&self.body.digest(), &signature)
            .map_err(|_| ReceiptError::InvalidSignature { seq: self.body.seq })
    }
}

/// Walks a receipt trail front to back: sequence numbers must count up from
/// zero, every `prev` must equal the digest of the receipt before it, and
/// every signature must verify under `key`.
pub fn verify_chain(receipts: &[SignedReceipt], key: &VerifyingKey) -> Result<(), ReceiptError> {
    let mut prev_digest: Option<[u8; 32]> = None;
    for (idx, receipt) in receipts.iter().enumerate() {
        let expected = idx as u64;
        if receipt.body.seq != expected {
            return Err(ReceiptError::OutOfOrder {
                expected,
                actual: receipt.body.seq,
            });
        }
        if receipt.body.prev != prev_digest {
            return Err(ReceiptError::BrokenChain {
                seq: receipt.body.seq,
            });
        }
        receipt.verify(key)?;
        prev_digest = Some(receipt.body.digest());
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("malformed signature on receipt {seq}")]
    MalformedSignature { seq: u64 },
    #[error("invalid signature on receipt {seq}")]
    InvalidSignature { seq: u64 },
    #[error("receipt {seq} does not link to its predecessor")]
    BrokenChain { seq: u64 },
    #[error("receipt out of order: expected seq {expected}, found {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}
