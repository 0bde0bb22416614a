//! # Core Chain Entities
//!
//! Block and transaction types as they arrive from an upstream node, plus the
//! minimal `LightBlock` projection used for sequencing and fork checks.
//!
//! ## Clusters
//!
//! - **Chain**: `Block`, `Transaction`, `TxInput`, `TxOutput`
//! - **Sequencing**: `LightBlock`

use serde::{Deserialize, Serialize};

use crate::errors::BlockError;

/// Block or transaction hash as reported by the upstream node (hex string).
pub type BlockHash = String;

/// Transaction identifier (hex string).
pub type TxId = String;

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TxInput {
    /// Spent transaction id (absent for coinbase inputs).
    pub txid: Option<TxId>,
    /// Output index of the spent transaction.
    pub vout: Option<u32>,
    /// Coinbase data, hex encoded.
    pub coinbase: Option<String>,
    /// Sequence number.
    pub sequence: u32,
}

impl TxInput {
    /// Input spending `txid:vout`.
    pub fn spending(txid: impl Into<TxId>, vout: u32) -> Self {
        Self {
            txid: Some(txid.into()),
            vout: Some(vout),
            coinbase: None,
            sequence: u32::MAX,
        }
    }

    /// Coinbase input.
    pub fn coinbase(data: impl Into<String>) -> Self {
        Self {
            txid: None,
            vout: None,
            coinbase: Some(data.into()),
            sequence: u32::MAX,
        }
    }

    /// Whether this input is a coinbase input.
    pub fn is_coinbase(&self) -> bool {
        self.coinbase.is_some()
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// Output index within the transaction.
    pub n: u32,
    /// Locking script, hex encoded.
    pub script_pub_key: String,
}

/// A full transaction.
///
/// `size_bytes` is the byte length of `hex` when the upstream returned the
/// raw encoding; otherwise it is whatever size the source declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id.
    pub txid: TxId,
    /// Witness hash (equal to `txid` for non-segwit transactions).
    pub hash: String,
    /// Inputs.
    pub vin: Vec<TxInput>,
    /// Outputs.
    pub vout: Vec<TxOutput>,
    /// Raw transaction, hex encoded.
    pub hex: Option<String>,
    /// Witness stack items, hex encoded.
    pub witness: Option<Vec<String>>,
    /// Size accounted against buffer limits.
    pub size_bytes: u64,
}

impl Transaction {
    /// Create a transaction whose size is derived from its hex encoding.
    pub fn new(
        txid: impl Into<TxId>,
        hash: impl Into<String>,
        vin: Vec<TxInput>,
        vout: Vec<TxOutput>,
        hex: impl Into<String>,
    ) -> Self {
        let hex = hex.into();
        let size_bytes = hex.len() as u64;
        Self {
            txid: txid.into(),
            hash: hash.into(),
            vin,
            vout,
            hex: Some(hex),
            witness: None,
            size_bytes,
        }
    }

    /// Create a transaction without a hex encoding and an explicit size.
    pub fn with_size(txid: impl Into<TxId>, size_bytes: u64) -> Self {
        let txid = txid.into();
        Self {
            hash: txid.clone(),
            txid,
            vin: Vec::new(),
            vout: Vec::new(),
            hex: None,
            witness: None,
            size_bytes,
        }
    }

    /// Attach witness data.
    pub fn with_witness(mut self, witness: Vec<String>) -> Self {
        self.witness = Some(witness);
        self
    }

    /// Size used for accounting: the hex length if known, otherwise the declared size.
    pub fn computed_size(&self) -> u64 {
        self.hex
            .as_ref()
            .map(|h| h.len() as u64)
            .unwrap_or(self.size_bytes)
    }
}

/// A full block as delivered by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block height.
    pub height: u64,
    /// Block hash.
    pub hash: BlockHash,
    /// Hash of the parent block (empty for the first block of a chain).
    pub previous_hash: BlockHash,
    /// Cumulative transaction size.
    pub size_bytes: u64,
    /// Ordered transactions.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a block, computing its size from the transactions.
    ///
    /// # Errors
    /// `BlockError::NoTransactions` if `transactions` is empty.
    pub fn new(
        height: u64,
        hash: impl Into<BlockHash>,
        previous_hash: impl Into<BlockHash>,
        transactions: Vec<Transaction>,
    ) -> Result<Self, BlockError> {
        let size_bytes = compute_size(height, &transactions)?;
        Ok(Self {
            height,
            hash: hash.into(),
            previous_hash: previous_hash.into(),
            size_bytes,
            transactions,
        })
    }

    /// Recompute `size_bytes` after the transaction list changed.
    pub fn recompute_size(&mut self) -> Result<u64, BlockError> {
        self.size_bytes = compute_size(self.height, &self.transactions)?;
        Ok(self.size_bytes)
    }

    /// Transaction ids in block order.
    pub fn tx_ids(&self) -> Vec<TxId> {
        self.transactions.iter().map(|tx| tx.txid.clone()).collect()
    }

    /// Number of transactions.
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

fn compute_size(height: u64, transactions: &[Transaction]) -> Result<u64, BlockError> {
    if transactions.is_empty() {
        return Err(BlockError::NoTransactions { height });
    }
    Ok(transactions
        .iter()
        .map(Transaction::computed_size)
        .fold(0u64, u64::saturating_add))
}

/// Minimal block projection for sequencing and fork checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LightBlock {
    /// Block height.
    pub height: u64,
    /// Block hash.
    pub hash: BlockHash,
    /// Parent hash.
    pub previous_hash: BlockHash,
    /// Transaction ids in block order.
    pub tx_ids: Vec<TxId>,
}

impl LightBlock {
    /// Create a light block.
    pub fn new(
        height: u64,
        hash: impl Into<BlockHash>,
        previous_hash: impl Into<BlockHash>,
        tx_ids: Vec<TxId>,
    ) -> Self {
        Self {
            height,
            hash: hash.into(),
            previous_hash: previous_hash.into(),
            tx_ids,
        }
    }

    /// Whether `next` directly extends this block.
    pub fn is_parent_of(&self, next: &LightBlock) -> bool {
        self.height.checked_add(1) == Some(next.height) && next.previous_hash == self.hash
    }
}

impl From<&Block> for LightBlock {
    fn from(block: &Block) -> Self {
        Self {
            height: block.height,
            hash: block.hash.clone(),
            previous_hash: block.previous_hash.clone(),
            tx_ids: block.tx_ids(),
        }
    }
}
