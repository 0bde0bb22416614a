//! In-memory upstream chain.
//!
//! Implements `UpstreamSource` and `BlockStream` over a scriptable chain with
//! fork and failure injection.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_types::{Block, BlockHash, Transaction, TxInput};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    BlockDetail, BlockHeaderPart, IngestionError, PreloadedBlockInfo, Result, StreamMessage,
    TransactionFragment,
};
use crate::ports::outbound::{BlockStream, StreamHandle, UpstreamSource};

/// Spare channel capacity beyond the initial replay.
const STREAM_HEADROOM: usize = 256;

/// Build a linked chain `from..=to`.
///
/// Hashes are `"{tag}{height}"`; the first block points at `parent`. Each
/// block carries one transaction with a `tx_bytes`-long hex encoding.
pub fn build_chain(from: u64, to: u64, tag: &str, parent: &str, tx_bytes: usize) -> Vec<Block> {
    let mut previous = parent.to_string();
    let mut chain = Vec::new();
    for height in from..=to {
        let hash = format!("{tag}{height}");
        let tx = Transaction::new(
            format!("{hash}-tx"),
            format!("{hash}-tx"),
            vec![TxInput::coinbase(format!("{height:08x}"))],
            vec![],
            "a".repeat(tx_bytes),
        );
        chain.push(Block {
            height,
            hash: hash.clone(),
            previous_hash: std::mem::replace(&mut previous, hash),
            size_bytes: tx.size_bytes,
            transactions: vec![tx],
        });
    }
    chain
}

struct Subscription {
    sender: mpsc::Sender<StreamMessage>,
    to_height: Option<u64>,
}

/// Scriptable in-memory chain.
pub struct InMemoryUpstream {
    chain: RwLock<Vec<Block>>,
    failures: AtomicU32,
    calls: AtomicUsize,
    fragment_size: RwLock<Option<usize>>,
    streams: Mutex<HashMap<String, Subscription>>,
}

impl InMemoryUpstream {
    /// Empty upstream.
    pub fn new() -> Self {
        Self::with_chain(Vec::new())
    }

    /// Upstream serving `chain` (contiguous, ascending).
    pub fn with_chain(chain: Vec<Block>) -> Self {
        Self {
            chain: RwLock::new(chain),
            failures: AtomicU32::new(0),
            calls: AtomicUsize::new(0),
            fragment_size: RwLock::new(None),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Height of the newest block.
    pub fn tip_height(&self) -> Option<u64> {
        self.chain.read().last().map(|b| b.height)
    }

    /// Append blocks and publish them to open streams.
    pub fn append(&self, blocks: Vec<Block>) {
        let messages: Vec<(u64, Vec<StreamMessage>)> = blocks
            .iter()
            .map(|b| (b.height, self.messages_for(b)))
            .collect();
        self.chain.write().extend(blocks);

        let mut streams = self.streams.lock();
        streams.retain(|id, sub| {
            for (height, msgs) in &messages {
                if sub.to_height.is_some_and(|to| *height > to) {
                    continue;
                }
                for msg in msgs {
                    if sub.sender.try_send(msg.clone()).is_err() {
                        debug!(stream = %id, "[qc-18] Dropping closed stream");
                        return false;
                    }
                }
            }
            true
        });
    }

    /// Replace every block at or above `height` with `blocks`.
    pub fn replace_from(&self, height: u64, blocks: Vec<Block>) {
        let mut chain = self.chain.write();
        chain.retain(|b| b.height < height);
        chain.extend(blocks);
    }

    /// Fail the next `n` upstream calls.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Total upstream calls served or failed.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Deliver stream blocks as a header plus fragments of `size` transactions.
    pub fn set_fragment_size(&self, size: Option<usize>) {
        *self.fragment_size.write() = size.filter(|s| *s > 0);
    }

    /// Number of open subscriptions.
    pub fn open_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// End every subscription from the upstream side.
    pub fn close_streams(&self) {
        self.streams.lock().clear();
    }

    fn enter(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(IngestionError::Upstream(format!(
                "{operation}: injected failure"
            )));
        }
        Ok(())
    }

    fn lookup(chain: &[Block], height: u64) -> Option<&Block> {
        let base = chain.first()?.height;
        let index = usize::try_from(height.checked_sub(base)?).ok()?;
        chain.get(index)
    }

    fn project(block: &Block, detail: BlockDetail) -> Block {
        match detail {
            BlockDetail::Full => block.clone(),
            BlockDetail::Light => Block {
                transactions: block
                    .transactions
                    .iter()
                    .map(|tx| Transaction::with_size(tx.txid.clone(), tx.size_bytes))
                    .collect(),
                ..block.clone()
            },
        }
    }

    fn messages_for(&self, block: &Block) -> Vec<StreamMessage> {
        let Some(size) = *self.fragment_size.read() else {
            return vec![StreamMessage::Block(block.clone())];
        };
        let mut messages = vec![StreamMessage::Header {
            header: BlockHeaderPart {
                height: block.height,
                hash: block.hash.clone(),
                previous_hash: block.previous_hash.clone(),
                transactions: Vec::new(),
            },
            expected_tx_count: block.tx_count(),
        }];
        messages.extend(block.transactions.chunks(size).map(|chunk| {
            StreamMessage::Transactions(TransactionFragment {
                block_hash: block.hash.clone(),
                height: block.height,
                transactions: chunk.to_vec(),
            })
        }));
        messages
    }
}

impl Default for InMemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamSource for InMemoryUpstream {
    async fn get_current_height(&self) -> Result<u64> {
        self.enter("get_current_height")?;
        Ok(self.tip_height().unwrap_or(0))
    }

    async fn get_one_block_by_height(&self, height: u64, detail: BlockDetail) -> Result<Block> {
        self.enter("get_one_block_by_height")?;
        let chain = self.chain.read();
        Self::lookup(&chain, height)
            .map(|b| Self::project(b, detail))
            .ok_or_else(|| IngestionError::Upstream(format!("block {height} not found")))
    }

    async fn get_many_blocks_by_heights(
        &self,
        heights: &[u64],
        detail: BlockDetail,
    ) -> Result<Vec<Block>> {
        self.enter("get_many_blocks_by_heights")?;
        let chain = self.chain.read();
        Ok(heights
            .iter()
            .filter_map(|h| Self::lookup(&chain, *h))
            .map(|b| Self::project(b, detail))
            .collect())
    }

    async fn get_many_blocks_by_hashes(
        &self,
        hashes: &[BlockHash],
        detail: BlockDetail,
    ) -> Result<Vec<Block>> {
        self.enter("get_many_blocks_by_hashes")?;
        let chain = self.chain.read();
        Ok(chain
            .iter()
            .filter(|b| hashes.contains(&b.hash))
            .map(|b| Self::project(b, detail))
            .collect())
    }

    async fn get_many_block_stats_by_heights(
        &self,
        heights: &[u64],
    ) -> Result<Vec<PreloadedBlockInfo>> {
        self.enter("get_many_block_stats_by_heights")?;
        let chain = self.chain.read();
        Ok(heights
            .iter()
            .filter_map(|h| Self::lookup(&chain, *h))
            .map(|b| PreloadedBlockInfo::new(b.hash.clone(), b.size_bytes, b.height))
            .collect())
    }
}

#[async_trait]
impl BlockStream for InMemoryUpstream {
    async fn create_stream(
        &self,
        from_height: u64,
        to_height: Option<u64>,
    ) -> Result<StreamHandle> {
        self.enter("create_stream")?;
        let replay: Vec<StreamMessage> = {
            let chain = self.chain.read();
            chain
                .iter()
                .filter(|b| b.height >= from_height && to_height.map_or(true, |to| b.height <= to))
                .flat_map(|b| self.messages_for(b))
                .collect()
        };

        let (sender, receiver) = mpsc::channel(replay.len() + STREAM_HEADROOM);
        for msg in replay {
            sender
                .try_send(msg)
                .map_err(|e| IngestionError::StreamClosed(e.to_string()))?;
        }

        let id = Uuid::new_v4().to_string();
        self.streams
            .lock()
            .insert(id.clone(), Subscription { sender, to_height });
        debug!(stream = %id, from_height, "[qc-18] Stream created");
        Ok(StreamHandle { id, receiver })
    }

    async fn destroy_stream(&self, id: &str) -> Result<()> {
        self.streams.lock().remove(id);
        Ok(())
    }
}
