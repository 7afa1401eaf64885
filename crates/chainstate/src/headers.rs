//! Chained-header graph and best-tip selection.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use bitd_consensus::{block_proof, cmp_hash_be, Hash256};
use bitd_primitives::block::BlockHeader;
use bitd_primitives::encoding::{decode, encode};
use bitd_storage::{Column, KeyValueStore};
use primitive_types::U256;

use crate::error::ChainError;
use crate::hash_to_hex;

pub const HEADER_SHARD_COUNT: usize = 64;

const STATUS_HAS_HEADER: u8 = 1 << 0;
const STATUS_FAILED_VALIDATION: u8 = 1 << 1;

/// A header linked into the graph, immutable once created.
#[derive(Clone, Debug)]
pub struct ChainedHeader {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: i32,
    pub total_work: U256,
}

impl ChainedHeader {
    /// Prefer `other` as tip when it has more work, or equal work and a
    /// lower hash.
    fn loses_tip_to(&self, other: &ChainedHeader) -> bool {
        match other.total_work.cmp(&self.total_work) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => {
                cmp_hash_be(&other.hash, &self.hash) == std::cmp::Ordering::Less
            }
            std::cmp::Ordering::Less => false,
        }
    }
}

/// Storage-level view of a chained header.
#[derive(Clone, Debug)]
pub struct HeaderRecord {
    pub chained: ChainedHeader,
    pub invalid: bool,
}

/// Injected persistence service for chained headers.
pub trait BlockStorage: Send + Sync {
    fn try_add_chained_header(&self, record: &HeaderRecord) -> Result<bool, ChainError>;
    fn try_get_chained_header(&self, hash: &Hash256) -> Result<Option<HeaderRecord>, ChainError>;
    fn read_chained_headers(
        &self,
        visitor: &mut dyn FnMut(HeaderRecord),
    ) -> Result<(), ChainError>;
    /// Best valid tip on disk, skipping invalid headers and their
    /// descendants.
    fn find_max_total_work(&self) -> Result<Option<ChainedHeader>, ChainError>;
    fn mark_block_invalid(&self, hash: &Hash256) -> Result<(), ChainError>;
    fn is_block_invalid(&self, hash: &Hash256) -> Result<bool, ChainError>;
}

pub struct KvBlockStorage<S> {
    store: Arc<S>,
}

impl<S> Clone for KvBlockStorage<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> KvBlockStorage<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

fn encode_header_record(record: &HeaderRecord) -> Vec<u8> {
    let mut out = encode(&record.chained.header);
    out.extend_from_slice(&record.chained.height.to_le_bytes());
    out.extend_from_slice(&record.chained.total_work.to_big_endian());
    let mut status = STATUS_HAS_HEADER;
    if record.invalid {
        status |= STATUS_FAILED_VALIDATION;
    }
    out.push(status);
    out
}

fn decode_header_record(hash: &Hash256, bytes: &[u8]) -> Result<HeaderRecord, ChainError> {
    if bytes.len() != 80 + 4 + 32 + 1 {
        return Err(ChainError::Corruption("invalid header record length"));
    }
    let header = decode::<BlockHeader>(&bytes[..80])
        .map_err(|_| ChainError::Corruption("undecodable header record"))?;
    let height = i32::from_le_bytes(
        bytes[80..84]
            .try_into()
            .map_err(|_| ChainError::Corruption("invalid header record length"))?,
    );
    let total_work = U256::from_big_endian(&bytes[84..116]);
    let status = bytes[116];
    Ok(HeaderRecord {
        chained: ChainedHeader {
            header,
            hash: *hash,
            height,
            total_work,
        },
        invalid: status & STATUS_FAILED_VALIDATION != 0,
    })
}

impl<S: KeyValueStore> KvBlockStorage<S> {
    fn load_all(&self) -> Result<HashMap<Hash256, HeaderRecord>, ChainError> {
        let mut records = HashMap::new();
        self.read_chained_headers(&mut |record| {
            records.insert(record.chained.hash, record);
        })?;
        Ok(records)
    }
}

impl<S: KeyValueStore> BlockStorage for KvBlockStorage<S> {
    fn try_add_chained_header(&self, record: &HeaderRecord) -> Result<bool, ChainError> {
        let hash = record.chained.hash;
        if self.store.get(Column::HeaderIndex, &hash)?.is_some() {
            return Ok(false);
        }
        self.store
            .put(Column::HeaderIndex, &hash, &encode_header_record(record))?;
        Ok(true)
    }

    fn try_get_chained_header(&self, hash: &Hash256) -> Result<Option<HeaderRecord>, ChainError> {
        match self.store.get(Column::HeaderIndex, hash)? {
            Some(bytes) => decode_header_record(hash, &bytes).map(Some),
            None => Ok(None),
        }
    }

    fn read_chained_headers(
        &self,
        visitor: &mut dyn FnMut(HeaderRecord),
    ) -> Result<(), ChainError> {
        let mut failure: Option<ChainError> = None;
        self.store
            .for_each_prefix(Column::HeaderIndex, &[], &mut |key, value| {
                let hash: Hash256 = match key.try_into() {
                    Ok(hash) => hash,
                    Err(_) => {
                        failure = Some(ChainError::Corruption("invalid header key length"));
                        return Err(bitd_storage::StoreError::Backend(
                            "invalid header key".to_string(),
                        ));
                    }
                };
                match decode_header_record(&hash, value) {
                    Ok(record) => {
                        visitor(record);
                        Ok(())
                    }
                    Err(err) => {
                        failure = Some(err);
                        Err(bitd_storage::StoreError::Backend(
                            "invalid header record".to_string(),
                        ))
                    }
                }
            })
            .map_err(|err| failure.take().unwrap_or(ChainError::Store(err)))?;
        Ok(())
    }

    fn find_max_total_work(&self) -> Result<Option<ChainedHeader>, ChainError> {
        let records = self.load_all()?;
        let mut memo: HashMap<Hash256, bool> = HashMap::new();
        let mut best: Option<&ChainedHeader> = None;
        for record in records.values() {
            if excluded(&record.chained.hash, &records, &mut memo) {
                continue;
            }
            let candidate = &record.chained;
            match best {
                Some(current) if !current.loses_tip_to(candidate) => {}
                _ => best = Some(candidate),
            }
        }
        Ok(best.cloned())
    }

    fn mark_block_invalid(&self, hash: &Hash256) -> Result<(), ChainError> {
        let record = self
            .try_get_chained_header(hash)?
            .ok_or(ChainError::MissingData(*hash))?;
        let updated = HeaderRecord {
            chained: record.chained,
            invalid: true,
        };
        self.store
            .put(Column::HeaderIndex, hash, &encode_header_record(&updated))?;
        Ok(())
    }

    fn is_block_invalid(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self
            .try_get_chained_header(hash)?
            .map(|record| record.invalid)
            .unwrap_or(false))
    }
}

/// True when the header or any stored ancestor carries the failed mark.
fn excluded(
    hash: &Hash256,
    records: &HashMap<Hash256, HeaderRecord>,
    memo: &mut HashMap<Hash256, bool>,
) -> bool {
    let mut walk = Vec::new();
    let mut current = *hash;
    let verdict = loop {
        if let Some(known) = memo.get(&current) {
            break *known;
        }
        let Some(record) = records.get(&current) else {
            break false;
        };
        if record.invalid {
            break true;
        }
        if record.chained.height == 0 {
            break false;
        }
        walk.push(current);
        current = record.chained.header.prev_block;
    };
    memo.insert(current, verdict);
    for visited in walk {
        memo.insert(visited, verdict);
    }
    verdict
}

type AddedHandler = Box<dyn Fn(&Arc<ChainedHeader>) + Send + Sync>;
type InvalidatedHandler = Box<dyn Fn(&Hash256) + Send + Sync>;

struct HeaderShard {
    entries: HashMap<Hash256, Arc<ChainedHeader>>,
    invalid: HashSet<Hash256>,
    absent: HashSet<Hash256>,
}

impl HeaderShard {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            invalid: HashSet::new(),
            absent: HashSet::new(),
        }
    }
}

/// Append-only graph of chained headers with best-work tip selection.
///
/// Readers go through sharded caches; writers serialize on one mutation
/// lock. Negative lookups are cached until an insert for that hash lands.
pub struct HeaderGraph {
    storage: Arc<dyn BlockStorage>,
    write_lock: Mutex<()>,
    shards: Vec<RwLock<HeaderShard>>,
    genesis: RwLock<Option<Arc<ChainedHeader>>>,
    best: RwLock<Option<Arc<ChainedHeader>>>,
    added_handlers: RwLock<Vec<AddedHandler>>,
    invalidated_handlers: RwLock<Vec<InvalidatedHandler>>,
}

impl HeaderGraph {
    pub fn open(storage: Arc<dyn BlockStorage>) -> Result<Self, ChainError> {
        let mut shards = Vec::with_capacity(HEADER_SHARD_COUNT);
        for _ in 0..HEADER_SHARD_COUNT {
            shards.push(RwLock::new(HeaderShard::new()));
        }
        let graph = Self {
            storage,
            write_lock: Mutex::new(()),
            shards,
            genesis: RwLock::new(None),
            best: RwLock::new(None),
            added_handlers: RwLock::new(Vec::new()),
            invalidated_handlers: RwLock::new(Vec::new()),
        };
        graph.bootstrap()?;
        Ok(graph)
    }

    fn bootstrap(&self) -> Result<(), ChainError> {
        let mut genesis: Option<Arc<ChainedHeader>> = None;
        self.storage.read_chained_headers(&mut |record| {
            let chained = Arc::new(record.chained);
            if chained.height == 0 {
                genesis = Some(Arc::clone(&chained));
            }
            let mut shard = self.shard(&chained.hash).write().expect("header shard");
            if record.invalid {
                shard.invalid.insert(chained.hash);
            }
            shard.entries.insert(chained.hash, chained);
        })?;
        *self.genesis.write().expect("genesis lock") = genesis;
        let best = self.storage.find_max_total_work()?;
        *self.best.write().expect("best lock") = best.map(Arc::new);
        Ok(())
    }

    fn shard(&self, hash: &Hash256) -> &RwLock<HeaderShard> {
        &self.shards[(hash[0] as usize) % HEADER_SHARD_COUNT]
    }

    pub fn on_chained_header_added(
        &self,
        handler: impl Fn(&Arc<ChainedHeader>) + Send + Sync + 'static,
    ) {
        self.added_handlers
            .write()
            .expect("handler lock")
            .push(Box::new(handler));
    }

    pub fn on_invalidated(&self, handler: impl Fn(&Hash256) + Send + Sync + 'static) {
        self.invalidated_handlers
            .write()
            .expect("handler lock")
            .push(Box::new(handler));
    }

    fn fire_added(&self, chained: &Arc<ChainedHeader>) {
        let handlers = self.added_handlers.read().expect("handler lock");
        for handler in handlers.iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(chained))).is_err() {
                bitd_log::log_error!(
                    "header-added handler panicked for {}",
                    hash_to_hex(&chained.hash)
                );
            }
        }
    }

    fn fire_invalidated(&self, hash: &Hash256) {
        let handlers = self.invalidated_handlers.read().expect("handler lock");
        for handler in handlers.iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(hash))).is_err() {
                bitd_log::log_error!("invalidated handler panicked for {}", hash_to_hex(hash));
            }
        }
    }

    pub fn get(&self, hash: &Hash256) -> Result<Option<Arc<ChainedHeader>>, ChainError> {
        {
            let shard = self.shard(hash).read().expect("header shard");
            if let Some(entry) = shard.entries.get(hash) {
                return Ok(Some(Arc::clone(entry)));
            }
            if shard.absent.contains(hash) {
                return Ok(None);
            }
        }
        match self.storage.try_get_chained_header(hash)? {
            Some(record) => {
                let chained = Arc::new(record.chained);
                let mut shard = self.shard(hash).write().expect("header shard");
                if record.invalid {
                    shard.invalid.insert(*hash);
                }
                shard.entries.insert(*hash, Arc::clone(&chained));
                Ok(Some(chained))
            }
            None => {
                let mut shard = self.shard(hash).write().expect("header shard");
                shard.absent.insert(*hash);
                Ok(None)
            }
        }
    }

    pub fn contains(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.get(hash)?.is_some())
    }

    pub fn add_genesis(&self, header: BlockHeader) -> Result<Arc<ChainedHeader>, ChainError> {
        let hash = header.hash();
        let guard = self.write_lock.lock().expect("header write lock");
        if let Some(existing) = self.genesis.read().expect("genesis lock").clone() {
            if existing.hash == hash {
                return Ok(existing);
            }
            return Err(ChainError::Validation(hash));
        }
        let total_work = block_proof(header.bits).map_err(|_| ChainError::Validation(hash))?;
        let chained = Arc::new(ChainedHeader {
            header,
            hash,
            height: 0,
            total_work,
        });
        self.storage.try_add_chained_header(&HeaderRecord {
            chained: (*chained).clone(),
            invalid: false,
        })?;
        self.insert_entry(&chained, false);
        *self.genesis.write().expect("genesis lock") = Some(Arc::clone(&chained));
        self.maybe_advance_best(&chained);
        drop(guard);
        self.fire_added(&chained);
        Ok(chained)
    }

    /// Links a header whose parent is already chained. Returns the existing
    /// entry when re-submitted; returns `None` when the parent is unknown.
    pub fn try_chain(&self, header: BlockHeader) -> Result<Option<Arc<ChainedHeader>>, ChainError> {
        let hash = header.hash();
        if let Some(existing) = self.get(&hash)? {
            return Ok(Some(existing));
        }
        let guard = self.write_lock.lock().expect("header write lock");
        if let Some(existing) = self.get(&hash)? {
            return Ok(Some(existing));
        }
        let Some(parent) = self.get(&header.prev_block)? else {
            return Ok(None);
        };
        let Ok(work) = block_proof(header.bits) else {
            return Ok(None);
        };
        let total_work = parent
            .total_work
            .checked_add(work)
            .ok_or(ChainError::Corruption("total work overflow"))?;
        let height = parent
            .height
            .checked_add(1)
            .ok_or(ChainError::Corruption("height overflow"))?;
        let inherits_invalid = self.is_invalid(&parent.hash)?;
        let chained = Arc::new(ChainedHeader {
            header,
            hash,
            height,
            total_work,
        });
        self.storage.try_add_chained_header(&HeaderRecord {
            chained: (*chained).clone(),
            invalid: inherits_invalid,
        })?;
        self.insert_entry(&chained, inherits_invalid);
        if !inherits_invalid {
            self.maybe_advance_best(&chained);
        }
        drop(guard);
        self.fire_added(&chained);
        Ok(Some(chained))
    }

    fn insert_entry(&self, chained: &Arc<ChainedHeader>, invalid: bool) {
        let mut shard = self.shard(&chained.hash).write().expect("header shard");
        shard.absent.remove(&chained.hash);
        if invalid {
            shard.invalid.insert(chained.hash);
        }
        shard.entries.insert(chained.hash, Arc::clone(chained));
    }

    fn maybe_advance_best(&self, candidate: &Arc<ChainedHeader>) {
        let mut best = self.best.write().expect("best lock");
        let advance = match best.as_ref() {
            Some(current) => current.loses_tip_to(candidate),
            None => true,
        };
        if advance {
            *best = Some(Arc::clone(candidate));
        }
    }

    /// The valid header with the greatest total work; equal work breaks
    /// toward the lowest hash.
    pub fn max_total_work_tip(&self) -> Option<Arc<ChainedHeader>> {
        self.best.read().expect("best lock").clone()
    }

    /// Marks a header consensus-invalid. Descendants are excluded from tip
    /// selection through their ancestry.
    pub fn mark_invalid(&self, hash: &Hash256) -> Result<(), ChainError> {
        let guard = self.write_lock.lock().expect("header write lock");
        self.storage.mark_block_invalid(hash)?;
        {
            let mut shard = self.shard(hash).write().expect("header shard");
            shard.invalid.insert(*hash);
        }
        let best_invalidated = match self.best.read().expect("best lock").clone() {
            Some(best) => self.is_invalid(&best.hash)?,
            None => false,
        };
        if best_invalidated {
            let best = self.storage.find_max_total_work()?;
            *self.best.write().expect("best lock") = best.map(Arc::new);
        }
        drop(guard);
        bitd_log::log_warn!("marked block invalid: {}", hash_to_hex(hash));
        self.fire_invalidated(hash);
        Ok(())
    }

    /// True when the header or any of its ancestors carries an invalid mark.
    pub fn is_invalid(&self, hash: &Hash256) -> Result<bool, ChainError> {
        let mut current = *hash;
        loop {
            {
                let shard = self.shard(&current).read().expect("header shard");
                if shard.invalid.contains(&current) {
                    return Ok(true);
                }
            }
            let Some(chained) = self.get(&current)? else {
                return Ok(false);
            };
            if chained.height == 0 {
                return Ok(false);
            }
            current = chained.header.prev_block;
        }
    }

    /// Builds the full chain from genesis to the given tip.
    pub fn chain_to(&self, tip: &Hash256) -> Result<crate::chain::Chain, ChainError> {
        let mut headers = Vec::new();
        let mut current = *tip;
        loop {
            let chained = self.get(&current)?.ok_or(ChainError::MissingData(current))?;
            let height = chained.height;
            let prev = chained.header.prev_block;
            headers.push(chained);
            if height == 0 {
                break;
            }
            current = prev;
        }
        headers.reverse();
        crate::chain::Chain::from_headers(headers)
    }
}
