//! Chain sequences and the reorganization walker.

use std::sync::Arc;

use crate::error::ChainError;
use crate::headers::ChainedHeader;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    Connect,
    Disconnect,
}

impl Direction {
    pub fn sign(self) -> i32 {
        match self {
            Direction::Connect => 1,
            Direction::Disconnect => -1,
        }
    }
}

/// Contiguous headers from genesis (height 0) to a tip.
#[derive(Clone, Debug, Default)]
pub struct Chain {
    headers: Vec<Arc<ChainedHeader>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_headers(headers: Vec<Arc<ChainedHeader>>) -> Result<Self, ChainError> {
        let mut chain = Self::new();
        for header in headers {
            chain.push(header)?;
        }
        Ok(chain)
    }

    pub fn push(&mut self, header: Arc<ChainedHeader>) -> Result<(), ChainError> {
        match self.headers.last() {
            Some(tip) => {
                if header.height != tip.height + 1 || header.header.prev_block != tip.hash {
                    return Err(ChainError::Corruption("non-contiguous chain link"));
                }
            }
            None => {
                if header.height != 0 {
                    return Err(ChainError::Corruption("chain must start at genesis"));
                }
            }
        }
        self.headers.push(header);
        Ok(())
    }

    pub fn tip(&self) -> Option<&Arc<ChainedHeader>> {
        self.headers.last()
    }

    pub fn genesis(&self) -> Option<&Arc<ChainedHeader>> {
        self.headers.first()
    }

    pub fn tip_height(&self) -> Option<i32> {
        self.tip().map(|tip| tip.height)
    }

    pub fn at_height(&self, height: i32) -> Option<&Arc<ChainedHeader>> {
        if height < 0 {
            return None;
        }
        self.headers.get(height as usize)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChainedHeader>> {
        self.headers.iter()
    }
}

/// Ordered steps that transform one chain into another: disconnects from the
/// current tip down to the common ancestor (exclusive), then connects up to
/// the target tip. The ancestor itself is never yielded.
pub struct ChainPath {
    steps: std::vec::IntoIter<(Direction, Arc<ChainedHeader>)>,
}

impl Iterator for ChainPath {
    type Item = (Direction, Arc<ChainedHeader>);

    fn next(&mut self) -> Option<Self::Item> {
        self.steps.next()
    }
}

impl ExactSizeIterator for ChainPath {
    fn len(&self) -> usize {
        self.steps.len()
    }
}

pub fn navigate(current: &Chain, target: &Chain) -> Result<ChainPath, ChainError> {
    let mut steps = Vec::new();

    if current.is_empty() {
        for header in target.iter() {
            steps.push((Direction::Connect, Arc::clone(header)));
        }
        return Ok(ChainPath {
            steps: steps.into_iter(),
        });
    }
    if target.is_empty() {
        return Err(ChainError::NoCommonAncestor);
    }

    // Walk the higher chain down to the other's height, then both down
    // together until the links agree.
    let mut height = current
        .tip_height()
        .unwrap_or(-1)
        .min(target.tip_height().unwrap_or(-1));
    while height >= 0 {
        let current_link = current.at_height(height);
        let target_link = target.at_height(height);
        match (current_link, target_link) {
            (Some(a), Some(b)) if a.hash == b.hash => break,
            _ => height -= 1,
        }
    }
    if height < 0 {
        return Err(ChainError::NoCommonAncestor);
    }

    let ancestor_height = height;
    for header in current.headers[(ancestor_height as usize + 1)..].iter().rev() {
        steps.push((Direction::Disconnect, Arc::clone(header)));
    }
    for header in target.headers[(ancestor_height as usize + 1)..].iter() {
        steps.push((Direction::Connect, Arc::clone(header)));
    }

    Ok(ChainPath {
        steps: steps.into_iter(),
    })
}
