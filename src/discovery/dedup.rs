use std::collections::HashSet;

use crate::types::TransactionDescriptor;

/// First occurrence of each hash, in input order.
pub fn unique_by_hash(batch: Vec<TransactionDescriptor>) -> Vec<TransactionDescriptor> {
    let mut seen = HashSet::with_capacity(batch.len());
    batch
        .into_iter()
        .filter(|tx| seen.insert(tx.hash.clone()))
        .collect()
}
