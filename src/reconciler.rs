//! # Cross-chain reconciliation
//!
//! A bridged transfer leaves up to four records behind: `sender → bridge` and a bridge-start
//! event in one transaction on the source chain, then a bridge-end event and `bridge → recipient`
//! (or `void → recipient` when the destination mints) in one transaction on the destination
//! chain. [`CrossChainReconciler`] collapses them into one synthetic `sender → recipient`
//! transfer with three hash joins:
//!
//! 1. source transfers ⋈ source bridge starts on transaction hash
//! 2. stage 1 ⋈ destination bridge ends on message id; bridge-adjacent origin legs are excluded
//! 3. stage 2, one record per destination transaction ⋈ destination transfers on transaction hash;
//!    the destination leg is rewritten to start at the original sender
//!
//! Messages missing a leg are reported as [`ReconciliationError`]s and skipped; they never abort
//! the pass.

use ethers::types::{Address, H256};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ReconciliationError};
use crate::events::{ChainEvent, VOID_ADDRESS};
use crate::metrics;
use crate::settings::ChainConfig;

/// One bridge message whose start and end were both found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgedMessage {
    pub message_id: H256,
    pub origin_transaction: H256,
    pub destination_transaction: H256,
    pub sender: Address,
    pub recipient: Address,
    pub origin_transfer_id: String,
    /// The origin leg touches the bridge and is hidden from the graph.
    pub origin_excluded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// Replacement transfers, ids suffixed with `:bridged`.
    pub transfers: Vec<ChainEvent>,
    /// Ids of raw events the replacements stand in for.
    pub excluded: HashSet<String>,
    pub unmatched: Vec<ReconciliationError>,
    pub messages: Vec<BridgedMessage>,
}

impl Reconciliation {
    pub fn is_excluded(&self, event: &ChainEvent) -> bool {
        self.excluded.contains(&event.id)
    }
}

struct OriginMatch<'a> {
    message_id: H256,
    start: &'a ChainEvent,
    sender: Address,
    transfer: &'a ChainEvent,
}

struct MessageMatch<'a> {
    message_id: H256,
    sender: Address,
    recipient: Address,
    end: &'a ChainEvent,
}

fn bridged_id(event: &ChainEvent) -> String {
    format!("{}:bridged", event.id)
}

fn index_transfers_by_tx(events: &[ChainEvent]) -> HashMap<H256, Vec<&ChainEvent>> {
    let mut index: HashMap<H256, Vec<&ChainEvent>> = HashMap::new();
    for event in events.iter().filter(|e| e.transfer().is_some()) {
        index.entry(event.transaction_hash).or_default().push(event);
    }
    index
}

#[derive(Debug, Clone)]
pub struct CrossChainReconciler {
    source_chain_id: u64,
    source_bridge: Address,
    destination_chain_id: u64,
    destination_bridge: Address,
}

impl CrossChainReconciler {
    /// Both chains need a bridge contract address.
    pub fn new(source: &ChainConfig, destination: &ChainConfig) -> Result<Self, ConfigError> {
        let bridge_of = |chain: &ChainConfig| {
            chain.bridge_contract_address.ok_or(ConfigError::MissingField {
                chain_id: chain.chain_id,
                field: "bridge_contract_address",
            })
        };
        Ok(Self::with_bridges(
            source.chain_id,
            bridge_of(source)?,
            destination.chain_id,
            bridge_of(destination)?,
        ))
    }

    pub fn with_bridges(
        source_chain_id: u64,
        source_bridge: Address,
        destination_chain_id: u64,
        destination_bridge: Address,
    ) -> Self {
        Self {
            source_chain_id,
            source_bridge,
            destination_chain_id,
            destination_bridge,
        }
    }

    /// Joins the two chains' events. `source` and `destination` are each one chain's full set.
    pub fn reconcile(&self, source: &[ChainEvent], destination: &[ChainEvent]) -> Reconciliation {
        let mut result = Reconciliation::default();

        let origins = self.join_origin(source, &mut result);
        let matched = self.join_bridge_end(origins, destination, &mut result);
        self.join_destination(matched, destination, &mut result);

        for err in &result.unmatched {
            warn!(
                source_chain = self.source_chain_id,
                destination_chain = self.destination_chain_id,
                error = %err,
                "Unmatched bridge message"
            );
        }
        info!(
            source_chain = self.source_chain_id,
            destination_chain = self.destination_chain_id,
            messages = result.messages.len(),
            transfers = result.transfers.len(),
            unmatched = result.unmatched.len(),
            "Cross-chain reconciliation finished"
        );
        result
    }

    /// Stage 1: bridge starts with the transfers of their transaction.
    fn join_origin<'a>(
        &self,
        source: &'a [ChainEvent],
        result: &mut Reconciliation,
    ) -> Vec<OriginMatch<'a>> {
        let transfers = index_transfers_by_tx(source);
        let mut origins = Vec::new();
        for start in source {
            let Some(args) = start.bridge_start() else {
                continue;
            };
            match transfers.get(&start.transaction_hash) {
                Some(legs) => {
                    for transfer in legs {
                        origins.push(OriginMatch {
                            message_id: args.message_id,
                            start,
                            sender: args.sender,
                            transfer,
                        });
                    }
                }
                None => {
                    metrics::increment_reconciliation_unmatched("origin_transfer");
                    result.unmatched.push(ReconciliationError::MissingOriginTransfer {
                        message_id: args.message_id,
                        transaction_hash: start.transaction_hash,
                    });
                }
            }
        }
        debug!(records = origins.len(), "Stage 1 joined bridge starts to transfers");
        origins
    }

    /// Stage 2: attach the destination bridge end and classify the origin leg.
    fn join_bridge_end<'a>(
        &self,
        origins: Vec<OriginMatch<'a>>,
        destination: &'a [ChainEvent],
        result: &mut Reconciliation,
    ) -> Vec<MessageMatch<'a>> {
        let mut ends: HashMap<H256, &ChainEvent> = HashMap::new();
        for end in destination {
            if let Some(args) = end.bridge_end() {
                ends.entry(args.message_id).or_insert(end);
            }
        }

        let mut missing: HashSet<H256> = HashSet::new();
        // An origin leg shared by several bridge starts is rewritten once, for the first start.
        let mut rewritten: HashSet<&str> = HashSet::new();
        let mut matched = Vec::new();
        for origin in origins {
            let Some(end) = ends.get(&origin.message_id).copied() else {
                if missing.insert(origin.message_id) {
                    metrics::increment_reconciliation_unmatched("bridge_end");
                    result.unmatched.push(ReconciliationError::MissingBridgeEnd {
                        message_id: origin.message_id,
                    });
                }
                continue;
            };
            let Some(end_args) = end.bridge_end() else {
                continue;
            };
            let Some(leg) = origin.transfer.transfer() else {
                continue;
            };

            let to_bridge = leg.to == self.source_bridge;
            let bridge_burn = leg.from == self.source_bridge && leg.to == VOID_ADDRESS;
            let origin_excluded = to_bridge || bridge_burn;
            if origin_excluded {
                result.excluded.insert(origin.transfer.id.clone());
            } else if leg.from != origin.sender && rewritten.insert(origin.transfer.id.as_str()) {
                let mut attributed = origin.transfer.clone().with_endpoints(origin.sender, leg.to);
                attributed.id = bridged_id(origin.transfer);
                result.excluded.insert(origin.transfer.id.clone());
                result.transfers.push(attributed);
            }
            result.excluded.insert(origin.start.id.clone());
            result.excluded.insert(end.id.clone());

            result.messages.push(BridgedMessage {
                message_id: origin.message_id,
                origin_transaction: origin.start.transaction_hash,
                destination_transaction: end.transaction_hash,
                sender: origin.sender,
                recipient: end_args.recipient,
                origin_transfer_id: origin.transfer.id.clone(),
                origin_excluded,
            });
            matched.push(MessageMatch {
                message_id: origin.message_id,
                sender: origin.sender,
                recipient: end_args.recipient,
                end,
            });
        }
        debug!(records = matched.len(), "Stage 2 joined bridge ends");
        matched
    }

    /// Stage 3: rewrite the destination leg of each bridge-end transaction.
    fn join_destination(
        &self,
        matched: Vec<MessageMatch<'_>>,
        destination: &[ChainEvent],
        result: &mut Reconciliation,
    ) {
        let mut by_tx: IndexMap<H256, MessageMatch<'_>> = IndexMap::new();
        for record in matched {
            by_tx.entry(record.end.transaction_hash).or_insert(record);
        }
        let transfers = index_transfers_by_tx(destination);

        for (tx, record) in by_tx {
            let candidates = transfers.get(&tx).map(Vec::as_slice).unwrap_or(&[]);
            let mut legs: Vec<&ChainEvent> = candidates
                .iter()
                .copied()
                .filter(|e| e.transfer().map(|t| t.to == record.recipient).unwrap_or(false))
                .collect();
            if legs.is_empty() {
                legs = candidates
                    .iter()
                    .copied()
                    .filter(|e| {
                        e.transfer()
                            .map(|t| t.from == self.destination_bridge || t.from == VOID_ADDRESS)
                            .unwrap_or(false)
                    })
                    .collect();
            }
            if legs.is_empty() {
                metrics::increment_reconciliation_unmatched("destination_transfer");
                result.unmatched.push(ReconciliationError::MissingDestinationTransfer {
                    message_id: record.message_id,
                    transaction_hash: tx,
                });
                continue;
            }

            for leg in legs {
                let Some(args) = leg.transfer() else {
                    continue;
                };
                let mut synthetic = leg.clone().with_endpoints(record.sender, args.to);
                synthetic.id = bridged_id(leg);
                result.excluded.insert(leg.id.clone());
                result.transfers.push(synthetic);
            }
        }
    }
}
