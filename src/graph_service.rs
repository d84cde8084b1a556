//! # Graph Service
//!
//! Folds stored transfer events into a weighted directed multigraph: addresses are nodes, every
//! mint/transfer/burn is one edge carrying its originating event.
//!
//! ## Weights
//!
//! A node starts at weight 1 when first seen and gains 1 per further incident transfer,
//! saturating at [`MAX_NODE_WEIGHT`]. For N transfers between two fixed addresses both nodes
//! end at `min(N, 100)`.
//!
//! ## Filters
//!
//! Filters never mutate the folded graph. [`TransferGraph::apply_filters`] runs the weight filter
//! and then the kind filter over a fresh view, so any [`FilterState`] change is an O(E)
//! recomputation without touching the event store.

use ethers::types::Address;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use crate::error::StoreError;
use crate::events::{ChainEvent, EventKind};
use crate::reconciler::Reconciliation;
use crate::store::EventStore;
use crate::utils::abbreviate_address;

pub const MAX_NODE_WEIGHT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: Address,
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub source: Address,
    pub target: Address,
    pub strength: u32,
    /// MINT, TRANSFER or BURN; renderers colour edges by it.
    pub kind: EventKind,
    pub transfer: ChainEvent,
}

/// Renderer-facing `{nodes, edges}` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl GraphView {
    pub fn node_ids(&self) -> HashSet<Address> {
        self.nodes.iter().map(|n| n.id).collect()
    }
}

/// Weight threshold plus the transfer kinds to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterState {
    pub min_weight: u32,
    pub selected_kinds: BTreeSet<EventKind>,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            min_weight: 0,
            selected_kinds: EventKind::TOKEN_KINDS.into_iter().collect(),
        }
    }
}

impl FilterState {
    pub fn new(min_weight: u32) -> Self {
        Self {
            min_weight,
            ..Self::default()
        }
    }

    pub fn all_selected(&self) -> bool {
        EventKind::TOKEN_KINDS
            .iter()
            .all(|kind| self.selected_kinds.contains(kind))
    }

    /// Flips one kind on or off.
    pub fn toggle(&mut self, kind: EventKind) {
        if !self.selected_kinds.remove(&kind) {
            self.selected_kinds.insert(kind);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferGraph {
    nodes: IndexMap<Address, GraphNode>,
    edges: Vec<GraphEdge>,
}

impl TransferGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds every transfer-shaped event; bridge and unknown events are ignored.
    pub fn build(events: &[ChainEvent]) -> Self {
        let mut graph = Self::new();
        for event in events {
            graph.add_transfer(event);
        }
        debug!(nodes = graph.nodes.len(), edges = graph.edges.len(), "Transfer graph built");
        graph
    }

    /// Folds a chain's events with bridged legs replaced by their reconciled transfers.
    pub fn build_reconciled(events: &[ChainEvent], reconciliation: &Reconciliation) -> Self {
        let mut graph = Self::new();
        for event in events.iter().filter(|e| !reconciliation.excluded.contains(&e.id)) {
            graph.add_transfer(event);
        }
        for transfer in &reconciliation.transfers {
            graph.add_transfer(transfer);
        }
        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            excluded = reconciliation.excluded.len(),
            "Reconciled transfer graph built"
        );
        graph
    }

    /// Loads and folds one chain's stored events.
    pub async fn from_store(store: &dyn EventStore, chain_id: u64) -> Result<Self, StoreError> {
        let events = store.get_by_chain(chain_id).await?;
        Ok(Self::build(&events))
    }

    /// Adds one edge and upserts both endpoints. Returns `false` for non-transfer events.
    pub fn add_transfer(&mut self, event: &ChainEvent) -> bool {
        let Some(transfer) = event.transfer() else {
            return false;
        };
        let kind = event.args.kind();
        self.touch_node(transfer.from);
        self.touch_node(transfer.to);
        self.edges.push(GraphEdge {
            source: transfer.from,
            target: transfer.to,
            strength: 1,
            kind,
            transfer: event.clone(),
        });
        true
    }

    fn touch_node(&mut self, address: Address) {
        self.nodes
            .entry(address)
            .and_modify(|node| node.weight = (node.weight + 1).min(MAX_NODE_WEIGHT))
            .or_insert_with(|| GraphNode {
                id: address,
                name: abbreviate_address(&address),
                weight: 1,
            });
    }

    pub fn node(&self, address: &Address) -> Option<&GraphNode> {
        self.nodes.get(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Unfiltered snapshot.
    pub fn view(&self) -> GraphView {
        GraphView {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.clone(),
        }
    }

    fn weight_of(&self, address: &Address) -> u32 {
        self.nodes.get(address).map(|n| n.weight).unwrap_or(0)
    }

    /// Drops nodes with `weight <= min_weight` and edges touching them.
    ///
    /// Edge endpoints are judged by their folded weight, not by the contents of `view`.
    pub fn filter_by_weight(&self, view: &GraphView, min_weight: u32) -> GraphView {
        let nodes = view
            .nodes
            .iter()
            .filter(|n| n.weight > min_weight)
            .cloned()
            .collect();
        let edges = view
            .edges
            .iter()
            .filter(|e| self.weight_of(&e.source) > min_weight && self.weight_of(&e.target) > min_weight)
            .cloned()
            .collect();
        GraphView { nodes, edges }
    }

    /// Keeps edges whose kind is selected plus their endpoints.
    ///
    /// With every kind selected the view is returned as is.
    pub fn filter_by_selection(&self, view: GraphView, selected: &BTreeSet<EventKind>) -> GraphView {
        if EventKind::TOKEN_KINDS.iter().all(|k| selected.contains(k)) {
            return view;
        }
        let edges: Vec<GraphEdge> = view
            .edges
            .into_iter()
            .filter(|e| selected.contains(&e.kind))
            .collect();
        let endpoints: IndexSet<Address> = edges
            .iter()
            .flat_map(|e| [e.source, e.target])
            .collect();
        let nodes = endpoints
            .iter()
            .filter_map(|address| self.nodes.get(address).cloned())
            .collect();
        GraphView { nodes, edges }
    }

    /// Weight filter, then kind filter.
    pub fn apply_filters(&self, filter: &FilterState) -> GraphView {
        let by_weight = self.filter_by_weight(&self.view(), filter.min_weight);
        self.filter_by_selection(by_weight, &filter.selected_kinds)
    }
}
