//! The entity × period grid passed between workflow steps.
//!
//! A [`DataContainer`] is a sparse two-dimensional map
//! `entity -> period -> cell` plus lineage and diagnostics. Both axes keep
//! insertion order so that repeated runs over the same inputs serialize to
//! identical JSON. Containers are values: every transformation returns a new
//! container and leaves the receiver untouched.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::payload::{BundleItem, DocumentRef, Payload};
use crate::period::{ALL_KEY, Period};

/// Identifier of an analyzed subject (ticker, instrument id).
pub type EntityId = String;

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

/// One (entity, period) address.
///
/// `payload == None` is a placeholder: the cell exists in the grid (and in the
/// shape) but is not counted as an item. `document` carries the resolved
/// source document for placeholders created by the Input step, so analysis
/// steps never fetch the same document twice within a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cell {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentRef>,
}

impl Cell {
    pub fn placeholder() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: Payload) -> Self {
        Self {
            payload: Some(payload),
            document: None,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.payload.is_none()
    }

    /// The document this cell refers to, whether it holds a document payload
    /// or is a placeholder with a resolved document.
    pub fn source_document(&self) -> Option<&DocumentRef> {
        self.payload
            .as_ref()
            .and_then(Payload::as_document)
            .or(self.document.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Grid dimensions: distinct entities and the maximum period count of any one
/// entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub entities: usize,
    pub periods: usize,
}

impl Shape {
    pub fn new(entities: usize, periods: usize) -> Self {
        Self { entities, periods }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.entities, self.periods)
    }
}

/// Why a single cell failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// Retries exhausted on a transient service error.
    Transient,
    /// The service rejected the request outright.
    Fatal,
    /// Every attempt hit the per-call timeout.
    Timeout,
    /// The worker itself failed (panic, join error).
    Internal,
}

/// A per-cell failure recorded inside the container that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub entity: EntityId,
    pub period: Period,
    pub kind: ItemErrorKind,
    pub message: String,
    #[serde(default)]
    pub attempts: u32,
}

/// Non-fatal observations attached to a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Warning {
    /// A requested cell could not be resolved.
    Missing {
        entity: EntityId,
        period: Period,
        reason: String,
    },
    /// A step produced no items.
    EmptyResult { step_id: String },
    Note { message: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::Missing {
                entity,
                period,
                reason,
            } => write!(f, "missing {entity}/{period}: {reason}"),
            Warning::EmptyResult { step_id } => write!(f, "step '{step_id}' produced no items"),
            Warning::Note { message } => f.write_str(message),
        }
    }
}

/// Axis along which cells are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupAxis {
    /// One group per entity; the period axis collapses to `ALL`.
    #[default]
    Entity,
    /// One group per period; the entity axis collapses to `ALL`.
    Period,
    /// A single group holding every cell.
    All,
}

/// Cells sharing one output address after grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct CellGroup {
    pub entity: EntityId,
    pub period: Period,
    /// Non-nil members in grid order.
    pub members: Vec<BundleItem>,
}

// ---------------------------------------------------------------------------
// DataContainer
// ---------------------------------------------------------------------------

/// Sparse entity × period grid of payloads with lineage and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataContainer {
    pub data: IndexMap<EntityId, IndexMap<Period, Cell>>,
    pub step_id: String,
    pub step_type: String,
    pub created_at: DateTime<Utc>,
    /// External analysis invocations that produced this data.
    #[serde(default)]
    pub source_run_ids: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ItemError>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    /// Files written from this container by export steps.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl DataContainer {
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            data: IndexMap::new(),
            step_id: step_id.into(),
            step_type: step_type.into(),
            created_at: Utc::now(),
            source_run_ids: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// An empty container for a downstream step that inherits this
    /// container's lineage and diagnostics.
    pub fn derive(&self, step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let mut next = Self::new(step_id, step_type);
        next.source_run_ids = self.source_run_ids.clone();
        next.errors = self.errors.clone();
        next.warnings = self.warnings.clone();
        next
    }

    /// Re-label a copy of this container as the output of another step.
    /// Data and diagnostics are kept; export artifacts are not.
    pub fn relabel(&self, step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let mut next = self.derive(step_id, step_type);
        next.data = self.data.clone();
        next
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn shape(&self) -> Shape {
        let periods = self.data.values().map(IndexMap::len).max().unwrap_or(0);
        Shape::new(self.data.len(), periods)
    }

    /// Count of non-nil cells.
    pub fn total_items(&self) -> usize {
        self.cells().filter(|(_, _, cell)| !cell.is_nil()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// Distinct periods in first-seen order.
    pub fn periods(&self) -> Vec<Period> {
        let mut seen: Vec<Period> = Vec::new();
        for period in self.data.values().flat_map(IndexMap::keys) {
            if !seen.contains(period) {
                seen.push(period.clone());
            }
        }
        seen
    }

    /// Every cell in grid order, placeholders included.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &Period, &Cell)> {
        self.data.iter().flat_map(|(entity, periods)| {
            periods
                .iter()
                .map(move |(period, cell)| (entity.as_str(), period, cell))
        })
    }

    /// Non-nil payloads in grid order.
    pub fn items(&self) -> impl Iterator<Item = (&str, &Period, &Payload)> {
        self.cells()
            .filter_map(|(e, p, cell)| cell.payload.as_ref().map(|payload| (e, p, payload)))
    }

    pub fn get(&self, entity: &str, period: &Period) -> Option<&Cell> {
        self.data.get(entity).and_then(|periods| periods.get(period))
    }

    // -----------------------------------------------------------------------
    // Mutation (used while a step builds its output)
    // -----------------------------------------------------------------------

    pub fn insert_cell(&mut self, entity: impl Into<EntityId>, period: Period, cell: Cell) {
        self.data
            .entry(entity.into())
            .or_default()
            .insert(period, cell);
    }

    /// Set the payload of a cell, creating the cell if needed. An existing
    /// document reference on the cell is kept.
    pub fn set_payload(&mut self, entity: impl Into<EntityId>, period: Period, payload: Option<Payload>) {
        self.data
            .entry(entity.into())
            .or_default()
            .entry(period)
            .or_default()
            .payload = payload;
    }

    /// Record an external invocation id once.
    pub fn record_source_run(&mut self, run_id: impl Into<String>) {
        let run_id = run_id.into();
        if !self.source_run_ids.contains(&run_id) {
            self.source_run_ids.push(run_id);
        }
    }

    // -----------------------------------------------------------------------
    // Value operations
    // -----------------------------------------------------------------------

    /// A copy with one cell's payload set (overwriting any previous payload).
    pub fn with_data(&self, entity: impl Into<EntityId>, period: Period, payload: Payload) -> Self {
        let mut next = self.clone();
        next.set_payload(entity, period, Some(payload));
        next
    }

    /// A copy holding only the non-nil cells the predicate accepts. Dropped
    /// cells are removed from the grid, and entities left without periods are
    /// removed too. An empty result is recorded as a
    /// [`Warning::EmptyResult`]; it is never an error here.
    pub fn filter_by<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&str, &Period, &Payload) -> bool,
    {
        let mut next = self.clone();
        next.data.clear();
        for (entity, period, payload) in self.items() {
            if predicate(entity, period, payload) {
                if let Some(cell) = self.get(entity, period) {
                    next.insert_cell(entity, period.clone(), cell.clone());
                }
            }
        }
        if next.is_empty() {
            next.warnings.push(Warning::EmptyResult {
                step_id: next.step_id.clone(),
            });
        }
        next
    }

    /// Split the grid into groups along `axis`. Groups appear in grid order;
    /// a group whose cells are all nil still appears, with no members.
    pub fn group_cells(&self, axis: GroupAxis) -> Vec<CellGroup> {
        match axis {
            GroupAxis::All => vec![CellGroup {
                entity: ALL_KEY.to_string(),
                period: Period::All,
                members: self.items().map(to_bundle_item).collect(),
            }],
            GroupAxis::Entity => self
                .data
                .iter()
                .map(|(entity, periods)| CellGroup {
                    entity: entity.clone(),
                    period: Period::All,
                    members: periods
                        .iter()
                        .filter_map(|(period, cell)| {
                            cell.payload
                                .as_ref()
                                .map(|payload| to_bundle_item((entity.as_str(), period, payload)))
                        })
                        .collect(),
                })
                .collect(),
            GroupAxis::Period => self
                .periods()
                .into_iter()
                .map(|period| {
                    let members = self
                        .items()
                        .filter(|(_, p, _)| **p == period)
                        .map(to_bundle_item)
                        .collect();
                    CellGroup {
                        entity: ALL_KEY.to_string(),
                        period,
                        members,
                    }
                })
                .collect(),
        }
    }

    /// Collapse the grid along `axis` without calling any service: groups
    /// with one member keep that payload, larger groups become a
    /// [`Payload::Bundle`], and empty groups become nil cells.
    pub fn collapse(&self, axis: GroupAxis) -> Self {
        let mut next = self.derive(self.step_id.clone(), self.step_type.clone());
        for group in self.group_cells(axis) {
            let payload = bundle_members(group.members);
            next.insert_cell(
                group.entity,
                group.period,
                Cell {
                    payload,
                    document: None,
                },
            );
        }
        next
    }

    /// Combine every cell into one `(ALL, ALL)` cell. Always shape (1, 1).
    pub fn merge_all(&self) -> Self {
        self.collapse(GroupAxis::All)
    }

    /// One summary cell per entity. Always shape (E, 1).
    pub fn group_by_entity(&self) -> Self {
        self.collapse(GroupAxis::Entity)
    }

    /// One summary cell per period under the `ALL` entity. Shape (1, P).
    pub fn group_by_period(&self) -> Self {
        self.collapse(GroupAxis::Period)
    }
}

fn to_bundle_item((entity, period, payload): (&str, &Period, &Payload)) -> BundleItem {
    BundleItem {
        entity: entity.to_string(),
        period: period.clone(),
        payload: payload.clone(),
    }
}

/// Fold group members into a single payload without synthesis.
pub fn bundle_members(mut members: Vec<BundleItem>) -> Option<Payload> {
    match members.len() {
        0 => None,
        1 => members.pop().map(|item| item.payload),
        _ => Some(Payload::Bundle(members)),
    }
}
