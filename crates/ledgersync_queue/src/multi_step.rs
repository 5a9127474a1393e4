//! Multi-step operation composition.
//!
//! A cross-entity business transaction ("create the customer, then create a
//! bill referencing them") must reach the remote store in causal order and
//! must be resumable step by step after a crash. That is achieved purely
//! through ordering discipline plus per-step idempotent operation ids, not a
//! network-level transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::operation::{OperationType, Payload, QueueItem};

/// One step of a multi-step operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStep {
    /// Human-readable step name, kept for operator diagnostics.
    pub name: String,
    /// Collection the step targets.
    pub collection: String,
    /// Document id within the collection.
    pub document_id: String,
    /// Mutation type.
    pub op_type: OperationType,
    /// Mutation body.
    pub payload: Payload,
}

/// An ordered group of causally dependent mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepOp {
    /// Shared id stamped on every composed record.
    pub parent_operation_id: String,
    /// The acting principal.
    pub user_id: String,
    /// The tenant the transaction belongs to.
    pub owner_id: String,
    /// Operator-facing description of the transaction.
    pub description: String,
    /// Creation time, shared by all composed records.
    pub created_at: DateTime<Utc>,
    /// Steps in causal order.
    pub steps: Vec<OperationStep>,
}

impl MultiStepOp {
    /// Creates a new group with a fresh parent id.
    pub fn new(
        user_id: impl Into<String>,
        owner_id: impl Into<String>,
        description: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            parent_operation_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            owner_id: owner_id.into(),
            description: description.into(),
            created_at,
            steps: Vec::new(),
        }
    }

    /// Appends a step, preserving causal order.
    pub fn add_step(
        mut self,
        name: impl Into<String>,
        op_type: OperationType,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        self.steps.push(OperationStep {
            name: name.into(),
            collection: collection.into(),
            document_id: document_id.into(),
            op_type,
            payload,
        });
        self
    }

    /// Composes one queue item per step.
    ///
    /// Items come back in input order, each carrying the shared parent id,
    /// its 1-based step number, and the group's total step count. The group
    /// must have at least one step.
    pub fn queue_items(&self, priority: i32) -> QueueResult<Vec<QueueItem>> {
        if self.steps.is_empty() {
            return Err(QueueError::EmptyOperationGroup {
                parent_id: self.parent_operation_id.clone(),
            });
        }

        let total = self.steps.len() as u32;
        let items = self
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                QueueItem::create(
                    self.user_id.clone(),
                    self.owner_id.clone(),
                    step.op_type.clone(),
                    step.collection.clone(),
                    step.document_id.clone(),
                    step.payload.clone(),
                    self.created_at,
                )
                .with_priority(priority)
                .with_group(self.parent_operation_id.clone(), index as u32 + 1, total)
            })
            .collect();

        Ok(items)
    }
}
