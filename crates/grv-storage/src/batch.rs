//! Batch upsert of externally submitted complaints inside one transaction.

use grv_core::{format_timestamp, BatchItem, BatchItemResult, FailureReason};
use sqlx::{Sqlite, Transaction};
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{department_id, student_id, ComplaintStore, StorageError};

const UPSERT_COMPLAINT: &str = r#"
    INSERT INTO complaints (
        complaint_id, description, status, severity, institute,
        contacts, suggestions, created_at, dept_id, student_id
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, COALESCE(?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now')), ?, ?)
    ON CONFLICT(complaint_id) DO UPDATE SET
        description = excluded.description,
        status = excluded.status,
        severity = excluded.severity,
        institute = excluded.institute,
        contacts = excluded.contacts,
        suggestions = excluded.suggestions,
        created_at = CASE WHEN ? IS NULL THEN complaints.created_at ELSE excluded.created_at END,
        dept_id = excluded.dept_id,
        student_id = excluded.student_id
"#;

impl ComplaintStore {
    /// Applies every item in order inside a single transaction.
    ///
    /// Business-rule problems (missing or unknown department, missing text)
    /// become `failed` results and the batch carries on. Any statement error
    /// or an expired deadline rolls the whole batch back and is returned
    /// instead of the per-item results.
    pub async fn apply_batch(
        &self,
        items: &[BatchItem],
    ) -> Result<Vec<BatchItemResult>, StorageError> {
        let deadline = self.tx_timeout;
        let span = info_span!("apply_batch", items = items.len());
        match timeout(deadline, self.run_batch(items)).instrument(span).await {
            Ok(outcome) => outcome,
            Err(_) => {
                // Dropping the in-flight transaction rolls it back.
                error!(?deadline, "batch transaction deadline expired; rolled back");
                Err(StorageError::Timeout(deadline))
            }
        }
    }

    async fn run_batch(&self, items: &[BatchItem]) -> Result<Vec<BatchItemResult>, StorageError> {
        // Write lock up front: a deferred transaction cannot wait out another
        // committer when it upgrades from reader to writer.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            match apply_item(&mut tx, index, item).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    error!(index, error = %err, "batch statement failed; rolling back");
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "explicit rollback failed");
                    }
                    return Err(err);
                }
            }
        }

        tx.commit().await?;
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            succeeded,
            failed = results.len() - succeeded,
            "batch committed"
        );
        Ok(results)
    }
}

async fn apply_item(
    tx: &mut Transaction<'static, Sqlite>,
    index: usize,
    item: &BatchItem,
) -> Result<BatchItemResult, StorageError> {
    let draft = item.draft();
    let statement_error = |source| StorageError::Statement { index, source };

    let Some(department) = draft.department.as_deref() else {
        info!(index, complaint_id = ?draft.id, "batch item names no department");
        return Ok(BatchItemResult::failed(
            draft.id,
            FailureReason::MissingDepartment,
        ));
    };
    let Some(dept_id) = department_id(&mut **tx, department)
        .await
        .map_err(statement_error)?
    else {
        info!(index, department, "batch item names an unknown department");
        return Ok(BatchItemResult::failed(
            draft.id,
            FailureReason::DepartmentNotFound,
        ));
    };
    let Some(description) = draft.description.as_deref() else {
        info!(index, complaint_id = ?draft.id, "batch item has no complaint text");
        return Ok(BatchItemResult::failed(
            draft.id,
            FailureReason::MissingDescription,
        ));
    };

    let student_id = match draft.student_roll_number.as_deref() {
        Some(roll_number) => student_id(&mut **tx, roll_number)
            .await
            .map_err(statement_error)?,
        None => None,
    };

    let complaint_id = draft
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let contacts = serde_json::to_string(&draft.contacts).map_err(|source| {
        StorageError::Encode {
            field: "contacts",
            source,
        }
    })?;
    let suggestions = serde_json::to_string(&draft.suggestions).map_err(|source| {
        StorageError::Encode {
            field: "suggestions",
            source,
        }
    })?;
    let timestamp = draft.timestamp.map(format_timestamp);

    sqlx::query(UPSERT_COMPLAINT)
        .bind(&complaint_id)
        .bind(description)
        .bind(&draft.status)
        .bind(i64::from(draft.severity))
        .bind(draft.institute.as_deref())
        .bind(&contacts)
        .bind(&suggestions)
        .bind(timestamp.as_deref())
        .bind(dept_id)
        .bind(student_id)
        .bind(timestamp.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(statement_error)?;

    Ok(BatchItemResult::success(complaint_id, dept_id, student_id))
}
