//! Canonical complaint model and raw source shapes for the grievance desk.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub mod lenient;
mod normalize;

pub use normalize::{slugify_category, Normalizer};

pub const CRATE_NAME: &str = "grv-core";

pub const DEFAULT_SEVERITY: u8 = 3;
pub const DEFAULT_STATUS: &str = "Pending";
pub const DEFAULT_INSTITUTE: &str = "Unknown Institute";
pub const FALLBACK_CATEGORY: &str = "other";

/// Provenance of a record while it travels through the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Store,
    Snapshot,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Store => "store",
            Source::Snapshot => "snapshot",
        }
    }

    /// Lower wins on identity collision.
    pub fn priority(self) -> u8 {
        match self {
            Source::Store => 0,
            Source::Snapshot => 1,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fully-defaulted side (student or admin) of a canonical complaint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintView {
    pub complaint: String,
    pub departments: Vec<String>,
    pub contacts: Vec<String>,
    pub suggestions: Vec<String>,
    pub severity: u8,
    pub institute: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitter {
    pub name: Option<String>,
    pub roll_number: Option<String>,
}

/// Source-agnostic complaint as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalComplaint {
    pub id: String,
    pub category: String,
    pub student_view: ComplaintView,
    pub admin_view: ComplaintView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitter: Option<Submitter>,
}

/// Canonical complaint still carrying its provenance tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedComplaint {
    pub source: Source,
    pub complaint: CanonicalComplaint,
}

impl SourcedComplaint {
    pub fn into_complaint(self) -> CanonicalComplaint {
        self.complaint
    }
}

/// Partially populated view as it arrives from a snapshot file or a batch submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawView {
    #[serde(
        default,
        alias = "description",
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub complaint: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub departments: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "lenient::text_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub contacts: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "lenient::text_list",
        skip_serializing_if = "Option::is_none"
    )]
    pub suggestions: Option<Vec<String>>,
    #[serde(
        default,
        deserialize_with = "lenient::severity",
        skip_serializing_if = "Option::is_none"
    )]
    pub severity: Option<u8>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub institute: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<String>,
}

/// Nested object as written by the external ingestion process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshotRecord {
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub category: Option<String>,
    #[serde(
        default,
        alias = "studentView",
        deserialize_with = "lenient::view",
        skip_serializing_if = "Option::is_none"
    )]
    pub student_view: Option<RawView>,
    #[serde(
        default,
        alias = "adminView",
        deserialize_with = "lenient::view",
        skip_serializing_if = "Option::is_none"
    )]
    pub admin_view: Option<RawView>,
}

/// Flat complaint row joined with department and submitter metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStoreRecord {
    pub complaint_id: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub severity: Option<i64>,
    pub institute: Option<String>,
    /// JSON-encoded list as persisted.
    pub contacts: Option<String>,
    /// JSON-encoded list as persisted.
    pub suggestions: Option<String>,
    pub created_at: Option<String>,
    pub dept_name: Option<String>,
    pub student_name: Option<String>,
    pub roll_number: Option<String>,
    pub student_institute: Option<String>,
}

/// Either source's native record shape. Only the normalizer looks inside.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Store(RawStoreRecord),
    Snapshot(RawSnapshotRecord),
}

impl RawRecord {
    pub fn source(&self) -> Source {
        match self {
            RawRecord::Store(_) => Source::Store,
            RawRecord::Snapshot(_) => Source::Snapshot,
        }
    }
}

/// One externally submitted complaint payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(
        default,
        alias = "studentView",
        deserialize_with = "lenient::view",
        skip_serializing_if = "Option::is_none"
    )]
    pub student_view: Option<RawView>,
    #[serde(
        default,
        alias = "adminView",
        deserialize_with = "lenient::view",
        skip_serializing_if = "Option::is_none"
    )]
    pub admin_view: Option<RawView>,
    #[serde(
        default,
        alias = "studentRollNumber",
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub student_roll_number: Option<String>,
}

/// Statement parameters for one batch item after coalescing both views.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplaintDraft {
    pub id: Option<String>,
    pub description: Option<String>,
    pub department: Option<String>,
    pub status: String,
    pub severity: u8,
    pub institute: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub contacts: Vec<String>,
    pub suggestions: Vec<String>,
    pub student_roll_number: Option<String>,
}

impl BatchItem {
    fn pick<T>(&self, field: impl Fn(&RawView) -> Option<T>) -> Option<T> {
        self.student_view
            .as_ref()
            .and_then(&field)
            .or_else(|| self.admin_view.as_ref().and_then(&field))
    }

    /// Routing follows the admin side first; students rarely pick the right desk.
    pub fn department_name(&self) -> Option<String> {
        let first = |v: &RawView| v.departments.as_ref().and_then(|d| d.first().cloned());
        self.admin_view
            .as_ref()
            .and_then(first)
            .or_else(|| self.student_view.as_ref().and_then(first))
    }

    pub fn draft(&self) -> ComplaintDraft {
        ComplaintDraft {
            id: self.id.clone(),
            description: self.pick(|v| v.complaint.clone()),
            department: self.department_name(),
            status: self
                .pick(|v| v.status.clone())
                .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
            severity: self.pick(|v| v.severity).unwrap_or(DEFAULT_SEVERITY),
            institute: self.pick(|v| v.institute.clone()),
            timestamp: self.pick(|v| v.timestamp.as_deref().and_then(parse_timestamp)),
            contacts: self.pick(|v| v.contacts.clone()).unwrap_or_default(),
            suggestions: self.pick(|v| v.suggestions.clone()).unwrap_or_default(),
            student_roll_number: self.student_roll_number.clone(),
        }
    }
}

/// Request body of the batch endpoint: one item or a list of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchPayload {
    Many(Vec<BatchItem>),
    One(BatchItem),
}

impl BatchPayload {
    pub fn into_items(self) -> Vec<BatchItem> {
        match self {
            BatchPayload::Many(items) => items,
            BatchPayload::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
}

/// Business-rule failures that are reported per item and never abort a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    MissingDepartment,
    DepartmentNotFound,
    MissingDescription,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::MissingDepartment => "missing department",
            FailureReason::DepartmentNotFound => "department not found",
            FailureReason::MissingDescription => "missing description",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub complaint_id: Option<String>,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dept_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<i64>,
}

impl BatchItemResult {
    pub fn success(complaint_id: String, dept_id: i64, student_id: Option<i64>) -> Self {
        Self {
            complaint_id: Some(complaint_id),
            status: ItemStatus::Success,
            reason: None,
            dept_id: Some(dept_id),
            student_id,
        }
    }

    pub fn failed(complaint_id: Option<String>, reason: FailureReason) -> Self {
        Self {
            complaint_id,
            status: ItemStatus::Failed,
            reason: Some(reason.as_str().to_string()),
            dept_id: None,
            student_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, bare dates and epoch seconds/millis.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
    }
    if input.chars().all(|c| c.is_ascii_digit()) {
        let raw: i64 = input.parse().ok()?;
        return if raw > 100_000_000_000 {
            Utc.timestamp_millis_opt(raw).single()
        } else {
            Utc.timestamp_opt(raw, 0).single()
        };
    }
    None
}

/// Persisted form; fixed width so text order equals time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_item_accepts_both_key_styles() {
        let snake: BatchItem = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "student_view": {"complaint": "broken AC", "severity": 2},
            "admin_view": {"departments": ["Facilities"]},
            "student_roll_number": "R-7"
        }))
        .unwrap();
        let camel: BatchItem = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "studentView": {"complaint": "broken AC", "severity": 2},
            "adminView": {"departments": ["Facilities"]},
            "studentRollNumber": "R-7"
        }))
        .unwrap();
        assert_eq!(snake, camel);
        assert_eq!(snake.department_name().as_deref(), Some("Facilities"));
    }

    #[test]
    fn draft_coalesces_student_then_admin_then_default() {
        let item: BatchItem = serde_json::from_value(serde_json::json!({
            "student_view": {"complaint": "leaking roof"},
            "admin_view": {"status": "In Progress", "departments": "Facilities", "timestamp": "2026-03-01 09:30:00"}
        }))
        .unwrap();
        let draft = item.draft();
        assert_eq!(draft.id, None);
        assert_eq!(draft.description.as_deref(), Some("leaking roof"));
        assert_eq!(draft.status, "In Progress");
        assert_eq!(draft.severity, DEFAULT_SEVERITY);
        assert_eq!(draft.department.as_deref(), Some("Facilities"));
        assert_eq!(
            draft.timestamp.map(format_timestamp).as_deref(),
            Some("2026-03-01T09:30:00Z")
        );
    }

    #[test]
    fn batch_payload_single_or_many() {
        let one: BatchPayload = serde_json::from_str(r#"{"id": "a"}"#).unwrap();
        assert_eq!(one.into_items().len(), 1);
        let many: BatchPayload = serde_json::from_str(r#"[{"id": "a"}, {"id": 7}]"#).unwrap();
        let items = many.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id.as_deref(), Some("7"));
    }

    #[test]
    fn item_result_wire_shape() {
        let ok = serde_json::to_value(BatchItemResult::success("c1".into(), 4, None)).unwrap();
        assert_eq!(
            ok,
            serde_json::json!({"complaint_id": "c1", "status": "success", "dept_id": 4})
        );
        let failed = serde_json::to_value(BatchItemResult::failed(
            Some("c2".into()),
            FailureReason::DepartmentNotFound,
        ))
        .unwrap();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["reason"], "department not found");
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(
            parse_timestamp("2026-02-24T12:00:00+02:00").map(format_timestamp).as_deref(),
            Some("2026-02-24T10:00:00Z")
        );
        assert_eq!(
            parse_timestamp("2026-02-24").map(format_timestamp).as_deref(),
            Some("2026-02-24T00:00:00Z")
        );
        assert_eq!(
            parse_timestamp("1772020800000").map(format_timestamp).as_deref(),
            Some("2026-02-25T12:00:00Z")
        );
        assert!(parse_timestamp("yesterday").is_none());
    }
}
