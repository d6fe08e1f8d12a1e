use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lenient::{list_from_text, severity_from_i64};
use crate::{
    parse_timestamp, CanonicalComplaint, ComplaintView, RawRecord, RawSnapshotRecord,
    RawStoreRecord, RawView, SourcedComplaint, Submitter, DEFAULT_INSTITUTE, DEFAULT_SEVERITY,
    DEFAULT_STATUS, FALLBACK_CATEGORY,
};

/// Lower-cases and collapses runs of whitespace and `&` into `_`.
pub fn slugify_category(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_separator = false;
    for ch in input.trim().to_lowercase().chars() {
        if ch.is_whitespace() || ch == '&' {
            pending_separator = true;
            continue;
        }
        if pending_separator && !out.is_empty() {
            out.push('_');
        }
        pending_separator = false;
        out.push(ch);
    }
    out
}

/// Maps raw records from either source onto [`CanonicalComplaint`].
///
/// Field resolution is: the view being populated, then the mirrored value from
/// the other view, then a fixed default. Normalization never fails.
#[derive(Debug, Clone)]
pub struct Normalizer {
    default_institute: String,
    now: DateTime<Utc>,
}

impl Normalizer {
    pub fn new(default_institute: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            default_institute: default_institute.into(),
            now,
        }
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self::new(DEFAULT_INSTITUTE, now)
    }

    pub fn normalize(&self, raw: &RawRecord) -> SourcedComplaint {
        let complaint = match raw {
            RawRecord::Store(row) => self.from_store(row),
            RawRecord::Snapshot(record) => self.from_snapshot(record),
        };
        SourcedComplaint {
            source: raw.source(),
            complaint,
        }
    }

    fn from_snapshot(&self, record: &RawSnapshotRecord) -> CanonicalComplaint {
        let student = record.student_view.as_ref();
        let admin = record.admin_view.as_ref();
        let student_view = self.resolve_view(student, admin);
        let admin_view = self.resolve_view(admin, student);
        let category = category_for(
            record.category.as_deref(),
            admin_view
                .departments
                .first()
                .or_else(|| student_view.departments.first())
                .map(String::as_str),
        );

        CanonicalComplaint {
            id: record.id.clone().unwrap_or_else(|| derived_snapshot_id(record)),
            category,
            student_view,
            admin_view,
            submitter: None,
        }
    }

    fn from_store(&self, row: &RawStoreRecord) -> CanonicalComplaint {
        let view = RawView {
            complaint: row.description.clone(),
            departments: row.dept_name.clone().map(|name| vec![name]),
            contacts: row.contacts.as_deref().and_then(list_from_text),
            suggestions: row.suggestions.as_deref().and_then(list_from_text),
            severity: row.severity.and_then(severity_from_i64),
            institute: row
                .institute
                .clone()
                .or_else(|| row.student_institute.clone()),
            timestamp: row.created_at.clone(),
            status: row.status.clone(),
        };
        let resolved = self.resolve_view(Some(&view), None);
        let submitter = (row.student_name.is_some() || row.roll_number.is_some()).then(|| {
            Submitter {
                name: row.student_name.clone(),
                roll_number: row.roll_number.clone(),
            }
        });

        CanonicalComplaint {
            id: row.complaint_id.clone(),
            category: category_for(None, row.dept_name.as_deref()),
            student_view: resolved.clone(),
            admin_view: resolved,
            submitter,
        }
    }

    fn resolve_view(&self, primary: Option<&RawView>, mirror: Option<&RawView>) -> ComplaintView {
        let pick = |field: &dyn Fn(&RawView) -> Option<String>| {
            primary
                .and_then(field)
                .or_else(|| mirror.and_then(field))
        };
        let pick_list = |field: &dyn Fn(&RawView) -> Option<Vec<String>>| {
            primary
                .and_then(field)
                .or_else(|| mirror.and_then(field))
                .unwrap_or_default()
        };
        let timestamp_of =
            |v: &RawView| v.timestamp.as_deref().and_then(parse_timestamp);

        ComplaintView {
            complaint: pick(&|v| v.complaint.clone()).unwrap_or_default(),
            departments: pick_list(&|v| v.departments.clone()),
            contacts: pick_list(&|v| v.contacts.clone()),
            suggestions: pick_list(&|v| v.suggestions.clone()),
            severity: primary
                .and_then(|v| v.severity)
                .or_else(|| mirror.and_then(|v| v.severity))
                .unwrap_or(DEFAULT_SEVERITY),
            institute: pick(&|v| v.institute.clone())
                .unwrap_or_else(|| self.default_institute.clone()),
            timestamp: primary
                .and_then(timestamp_of)
                .or_else(|| mirror.and_then(timestamp_of))
                .unwrap_or(self.now),
            status: pick(&|v| v.status.clone()).unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        }
    }
}

fn category_for(explicit: Option<&str>, first_department: Option<&str>) -> String {
    [explicit, first_department]
        .into_iter()
        .flatten()
        .map(slugify_category)
        .find(|slug| !slug.is_empty())
        .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
}

/// Stable id for snapshot entries the ingester left unnamed.
fn derived_snapshot_id(record: &RawSnapshotRecord) -> String {
    let content = serde_json::to_vec(record).unwrap_or_default();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &content).to_string()
}
