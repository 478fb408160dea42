//! # Export
//!
//! Decides whether a change notification announces a finished export for an eligible kind.
//!
//! An export writes many objects to the backup bucket, and every one of them produces a
//! notification. Only the single completion marker written for each kind is admitted:
//!
//! * Datastore Admin backups write `<handle>.<Kind>.backup_info` once the kind is done, next
//!   to `<handle>.backup_info` for the whole backup and the `output-N` data shards.
//! * Managed exports write
//!   `<prefix>/all_namespaces/kind_<Kind>/all_namespaces_kind_<Kind>.export_metadata`, next to
//!   `<prefix>/<prefix>.overall_export_metadata` and the `output-N` data shards.
use std::collections::HashSet;

use crate::notification::ChangeNotification;

/// A naming convention used by some export mechanism for its per-kind completion marker.
pub trait ExportLayout: Send + Sync {
    /// Returns the kind exported when `object_name` is a completion marker, `None` otherwise.
    /// Must never panic, whatever the shape of `object_name`.
    fn completion_marker_kind<'n>(&self, object_name: &'n str) -> Option<&'n str>;
}

const BACKUP_INFO_EXTENSION: &str = "backup_info";

/// `<handle>.<Kind>.backup_info`, anywhere in the bucket.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatastoreBackupLayout;

impl ExportLayout for DatastoreBackupLayout {
    fn completion_marker_kind<'n>(&self, object_name: &'n str) -> Option<&'n str> {
        let basename = object_name.rsplit('/').next()?;
        let parts: Vec<&str> = basename.split('.').collect();

        match parts.as_slice() {
            [handle, kind, BACKUP_INFO_EXTENSION] if !handle.is_empty() && !kind.is_empty() => {
                Some(*kind)
            }
            _ => None,
        }
    }
}

const MANAGED_NAMESPACE_DIR: &str = "all_namespaces";
const MANAGED_KIND_DIR_PREFIX: &str = "kind_";
const MANAGED_MARKER_PREFIX: &str = "all_namespaces_kind_";
const MANAGED_MARKER_SUFFIX: &str = ".export_metadata";

/// `<prefix>/all_namespaces/kind_<Kind>/all_namespaces_kind_<Kind>.export_metadata`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManagedExportLayout;

impl ExportLayout for ManagedExportLayout {
    fn completion_marker_kind<'n>(&self, object_name: &'n str) -> Option<&'n str> {
        let mut segments = object_name.rsplitn(4, '/');

        let file = segments.next()?;
        let kind_dir = segments.next()?;
        let namespace_dir = segments.next()?;
        let prefix = segments.next()?;

        if prefix.is_empty() || namespace_dir != MANAGED_NAMESPACE_DIR {
            return None;
        }

        let kind = kind_dir.strip_prefix(MANAGED_KIND_DIR_PREFIX)?;
        let marker_kind = file
            .strip_prefix(MANAGED_MARKER_PREFIX)?
            .strip_suffix(MANAGED_MARKER_SUFFIX)?;

        if kind.is_empty() || kind != marker_kind {
            return None;
        }

        Some(kind)
    }
}

/// The layouts checked when no explicit list is given.
pub static DEFAULT_LAYOUTS: [&dyn ExportLayout; 2] = [&DatastoreBackupLayout, &ManagedExportLayout];

/// Why a notification was not admitted.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RejectReason {
    WrongBucket,
    Deleted,
    NotCompletionMarker,
    IneligibleKind,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::WrongBucket => "wrong_bucket",
            RejectReason::Deleted => "deleted",
            RejectReason::NotCompletionMarker => "not_completion_marker",
            RejectReason::IneligibleKind => "ineligible_kind",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ImportDecision {
    /// The notification is the completion marker for this kind.
    Accept(String),
    Reject(RejectReason),
}

/// Evaluate a notification against the given layouts, reporting why it was rejected.
pub fn evaluate(
    layouts: &[&dyn ExportLayout],
    notification: &ChangeNotification,
    expected_bucket: &str,
    eligible_kinds: &HashSet<String>,
) -> ImportDecision {
    if expected_bucket.is_empty() || notification.bucket != expected_bucket {
        return ImportDecision::Reject(RejectReason::WrongBucket);
    }

    if notification.is_deleted() {
        return ImportDecision::Reject(RejectReason::Deleted);
    }

    let kind = match layouts
        .iter()
        .find_map(|layout| layout.completion_marker_kind(&notification.name))
    {
        Some(kind) => kind,
        None => return ImportDecision::Reject(RejectReason::NotCompletionMarker),
    };

    if !eligible_kinds.contains(kind) {
        return ImportDecision::Reject(RejectReason::IneligibleKind);
    }

    ImportDecision::Accept(kind.to_owned())
}

/// Returns the kind to import when `notification` announces a finished export of an eligible
/// kind in `expected_bucket`.
pub fn is_import_target(
    notification: &ChangeNotification,
    expected_bucket: &str,
    eligible_kinds: &HashSet<String>,
) -> Option<String> {
    is_import_target_with(&DEFAULT_LAYOUTS, notification, expected_bucket, eligible_kinds)
}

pub fn is_import_target_with(
    layouts: &[&dyn ExportLayout],
    notification: &ChangeNotification,
    expected_bucket: &str,
    eligible_kinds: &HashSet<String>,
) -> Option<String> {
    match evaluate(layouts, notification, expected_bucket, eligible_kinds) {
        ImportDecision::Accept(kind) => Some(kind),
        ImportDecision::Reject(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const ORDER_BACKUP_INFO: &str =
        "agh0ZXN0YXBwchILEgRfQUVfQmFja3VwX0luZm8Y0YYDDA.Order.backup_info";
    const ORDER_EXPORT_METADATA: &str =
        "2017-11-14T06:47:26_23208/all_namespaces/kind_Order/all_namespaces_kind_Order.export_metadata";

    fn notification(bucket: &str, name: &str) -> ChangeNotification {
        ChangeNotification {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
            time_created: Some(Utc.with_ymd_and_hms(2017, 11, 14, 6, 47, 47).unwrap()),
            ..Default::default()
        }
    }

    fn kinds(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_backup_layout_admits_only_kind_marker() {
        let layout = DatastoreBackupLayout;

        assert_eq!(layout.completion_marker_kind(ORDER_BACKUP_INFO), Some("Order"));
        assert_eq!(
            layout.completion_marker_kind("nightly/handle.Customer.backup_info"),
            Some("Customer")
        );
        assert_eq!(layout.completion_marker_kind("handle.backup_info"), None);
        assert_eq!(
            layout.completion_marker_kind("handle-output-1"),
            None,
            "data shards are not markers"
        );
        assert_eq!(layout.completion_marker_kind("handle.Order.info"), None);
        assert_eq!(layout.completion_marker_kind(".Order.backup_info"), None);
        assert_eq!(layout.completion_marker_kind("a.b.Order.backup_info"), None);
        assert_eq!(layout.completion_marker_kind(""), None);
    }

    #[test]
    fn test_managed_layout_admits_only_kind_marker() {
        let layout = ManagedExportLayout;

        assert_eq!(
            layout.completion_marker_kind(ORDER_EXPORT_METADATA),
            Some("Order")
        );
        assert_eq!(
            layout.completion_marker_kind(
                "exports/nightly/all_namespaces/kind_Order/all_namespaces_kind_Order.export_metadata"
            ),
            Some("Order")
        );
        assert_eq!(
            layout.completion_marker_kind(
                "2017-11-14T06:47:26_23208/2017-11-14T06:47:26_23208.overall_export_metadata"
            ),
            None
        );
        assert_eq!(
            layout.completion_marker_kind(
                "2017-11-14T06:47:26_23208/all_namespaces/kind_Order/output-0"
            ),
            None
        );
        assert_eq!(
            layout.completion_marker_kind(
                "prefix/all_namespaces/kind_Order/all_namespaces_kind_Customer.export_metadata"
            ),
            None,
            "kind directory and marker must agree"
        );
        assert_eq!(
            layout.completion_marker_kind(
                "all_namespaces/kind_Order/all_namespaces_kind_Order.export_metadata"
            ),
            None,
            "an export always has a prefix directory"
        );
        assert_eq!(layout.completion_marker_kind("///"), None);
    }

    #[test]
    fn test_wrong_bucket_never_matches() {
        let eligible = kinds(&["Order"]);

        for name in [ORDER_BACKUP_INFO, ORDER_EXPORT_METADATA] {
            let n = notification("other", name);
            assert_eq!(
                evaluate(&DEFAULT_LAYOUTS, &n, "backup", &eligible),
                ImportDecision::Reject(RejectReason::WrongBucket)
            );
            assert_eq!(
                evaluate(&DEFAULT_LAYOUTS, &n, "", &eligible),
                ImportDecision::Reject(RejectReason::WrongBucket)
            );
        }
    }

    #[test]
    fn test_deleted_never_matches() {
        let mut n = notification("backup", ORDER_EXPORT_METADATA);
        n.time_deleted = Some(Utc.with_ymd_and_hms(2017, 11, 15, 0, 0, 0).unwrap());

        assert_eq!(
            evaluate(&DEFAULT_LAYOUTS, &n, "backup", &kinds(&["Order"])),
            ImportDecision::Reject(RejectReason::Deleted)
        );
    }

    #[test]
    fn test_eligible_kind_is_returned() {
        let eligible = kinds(&["Order", "Customer"]);

        for name in [ORDER_BACKUP_INFO, ORDER_EXPORT_METADATA] {
            assert_eq!(
                is_import_target(&notification("backup", name), "backup", &eligible),
                Some("Order".to_owned())
            );
        }
    }

    #[test]
    fn test_ineligible_kind_is_rejected() {
        let n = notification("backup", ORDER_EXPORT_METADATA);

        assert_eq!(
            evaluate(&DEFAULT_LAYOUTS, &n, "backup", &kinds(&["Customer"])),
            ImportDecision::Reject(RejectReason::IneligibleKind)
        );
        assert_eq!(is_import_target(&n, "backup", &HashSet::new()), None);
    }

    #[test]
    fn test_layouts_are_pluggable() {
        let n = notification("backup", ORDER_BACKUP_INFO);
        let eligible = kinds(&["Order"]);

        assert_eq!(
            is_import_target_with(&[&ManagedExportLayout], &n, "backup", &eligible),
            None
        );
        assert_eq!(
            is_import_target_with(&[&DatastoreBackupLayout], &n, "backup", &eligible),
            Some("Order".to_owned())
        );
    }
}
