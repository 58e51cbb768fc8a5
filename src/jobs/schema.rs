//! SQLite schema for the live job database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Jobs
// =============================================================================

/// `id` gives creation order; claims scan by it.
const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true), // AUTOINCREMENT
        sqlite_column!("namespace", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("uid", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("spec", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("lease_holder", &SqlType::Text),
        sqlite_column!("lease_expires_at", &SqlType::Text),
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("transitions", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_jobs_state", "state"),
        ("idx_jobs_lease_expires_at", "lease_expires_at"),
    ],
    unique_constraints: &[&["namespace", "name"]],
};

pub const JOB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[JOBS_TABLE_V1],
    migration: None,
}];
