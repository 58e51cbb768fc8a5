//! SQLite schema for the job history database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Finished jobs
// =============================================================================

const JOB_HISTORY_TABLE_V1: Table = Table {
    name: "job_history",
    columns: &[
        sqlite_column!("uid", &SqlType::Text, is_primary_key = true),
        sqlite_column!("namespace", &SqlType::Text, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("spec", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("created_at", &SqlType::Text, non_null = true),
        sqlite_column!("finished_at", &SqlType::Text, non_null = true),
        sqlite_column!("transitions", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_job_history_finished_at", "finished_at"),
        ("idx_job_history_namespace", "namespace"),
    ],
    unique_constraints: &[],
};

pub const HISTORY_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[JOB_HISTORY_TABLE_V1],
    migration: None,
}];
