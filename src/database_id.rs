//! Database ID type definitions.

/// Alias for the integer type used for mapping to database IDs.
pub type DatabaseId = i64;
/// The ID of an institution row.
pub type InstitutionId = i64;
/// The ID of a bank account row.
pub type AccountId = i64;
/// The ID of a workspace, the tenant boundary scoping all financial data.
pub type WorkspaceId = i64;
