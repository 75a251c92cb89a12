//! Institutions: one linked bank connection per workspace.

mod core;

pub use core::{
    ConnectionStatus, Institution, NewInstitution, create_institution, create_institution_table,
    get_institution_by_item_id, get_institutions_for_workspace, map_institution_row,
    record_institution_error, set_institution_name, set_institution_status, update_last_synced_at,
};
