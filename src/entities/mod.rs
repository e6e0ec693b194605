// Entity Models
//
// Each entity has a stable identity that never changes:
// - Record: key (snapshot of a source entry for one pass)
// - MergedAccount: id (output unit, merged across passes)

pub mod account;
pub mod record;

pub use account::{history_entry, AccountRole, AccountStatus, MergedAccount};
pub use record::Record;
