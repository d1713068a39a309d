//! redb table definitions for the gridscale state store.

use redb::TableDefinition;

/// Controller state values keyed by `<root>/<service>/<instance>/<field>`.
pub const CONTROLLER_STATE: TableDefinition<&str, &str> =
    TableDefinition::new("controller_state");

/// Lock leases keyed by lock path. Values are JSON-encoded `Lease`s.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
