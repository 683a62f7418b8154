//! Well-known filesystem locations.

/// The daemon's published object socket.
pub const RBMCD_SOCKET: &str = "/run/rbmcd/rbmcd.sock";

/// The peer BMC's object aggregate, as exposed locally by the transport.
pub const SIBLING_SOCKET: &str = "/run/rbmcd/sibling.sock";

/// The data-sync daemon's control socket.
pub const SYNC_SOCKET: &str = "/run/rbmcd/sync.sock";

/// The host state object.
pub const HOST_STATE_SOCKET: &str = "/run/rbmcd/host-state.sock";

/// The local BMC state daemon's object.
pub const BMC_STATE_SOCKET: &str = "/run/rbmcd/bmc-state.sock";

/// The persistent JSON document.
pub const DATA_FILE: &str = "/var/lib/rbmcd/data.json";
