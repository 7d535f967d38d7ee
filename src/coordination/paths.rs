//! Store layout used by controllers

/// Root of everything controllers read and write
pub const ROOT_PATH: &str = "/controller";

/// Serialized controller state used for crash recovery
pub const STATE_PATH: &str = "/controller/state";

/// Ephemeral node held by whoever owns the controller lock
pub const LOCK_PATH: &str = "/controller/lock";

/// Parent of the per-node subtrees
pub const NODES_PATH: &str = "/controller/nodes";

/// Membership list with its last-update timestamp
pub const IPS_PATH: &str = "/controller/ips";

/// Per-application scaling requests, one child per requesting node
pub const SCALE_PATH: &str = "/controller/scale";

/// Value of nodes whose contents nobody reads
pub const DUMMY_DATA: &[u8] = b"";

pub fn node_path(ip: &str) -> String {
    format!("{}/{}", NODES_PATH, ip)
}

pub fn live_path(ip: &str) -> String {
    format!("{}/{}/live", NODES_PATH, ip)
}

pub fn done_loading_path(ip: &str) -> String {
    format!("{}/{}/done_loading", NODES_PATH, ip)
}

pub fn job_data_path(ip: &str) -> String {
    format!("{}/{}/job_data", NODES_PATH, ip)
}

pub fn app_instance_path(ip: &str) -> String {
    format!("{}/{}/app_instance", NODES_PATH, ip)
}

pub fn scale_app_path(app_name: &str) -> String {
    format!("{}/{}", SCALE_PATH, app_name)
}

pub fn scale_request_path(app_name: &str, ip: &str) -> String {
    format!("{}/{}/{}", SCALE_PATH, app_name, ip)
}
