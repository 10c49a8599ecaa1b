//! Key layout for the per-switch queue. Other processes read and write these
//! exact strings, so changing them breaks mixed-version deployments.

/// Prefix under which a switch's pending batches live: `<switch>/input/`
pub fn input_prefix(switch: &str) -> String {
    format!("{}/input/", switch)
}

/// The pending-batch key for a given batch id
pub fn input_key(switch: &str, uuid: &str) -> String {
    format!("{}{}", input_prefix(switch), uuid)
}

/// Prefix under which a switch's finished batches live: `<switch>/output/`
pub fn output_prefix(switch: &str) -> String {
    format!("{}/output/", switch)
}

/// The result key for a given batch id
pub fn output_key(switch: &str, uuid: &str) -> String {
    format!("{}{}", output_prefix(switch), uuid)
}

/// Base name of a switch's execution lock pool: `<switch>/execute_lock`
pub fn execute_lock_prefix(switch: &str) -> String {
    format!("{}/execute_lock", switch)
}

/// One slot of a lock pool: `<prefix><index>`
pub fn lock_slot_key(prefix: &str, index: u32) -> String {
    format!("{}{}", prefix, index)
}

