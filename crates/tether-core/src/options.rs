use std::str::FromStr;

use tracing::warn;

const MIB: usize = 1024 * 1024;

/// Limits and labels for one [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    pub max_message_num_bytes: usize,
    pub max_message_handles: usize,
    /// Capacity given to data pipes created without one.
    pub default_data_pipe_capacity_bytes: usize,
    pub max_data_pipe_capacity_bytes: usize,
    pub max_shared_buffer_num_bytes: u64,
    /// Shows up in logs and snapshots.
    pub node_name: String,
    /// Prefix of every peer token this runtime issues. Random when unset.
    pub node_id: Option<u64>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_message_num_bytes: 256 * MIB,
            max_message_handles: 64 * 1024,
            default_data_pipe_capacity_bytes: 64 * 1024,
            max_data_pipe_capacity_bytes: 256 * MIB,
            max_shared_buffer_num_bytes: 1024 * 1024 * 1024,
            node_name: "tether".to_owned(),
            node_id: None,
        }
    }
}

impl RuntimeOptions {
    /// Defaults, overridden by any `TETHER_*` variables set in the environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        override_from(&lookup, "TETHER_MAX_MESSAGE_BYTES", &mut self.max_message_num_bytes);
        override_from(&lookup, "TETHER_MAX_MESSAGE_HANDLES", &mut self.max_message_handles);
        override_from(
            &lookup,
            "TETHER_DEFAULT_DATA_PIPE_CAPACITY",
            &mut self.default_data_pipe_capacity_bytes,
        );
        override_from(
            &lookup,
            "TETHER_MAX_DATA_PIPE_CAPACITY",
            &mut self.max_data_pipe_capacity_bytes,
        );
        override_from(
            &lookup,
            "TETHER_MAX_SHARED_BUFFER_BYTES",
            &mut self.max_shared_buffer_num_bytes,
        );
        if let Some(name) = lookup("TETHER_NODE_NAME").filter(|name| !name.is_empty()) {
            self.node_name = name;
        }
        if let Some(id) = parse_var(&lookup, "TETHER_NODE_ID") {
            self.node_id = Some(id);
        }
        self
    }

    pub fn max_message_num_bytes(mut self, value: usize) -> Self {
        self.max_message_num_bytes = value;
        self
    }

    pub fn max_message_handles(mut self, value: usize) -> Self {
        self.max_message_handles = value;
        self
    }

    pub fn default_data_pipe_capacity_bytes(mut self, value: usize) -> Self {
        self.default_data_pipe_capacity_bytes = value;
        self
    }

    pub fn max_data_pipe_capacity_bytes(mut self, value: usize) -> Self {
        self.max_data_pipe_capacity_bytes = value;
        self
    }

    pub fn max_shared_buffer_num_bytes(mut self, value: u64) -> Self {
        self.max_shared_buffer_num_bytes = value;
        self
    }

    pub fn node_name(mut self, value: impl Into<String>) -> Self {
        self.node_name = value.into();
        self
    }

    pub fn node_id(mut self, value: u64) -> Self {
        self.node_id = Some(value);
        self
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(value) = parse_var(lookup, key) {
        *slot = value;
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable runtime option");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn env_overrides_known_keys() {
        let options = RuntimeOptions::default().with_env_overrides(env(&[
            ("TETHER_MAX_MESSAGE_BYTES", "1024"),
            ("TETHER_DEFAULT_DATA_PIPE_CAPACITY", " 4096 "),
            ("TETHER_NODE_NAME", "left"),
            ("TETHER_NODE_ID", "42"),
        ]));
        assert_eq!(options.max_message_num_bytes, 1024);
        assert_eq!(options.default_data_pipe_capacity_bytes, 4096);
        assert_eq!(options.node_name, "left");
        assert_eq!(options.node_id, Some(42));
        assert_eq!(options.max_message_handles, 64 * 1024);
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let options = RuntimeOptions::default().with_env_overrides(env(&[
            ("TETHER_MAX_MESSAGE_HANDLES", "lots"),
            ("TETHER_MAX_SHARED_BUFFER_BYTES", "-1"),
        ]));
        assert_eq!(options, RuntimeOptions::default());
    }

    #[test]
    fn builder_setters() {
        let options = RuntimeOptions::default()
            .max_message_num_bytes(16)
            .max_shared_buffer_num_bytes(32)
            .node_name("n");
        assert_eq!(options.max_message_num_bytes, 16);
        assert_eq!(options.max_shared_buffer_num_bytes, 32);
        assert_eq!(options.node_name, "n");
    }
}
