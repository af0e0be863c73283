use serde::{Deserialize, Serialize};

/// Execution limits applied to every call made through an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of nested wasm activations.
    pub max_call_depth: usize,
    /// Maximum operand-stack height, in 64-bit words.
    pub max_stack_words: usize,
    /// Maximum number of host functions re-entering wasm at once.
    pub max_host_depth: usize,
}

impl Default for Config {
    fn default() -> Self { Self { max_call_depth: 1000, max_stack_words: 1 << 20, max_host_depth: 32 } }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> { serde_json::from_str(text) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let c = Config::from_json(r#"{ "max_call_depth": 64 }"#).unwrap();
        assert_eq!(c, Config { max_call_depth: 64, ..Config::default() });
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
        assert_eq!(Config::from_json(r#"{ "max_host_depth": 4 }"#).unwrap().max_host_depth, 4);
        assert!(Config::from_json(r#"{ "max_call_depth": -1 }"#).is_err());
    }
}
