use serde::{Deserialize, Serialize};

use crate::env;

/// Knobs shared by the selection passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Enables whole-graph layout optimization, including reordering outer
    /// constant operands of fused post-operations.
    pub optimize_layout: bool,
    /// Builds implementations on the parallel executor.
    pub parallel_build: bool,
    /// Worker threads for the build phase; 0 uses rayon's default.
    pub build_threads: usize,
    /// Allows vendor-pinned nodes without a legal layout to fall back to the
    /// generic kind.
    pub allow_vendor_demotion: bool,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            optimize_layout: true,
            parallel_build: true,
            build_threads: 0,
            allow_vendor_demotion: true,
        }
    }
}

impl CompileConfig {
    /// Defaults overridden by `TENSORSEL_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env::optimize_layout() {
            self.optimize_layout = value;
        }
        if let Some(value) = env::parallel_build() {
            self.parallel_build = value;
        }
        if let Some(value) = env::build_threads() {
            self.build_threads = value;
        }
        self
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_optimize_layout(mut self, enabled: bool) -> Self {
        self.optimize_layout = enabled;
        self
    }

    pub fn with_parallel_build(mut self, enabled: bool) -> Self {
        self.parallel_build = enabled;
        self
    }

    pub fn with_build_threads(mut self, threads: usize) -> Self {
        self.build_threads = threads;
        self
    }

    pub fn with_vendor_demotion(mut self, allowed: bool) -> Self {
        self.allow_vendor_demotion = allowed;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_json_fields_keep_defaults() {
        let config = CompileConfig::from_json_str(r#"{"build_threads": 2}"#).expect("parse");
        assert_eq!(config.build_threads, 2);
        assert!(config.optimize_layout);
        assert!(config.allow_vendor_demotion);
    }
}
