// Shared fixtures for the integration tests
#![allow(dead_code)]

use packtrace::config::TraceConfig;
use packtrace::sim::{SimImage, SimRuntime};

/// Runtime image shared by the integration tests
pub const IMAGE: &str = include_str!("../fixtures/image.toml");

pub fn image() -> SimImage {
    SimImage::from_toml_str(IMAGE).expect("fixture image parses")
}

/// Fresh runtime started from the fixture image
pub fn runtime() -> SimRuntime {
    SimRuntime::new(image())
}

/// Default configuration without support code, so manifests only reflect the workload
pub fn quiet_config() -> TraceConfig {
    TraceConfig {
        support_code: Vec::new(),
        ..TraceConfig::default()
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
