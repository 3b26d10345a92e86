//! End-to-end tests for traced workload sessions: preload, partial
//! manifests, registry snapshots and the serialized manifest shape

mod utils;

use packtrace::analysis::{dynamic_libs, fresh_modules, imported_paths, DynamicLib};
use packtrace::dynlib::DynlibCall;
use packtrace::manifest::MANIFEST_FORMAT;
use packtrace::sim::SimRuntime;
use packtrace::{trace_workload, GuestError, Manifest, TraceError};
use utils::{image, quiet_config, runtime, strings};

const E2E_WORKLOAD: &str = "open /lib/foo.so r
dlopen /lib/foo.so global
call /lib/foo.so bar
call /lib/foo.so bar";

#[test]
fn test_end_to_end_manifest() {
    let mut rt = runtime();
    let outcome = trace_workload(&mut rt, &quiet_config(), E2E_WORKLOAD).unwrap();
    let manifest = outcome.manifest;

    assert_eq!(manifest.opened_files.unwrap(), strings(&["/lib/foo.so"]));
    assert_eq!(
        manifest.dyn_lib_calls.unwrap(),
        vec![DynlibCall {
            path: "/lib/foo.so".to_string(),
            global: true,
        }]
    );
    assert_eq!(
        manifest.symbol_access.unwrap()["/lib/foo.so"],
        strings(&["bar"])
    );
    assert_eq!(manifest.loaded_libs_by_handle.unwrap()[&1], "/lib/foo.so");
    assert!(manifest.lock.is_none());
    assert!(manifest.loaded_packages.is_empty());
    assert!(!outcome.used_installer_fallback);
    assert!(outcome.workload_error.is_none());
}

#[test]
fn test_manifest_json_shape() {
    let mut rt = runtime();
    let outcome = trace_workload(&mut rt, &quiet_config(), E2E_WORKLOAD).unwrap();
    let json: serde_json::Value = serde_json::from_str(&outcome.manifest.to_json().unwrap()).unwrap();

    assert_eq!(json["meta"]["format"], MANIFEST_FORMAT);
    assert_eq!(json["meta"]["workloadSha256"].as_str().unwrap().len(), 64);
    assert!(json["meta"].get("workloadError").is_none());
    assert_eq!(json["openedFiles"], serde_json::json!(["/lib/foo.so"]));
    assert_eq!(
        json["dynLibCalls"],
        serde_json::json!([{ "path": "/lib/foo.so", "global": true }])
    );
    assert_eq!(json["symbolAccess"], serde_json::json!({ "/lib/foo.so": ["bar"] }));
    assert_eq!(json["loadedLibsByHandle"], serde_json::json!({ "1": "/lib/foo.so" }));
    assert_eq!(json["moduleRegistry"]["sys"], serde_json::Value::Null);
    assert_eq!(json["stdlibPrefix"], "/lib/python311.zip");
    assert!(json.get("lock").is_none());
    assert!(json.get("moduleRegistryBefore").is_none());

    let parsed = Manifest::from_json(&outcome.manifest.to_json().unwrap()).unwrap();
    assert_eq!(parsed, outcome.manifest);
}

#[test]
fn test_same_workload_same_manifest() {
    let first = trace_workload(&mut runtime(), &quiet_config(), E2E_WORKLOAD).unwrap();
    let second = trace_workload(&mut runtime(), &quiet_config(), E2E_WORKLOAD).unwrap();
    assert_eq!(
        first.manifest.to_json().unwrap(),
        second.manifest.to_json().unwrap()
    );
}

#[test]
fn test_failing_workload_yields_partial_manifest() {
    let mut rt = runtime();
    let outcome = trace_workload(
        &mut rt,
        &packtrace::config::TraceConfig::default(),
        "open /home/pyodide/data.csv r\nfail ValueError: boom\nopen /lib/foo.so r",
    )
    .unwrap();

    assert_eq!(
        outcome.workload_error,
        Some(GuestError::Guest("ValueError: boom".to_string()))
    );
    let manifest = outcome.manifest;
    assert!(manifest.is_partial());
    assert_eq!(manifest.meta.workload_error.as_deref(), Some("ValueError: boom"));
    assert_eq!(manifest.opened_files.unwrap(), strings(&["/home/pyodide/data.csv"]));
    // Support code is skipped after a failure
    assert!(!manifest.module_registry.unwrap().contains("pyodide.http"));
}

#[test]
fn test_arithmetic_overflow_yields_partial_manifest() {
    let mut rt = runtime();
    let outcome = trace_workload(
        &mut rt,
        &quiet_config(),
        "dlopen /lib/foo.so local\ncall /lib/foo.so bar 9223372036854775807 1",
    )
    .unwrap();

    assert!(matches!(
        outcome.workload_error,
        Some(GuestError::Guest(ref message)) if message.starts_with("OverflowError")
    ));
    let manifest = outcome.manifest;
    assert!(manifest.is_partial());
    assert_eq!(manifest.dyn_lib_calls.unwrap().len(), 1);
    // The call was made, so the symbol counts as used
    assert_eq!(manifest.symbol_access.unwrap()["/lib/foo.so"], strings(&["bar"]));
}

#[test]
fn test_syntax_error_runs_nothing() {
    let mut rt = runtime();
    let outcome = trace_workload(
        &mut rt,
        &quiet_config(),
        "open /home/pyodide/data.csv r\nexplode",
    )
    .unwrap();

    assert!(outcome.manifest.is_partial());
    assert!(outcome.manifest.opened_files.unwrap().is_empty());
}

#[test]
fn test_support_code_runs_after_workload() {
    let mut rt = runtime();
    let outcome = trace_workload(
        &mut rt,
        &packtrace::config::TraceConfig::default(),
        "print hi",
    )
    .unwrap();

    let manifest = outcome.manifest;
    assert!(manifest.module_registry.unwrap().contains("pyodide.http"));
    assert_eq!(
        manifest.opened_files.unwrap(),
        strings(&["/lib/python3.11/site-packages/pyodide/http.py"])
    );
    assert_eq!(rt.output(), ["hi"]);
}

// ============================================================================
// Preload
// ============================================================================

#[test]
fn test_bulk_preload_has_no_lock() {
    let mut config = quiet_config();
    config.requires = strings(&["numpy"]);

    let outcome = trace_workload(&mut runtime(), &config, "import numpy").unwrap();
    assert!(!outcome.used_installer_fallback);

    let manifest = outcome.manifest;
    assert_eq!(manifest.loaded_packages["numpy"], "default channel");
    assert!(manifest.lock.is_none());
    assert_eq!(manifest.dyn_lib_calls.unwrap().len(), 2);
}

#[test]
fn test_preload_falls_back_to_installer() {
    let mut config = quiet_config();
    config.requires = strings(&["numpy", "snowballstemmer"]);

    let outcome = trace_workload(&mut runtime(), &config, "import snowballstemmer").unwrap();
    assert!(outcome.used_installer_fallback);
    assert!(outcome.workload_error.is_none());

    let manifest = outcome.manifest;
    assert_eq!(manifest.loaded_packages["micropip"], "default channel");
    assert_eq!(manifest.loaded_packages["numpy"], "pypi");
    assert_eq!(manifest.loaded_packages["snowballstemmer"], "pypi");

    let lock = manifest.lock.unwrap();
    assert_eq!(lock["packages"]["snowballstemmer"]["version"], "2.2.0");
    assert_eq!(lock["packages"]["numpy"]["source"], "pypi");
}

#[test]
fn test_failed_fallback_aborts_trace() {
    let mut config = quiet_config();
    config.requires = strings(&["not-a-package"]);

    let err = trace_workload(&mut runtime(), &config, "print unreachable").unwrap_err();
    assert!(matches!(
        err,
        TraceError::Preload(GuestError::PackageUnavailable(ref name)) if name == "not-a-package"
    ));
}

#[test]
fn test_missing_installer_aborts_trace() {
    let mut config = quiet_config();
    config.requires = strings(&["snowballstemmer"]);
    config.installer = "pip".to_string();

    let err = trace_workload(&mut runtime(), &config, "").unwrap_err();
    assert!(matches!(err, TraceError::Preload(_)));
}

#[test]
fn test_invalid_config_rejected_before_running() {
    let mut config = quiet_config();
    config.installer = String::new();

    let mut rt = runtime();
    let err = trace_workload(&mut rt, &config, "print hi").unwrap_err();
    assert!(matches!(err, TraceError::Config(_)));
    assert!(rt.output().is_empty());
}

// ============================================================================
// Registry snapshots and analysis
// ============================================================================

#[test]
fn test_snapshot_before_shows_fresh_modules() {
    let mut config = quiet_config();
    config.requires = strings(&["numpy"]);
    config.snapshot_before = true;

    let manifest = trace_workload(&mut runtime(), &config, "import numpy")
        .unwrap()
        .manifest;
    let before = manifest.module_registry_before.as_ref().unwrap();
    let after = manifest.module_registry.as_ref().unwrap();

    assert!(before.contains("sys"));
    assert!(!before.contains("numpy"));
    assert_eq!(fresh_modules(before, after), strings(&["json", "numpy"]));
}

#[test]
fn test_imported_paths_under_site_packages() {
    let mut config = quiet_config();
    config.requires = strings(&["numpy"]);

    let manifest = trace_workload(&mut runtime(), &config, "import numpy")
        .unwrap()
        .manifest;
    assert_eq!(
        imported_paths(&manifest, Some("/lib/python3.11/site-packages")),
        strings(&["numpy/__init__.py"])
    );
}

#[test]
fn test_dynamic_libs_keep_global_and_used() {
    let mut config = quiet_config();
    config.requires = strings(&["numpy"]);

    let manifest = trace_workload(
        &mut runtime(),
        &config,
        "import numpy\ndlopen /lib/foo.so local\ncall /lib/foo.so baz",
    )
    .unwrap()
    .manifest;

    assert_eq!(
        dynamic_libs(&manifest),
        vec![
            DynamicLib {
                path: "/usr/lib/libopenblas.so".to_string(),
                load_order: 0,
                shared: true,
            },
            DynamicLib {
                path: "/lib/foo.so".to_string(),
                load_order: 2,
                shared: false,
            },
        ]
    );
}

#[test]
fn test_stdlib_prefix_derived_from_registry() {
    let mut image = image();
    image.stdlib_prefix = None;
    let mut rt = SimRuntime::new(image);

    let manifest = trace_workload(&mut rt, &quiet_config(), "").unwrap().manifest;
    assert_eq!(manifest.stdlib_prefix.as_deref(), Some("/lib/python311.zip"));
}

#[test]
fn test_no_stdlib_prefix_without_registry() {
    let mut image = image();
    image.stdlib_prefix = None;
    let mut rt = SimRuntime::new(image).without_module_registry();

    let manifest = trace_workload(&mut rt, &quiet_config(), "").unwrap().manifest;
    assert!(manifest.stdlib_prefix.is_none());
    assert!(manifest.module_registry.is_none());
}
