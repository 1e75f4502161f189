mod common;

use common::{parse, FakeToolchain, COUNTER_APP};
use melker_bundler::cache::{BundleCache, CacheLookup, MissReason};
use melker_bundler::translate::FrameKind;
use melker_bundler::{process_melker_bundle, BundleError, BundleOptions};
use pretty_assertions::assert_eq;

fn cached_opts(dir: &tempfile::TempDir) -> BundleOptions {
    BundleOptions {
        use_cache: true,
        cache_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn bundles_counter_app() {
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    let toolchain = FakeToolchain::new("fake 1.0.0");

    let assembled = process_melker_bundle(&parsed, &BundleOptions::default(), &toolchain)
        .await
        .unwrap();

    assert_eq!(toolchain.calls(), 1);
    assert!(assembled.template.contains(r#"onClick="__melker.__h0(event)""#));
    assert!(assembled.template.contains(r#"onClick="__melker.__h1(event)""#));
    assert!(assembled.template.contains(r#"onChange="__melker.__h2(event)""#));
    assert!(assembled.bundled_code.contains("async function __h2(event) {"));
    assert!(assembled.source_map.is_some());
    assert!(assembled.artifacts.is_none());

    let metadata = assembled.metadata.as_ref().unwrap();
    assert_eq!(metadata.toolchain_version.as_deref(), Some("fake 1.0.0"));
    assert!(!metadata.from_cache);
    assert_eq!(metadata.modules, vec!["_inline_0.ts", "_ready_0.ts"]);
    assert!(metadata.generated_entry.is_none());
    assert!(metadata.diagnostics.is_empty(), "{:?}", metadata.diagnostics);
}

#[tokio::test]
async fn debug_mode_keeps_scratch_dir() {
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    let toolchain = FakeToolchain::new("fake 1.0.0");
    let opts = BundleOptions {
        debug: true,
        ..Default::default()
    };

    let assembled = process_melker_bundle(&parsed, &opts, &toolchain).await.unwrap();
    let metadata = assembled.metadata.unwrap();
    let out_dir = metadata.out_dir.unwrap();
    assert!(out_dir.join("_melker_entry.ts").exists());
    assert!(out_dir.join("_inline_0.ts").exists());
    assert_eq!(metadata.generated_entry.as_deref(), Some(toolchain.entries.lock().unwrap()[0].as_str()));
    std::fs::remove_dir_all(out_dir).unwrap();
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    let toolchain = FakeToolchain::new("fake 1.0.0");

    let first = process_melker_bundle(&parsed, &cached_opts(&dir), &toolchain).await.unwrap();
    let second = process_melker_bundle(&parsed, &cached_opts(&dir), &toolchain).await.unwrap();

    assert_eq!(toolchain.calls(), 1);
    assert!(second.metadata.as_ref().unwrap().from_cache);
    assert_eq!(first.bundled_code, second.bundled_code);
    assert_eq!(first.template, second.template);
    assert_eq!(first.line_map, second.line_map);
    assert_eq!(first.script_meta, second.script_meta);
    assert_eq!(first.source_map, second.source_map);
}

#[tokio::test]
async fn content_change_invalidates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let toolchain = FakeToolchain::new("fake 1.0.0");
    let original = parse("/apps/counter.melker", COUNTER_APP);
    process_melker_bundle(&original, &cached_opts(&dir), &toolchain).await.unwrap();

    let edited = parse("/apps/counter.melker", &COUNTER_APP.replace("bump(1)", "bump(2)"));
    let rebuilt = process_melker_bundle(&edited, &cached_opts(&dir), &toolchain).await.unwrap();

    assert_eq!(toolchain.calls(), 2);
    assert!(!rebuilt.metadata.unwrap().from_cache);
}

#[tokio::test]
async fn toolchain_upgrade_invalidates_cache() {
    let dir = tempfile::tempdir().unwrap();
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    process_melker_bundle(&parsed, &cached_opts(&dir), &FakeToolchain::new("fake 1.0.0"))
        .await
        .unwrap();

    let upgraded = FakeToolchain::new("fake 2.0.0");
    let rebuilt = process_melker_bundle(&parsed, &cached_opts(&dir), &upgraded).await.unwrap();
    assert_eq!(upgraded.calls(), 1);
    assert!(!rebuilt.metadata.unwrap().from_cache);

    // The entry now carries the new version.
    let cache = BundleCache::new(dir.path());
    let lookup = cache.lookup(&parsed.source_id, &parsed.content, "fake 1.0.0").await;
    assert!(matches!(
        lookup,
        CacheLookup::Miss(MissReason::ToolchainChanged { ref cached, .. }) if cached == "fake 2.0.0"
    ));
}

#[tokio::test]
async fn corrupt_cache_entry_falls_back_to_bundling() {
    let dir = tempfile::tempdir().unwrap();
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    let cache = BundleCache::new(dir.path());
    std::fs::write(cache.entry_path(&parsed.source_id, &parsed.content), "{ not json").unwrap();

    let toolchain = FakeToolchain::new("fake 1.0.0");
    let assembled = process_melker_bundle(&parsed, &cached_opts(&dir), &toolchain).await.unwrap();
    assert_eq!(toolchain.calls(), 1);
    assert!(!assembled.metadata.unwrap().from_cache);
    assert!(cache
        .lookup(&parsed.source_id, &parsed.content, "fake 1.0.0")
        .await
        .is_hit());
}

// ============================================================================
// Missing toolchain
// ============================================================================

#[tokio::test]
async fn imports_without_toolchain_fail_fast() {
    let content = "<melker>\n  <script>\n    import { format } from \"jsr:@std/fmt/colors\";\n  </script>\n</melker>\n";
    let parsed = parse("/apps/colors.melker", content);

    let err = process_melker_bundle(&parsed, &BundleOptions::default(), &FakeToolchain::absent())
        .await
        .unwrap_err();
    match &err {
        BundleError::ToolchainUnavailable { file, line, specifier, .. } => {
            assert_eq!(file, "/apps/colors.melker");
            assert_eq!(*line, 3);
            assert_eq!(specifier, "jsr:@std/fmt/colors");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.hint().is_some());
}

#[tokio::test]
async fn self_contained_app_runs_unbundled_without_toolchain() {
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    let assembled = process_melker_bundle(&parsed, &BundleOptions::default(), &FakeToolchain::absent())
        .await
        .unwrap();

    assert!(assembled.is_unbundled());
    assert!(assembled.source_map.is_none());
    assert!(assembled.bundled_code.contains("import * as __script_0 from \"./_inline_0.ts\";"));

    let dir = assembled.artifacts.as_ref().unwrap().path().to_path_buf();
    assert!(dir.join("_inline_0.ts").exists());
    assert!(dir.join("_ready_0.ts").exists());
    drop(assembled);
    assert!(!dir.exists());
}

#[tokio::test]
async fn unbundled_results_are_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    process_melker_bundle(&parsed, &cached_opts(&dir), &FakeToolchain::absent())
        .await
        .unwrap();
    assert_eq!(BundleCache::new(dir.path()).stats().await.unwrap().count, 0);
}

// ============================================================================
// Failures and translation
// ============================================================================

#[tokio::test]
async fn bundler_failure_carries_hint() {
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    let toolchain = FakeToolchain::failing("error: Module not found \"file:///apps/missing.ts\".");
    let err = process_melker_bundle(&parsed, &BundleOptions::default(), &toolchain)
        .await
        .unwrap_err();
    assert!(matches!(err, BundleError::BundleFailed { .. }));
    assert!(err.hint().unwrap().contains("import path"));
}

#[tokio::test]
async fn handler_error_translates_to_authored_line() {
    let parsed = parse("/apps/counter.melker", COUNTER_APP);
    let assembled = process_melker_bundle(&parsed, &BundleOptions::default(), &FakeToolchain::new("fake 1.0.0"))
        .await
        .unwrap();

    let (bundled_line, _) = assembled.line_map.find_by_source_id("__h1").unwrap();
    let translator = assembled.translator();
    let err = translator.translate(&format!(
        "TypeError: $app.bump is not a function\n    at __h1 (file:///tmp/melker-run/melker_bundle.js:{bundled_line}:5)"
    ));

    let frame = &err.frames[0];
    assert_eq!(frame.kind, FrameKind::Handler);
    assert_eq!(frame.line, 12);
    assert_eq!(frame.function_name, "event handler");
    assert!(frame.source_line.as_deref().unwrap().contains("onClick=\"$app.bump(-1)\""));
    assert_eq!(
        translator.handler_location("__h1").as_deref(),
        Some("defined at /apps/counter.melker:12")
    );
}
