use anyhow::Result;
use expf::manifest::{ManifestOptions, ManifestPatcher, SetupOutcome};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

// Deliberately not in serde_json's pretty format, so a rewrite would show.
const ORIGINAL: &str = "{\"name\":\"bench\",  \"dependencies\": {\"express\": \"5.1.0\"},\n\"overrides\": {\"debug\": \"4\"}}";

fn overrides(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_setup_then_cleanup_restores_exact_bytes() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json"), ORIGINAL)?;
    let patcher = ManifestPatcher::new(dir.path());

    let outcome = patcher
        .setup(&ManifestOptions {
            overrides: overrides(&[("qs", "6.13.0")]),
            uws: true,
        })
        .await?;
    assert_eq!(outcome, SetupOutcome::Patched);
    assert_eq!(std::fs::read_to_string(patcher.backup_path())?, ORIGINAL);

    let patched = read_json(&patcher.manifest_path());
    assert_eq!(patched["overrides"], json!({"debug": "4", "qs": "6.13.0"}));
    assert_eq!(patched["dependencies"]["uwebsockets-express"], "2.0.0");
    assert_eq!(
        patched["dependencies"]["uWebSockets.js"],
        "uNetworking/uWebSockets.js#v20.51.0"
    );

    // Artifacts of an install against the patched manifest.
    std::fs::write(dir.path().join("package-lock.json"), "{}")?;
    std::fs::create_dir_all(dir.path().join("node_modules").join("express"))?;

    assert!(patcher.cleanup().await?);
    assert_eq!(std::fs::read_to_string(patcher.manifest_path())?, ORIGINAL);
    assert!(!patcher.backup_path().exists());
    assert!(!dir.path().join("package-lock.json").exists());
    assert!(!dir.path().join("node_modules").exists());
    Ok(())
}

#[tokio::test]
async fn test_repeated_setup_patches_the_original() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json"), ORIGINAL)?;
    let patcher = ManifestPatcher::new(dir.path());

    patcher
        .setup(&ManifestOptions {
            overrides: overrides(&[("qs", "6.13.0")]),
            uws: false,
        })
        .await?;
    patcher
        .setup(&ManifestOptions {
            overrides: overrides(&[("body-parser", "2.2.0")]),
            uws: false,
        })
        .await?;

    assert_eq!(std::fs::read_to_string(patcher.backup_path())?, ORIGINAL);
    let patched = read_json(&patcher.manifest_path());
    assert_eq!(patched["overrides"], json!({"debug": "4", "body-parser": "2.2.0"}));

    patcher.cleanup().await?;
    assert_eq!(std::fs::read_to_string(patcher.manifest_path())?, ORIGINAL);
    Ok(())
}

#[tokio::test]
async fn test_leftover_backup_is_restored_without_mutation() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json.bak"), ORIGINAL)?;
    std::fs::write(dir.path().join("package.json"), "{\"name\": \"half-patched\"}")?;
    let patcher = ManifestPatcher::new(dir.path());

    let outcome = patcher.setup(&ManifestOptions::default()).await?;
    assert_eq!(outcome, SetupOutcome::Untouched);
    assert_eq!(std::fs::read_to_string(patcher.manifest_path())?, ORIGINAL);
    assert!(!patcher.backup_path().exists());
    Ok(())
}

#[tokio::test]
async fn test_cleanup_without_backup_keeps_install() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json"), ORIGINAL)?;
    std::fs::write(dir.path().join("package-lock.json"), "{}")?;
    let patcher = ManifestPatcher::new(dir.path());

    patcher.setup(&ManifestOptions::default()).await?;
    assert!(!patcher.cleanup().await?);
    assert!(dir.path().join("package-lock.json").exists());
    assert_eq!(std::fs::read_to_string(patcher.manifest_path())?, ORIGINAL);
    Ok(())
}

#[tokio::test]
async fn test_invalid_manifest_is_left_alone() -> Result<()> {
    let dir = TempDir::new()?;
    std::fs::write(dir.path().join("package.json"), "not json")?;
    let patcher = ManifestPatcher::new(dir.path());

    let err = patcher
        .setup(&ManifestOptions {
            overrides: Map::new(),
            uws: true,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MANIFEST");
    assert_eq!(std::fs::read_to_string(patcher.manifest_path())?, "not json");
    assert!(!patcher.backup_path().exists());
    Ok(())
}
