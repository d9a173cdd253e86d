//! Removes installed images when a product output is reused for a different
//! product/variant combination.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use super::config::Variant;

pub const PREVIOUS_BUILD_CONFIG: &str = "previous_build_config.mk";
const CONFIG_PREFIX: &str = "PREVIOUS_BUILD_CONFIG := ";

/// Paths under the product output that depend on the build configuration.
const INSTALL_CLEAN_PATHS: &[&str] = &[
    "data",
    "debug_ramdisk",
    "fake_packages",
    "obj/NOTICE_FILES",
    "obj/PACKAGING",
    "odm",
    "product",
    "ramdisk",
    "recovery",
    "root",
    "system",
    "system_ext",
    "system_other",
    "vendor",
    "vendor_ramdisk",
];

/// Compares the recorded configuration of `product` under `out_dir` with
/// the current one and cleans stale installs on a mismatch. The record is
/// always rewritten. Returns true when something was cleaned.
pub fn install_clean_if_necessary(
    out_dir: &Path,
    product: &str,
    variant: Variant,
    disabled: bool,
) -> Result<bool> {
    let product_out = out_dir.join("target/product").join(product);
    let marker = product_out.join(PREVIOUS_BUILD_CONFIG);
    let current = format!("{product}-{variant}");

    let previous = fs::read_to_string(&marker).ok().and_then(|text| {
        text.lines()
            .find_map(|line| line.strip_prefix(CONFIG_PREFIX))
            .map(|value| value.trim().to_string())
    });

    let mut cleaned = false;
    match previous {
        Some(previous) if previous != current && !disabled => {
            tracing::info!("{product}: configuration changed from {previous} to {current}; cleaning installed files");
            install_clean(&product_out)?;
            cleaned = true;
        }
        Some(previous) if previous != current => {
            tracing::info!("{product}: configuration changed but DISABLE_AUTO_INSTALLCLEAN is set");
        }
        _ => {}
    }

    fs::create_dir_all(&product_out)
        .with_context(|| format!("creating '{}'", product_out.display()))?;
    fs::write(&marker, format!("{CONFIG_PREFIX}{current}\n"))
        .with_context(|| format!("writing '{}'", marker.display()))?;
    Ok(cleaned)
}

fn install_clean(product_out: &Path) -> Result<()> {
    for rel in INSTALL_CLEAN_PATHS {
        let path = product_out.join(rel);
        if path.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("removing '{}'", path.display()))?;
        }
    }
    // Top-level images are configuration specific too.
    if let Ok(entries) = fs::read_dir(product_out) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "img") {
                fs::remove_file(&path)
                    .with_context(|| format!("removing '{}'", path.display()))?;
            }
        }
    }
    Ok(())
}
