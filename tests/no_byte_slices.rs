use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

// Fails if source files contain literal-range slices like `text[..50]` or
// `line[3..]`, which panic on UTF-8 boundaries when applied to service output
// or probe diagnostics. Only numeric literal bounds are flagged; `&buf[..n]`
// with a variable end is fine.

fn visit_rs_files(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir failed: {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            visit_rs_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
    Ok(())
}

/// True if `line` contains `[..N]` or `[N..]` with a numeric literal `N`.
fn has_literal_range(line: &str) -> bool {
    line.split('[').skip(1).any(|rest| {
        let Some(end) = rest.find(']') else {
            return false;
        };
        let inner: String = rest[..end].chars().filter(|c| !c.is_whitespace()).collect();
        let bound = inner
            .strip_prefix("..")
            .or_else(|| inner.strip_suffix(".."));
        matches!(bound, Some(b) if !b.is_empty() && b.chars().all(|c| c.is_ascii_digit()))
    })
}

#[test]
fn detector_matches_literal_ranges_only() {
    assert!(has_literal_range("let s = &text[..50];"));
    assert!(has_literal_range("let s = &text[ 3 .. ];"));
    assert!(!has_literal_range("let s = &buf[..n];"));
    assert!(!has_literal_range("let s = &buf[start..end];"));
    assert!(!has_literal_range("let v = vec![0u8; 512];"));
}

#[test]
fn no_literal_byte_index_string_slices() -> anyhow::Result<()> {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files: Vec<PathBuf> = Vec::new();
    visit_rs_files(&repo_root.join("src"), &mut files)?;

    let mut failures: Vec<String> = Vec::new();
    for path in files {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for (i, line) in text.lines().enumerate() {
            if has_literal_range(line) {
                failures.push(format!("{}:{}: {}", path.display(), i + 1, line.trim()));
            }
        }
    }

    if !failures.is_empty() {
        anyhow::bail!(
            "Found unsafe literal-range slices in source files:\n{}",
            failures.join("\n")
        );
    }

    Ok(())
}
