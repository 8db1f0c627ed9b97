use std::process::Command;

fn main() {
    // Allow packagers to pin the hash when building outside a checkout
    println!("cargo:rerun-if-env-changed=WREN_GIT_HASH");

    let hash = std::env::var("WREN_GIT_HASH")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(git_head)
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=WREN_GIT_HASH={hash}");
}

/// Commit hash of HEAD, if the crate is built from a git checkout
fn git_head() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    if let Ok(git_dir) = Command::new("git").args(["rev-parse", "--git-dir"]).output() {
        let dir = String::from_utf8_lossy(&git_dir.stdout).trim().to_string();
        if !dir.is_empty() {
            println!("cargo:rerun-if-changed={dir}/HEAD");
        }
    }

    let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!hash.is_empty()).then_some(hash)
}
