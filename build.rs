use std::process::Command;

/// Trimmed stdout of a git command, if git ran and printed something
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let stamps = [
        (
            "GIT_HASH",
            git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string()),
        ),
        (
            "GIT_TAG",
            git(&["describe", "--tags", "--abbrev=0"])
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        ),
        ("BUILD_TIME", chrono::Utc::now().to_rfc3339()),
    ];

    for (name, value) in stamps {
        println!("cargo:rustc-env={}={}", name, value);
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
