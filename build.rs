use std::process::Command;

fn main() {
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", build_timestamp());
    println!("cargo:rustc-env=BUILD_GIT_SHA={}", git_sha());

    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Short commit hash with a `-dirty` suffix for uncommitted changes.
fn git_sha() -> String {
    let Some(sha) = run("git", &["rev-parse", "--short", "HEAD"]) else {
        return "unknown".into();
    };
    let dirty = run("git", &["status", "--porcelain", "--untracked-files=no"]).is_some();
    if dirty {
        format!("{sha}-dirty")
    } else {
        sha
    }
}

/// UTC ISO-8601. Honors `SOURCE_DATE_EPOCH` for reproducible builds.
fn build_timestamp() -> String {
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        if let Some(ts) = run("date", &["-u", "-d", &format!("@{epoch}"), "+%Y-%m-%dT%H:%M:%SZ"]) {
            return ts;
        }
    }
    run("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .or_else(|| {
            run(
                "powershell",
                &[
                    "-Command",
                    "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
                ],
            )
        })
        .unwrap_or_else(|| "unknown".into())
}
