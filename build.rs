use std::fs;
use std::path::{Path, PathBuf};

// All output goes through tracing; direct printing bypasses the log filter.
const FORBIDDEN: [&str; 4] = ["println!(", "eprintln!(", "print!(", "dbg!("];

fn main() {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let src_dir = Path::new(&manifest_dir).join("src");
    println!("cargo:rerun-if-changed={}", src_dir.display());

    let mut files = Vec::new();
    collect_rs_files(&src_dir, &mut files);
    for path in files {
        let contents = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
        enforce_logging_guards(&contents, &path);
    }
}

fn collect_rs_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(&path, files);
        } else if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            files.push(path);
        }
    }
}

fn enforce_logging_guards(contents: &str, path: &Path) {
    for (n, line) in contents.lines().enumerate() {
        if line.trim_start().starts_with("//") {
            continue;
        }
        for token in FORBIDDEN {
            if line.contains(token) {
                panic!(
                    "Forbidden `{}` at {}:{}; log through tracing instead",
                    token,
                    path.display(),
                    n + 1
                );
            }
        }
    }
}
