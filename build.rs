use std::fs;
use std::path::{Path, PathBuf};

// Library modules must stay non-blocking and log through tracing.
const FORBIDDEN: [&str; 5] = [
    "std::net::TcpStream",
    "std::thread::sleep",
    "println!(",
    "eprintln!(",
    "dbg!(",
];

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let src_dir = Path::new(&manifest_dir).join("src");
    println!("cargo:rerun-if-changed={}", src_dir.display());

    let mut files = Vec::new();
    collect_rs_files(&src_dir, &mut files);
    for path in files {
        if path.file_name().and_then(|s| s.to_str()) == Some("main.rs") {
            continue;
        }
        let contents = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
        enforce_library_guards(&contents, &path);
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

fn enforce_library_guards(contents: &str, path: &Path) {
    for token in FORBIDDEN {
        if contents.contains(token) {
            panic!(
                "Forbidden token `{}` in library module: {}",
                token,
                path.display()
            );
        }
    }
}
