use std::env;
use std::path::PathBuf;

// The LAPACK-backed solves in ndarray-linalg need an OpenBLAS to link
// against. Search the usual install locations and emit the link flags.
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    if let Some(lib_dir) = find_openblas(&target_os) {
        println!("cargo:rustc-link-search=native={}", lib_dir.display());
        if !is_system_path(&lib_dir) {
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", lib_dir.display());
        }
    } else {
        eprintln!("warning: OpenBLAS not found in common locations; relying on system defaults");
        eprintln!("         install libopenblas (apt: libopenblas-dev, brew: openblas)");
        eprintln!("         or point OPENBLAS_LIB at the directory holding libopenblas");
    }
    println!("cargo:rustc-link-lib=openblas");
}

fn find_openblas(target_os: &str) -> Option<PathBuf> {
    if let Ok(custom) = env::var("OPENBLAS_LIB") {
        let path = PathBuf::from(custom);
        if has_openblas(&path) {
            return Some(path);
        }
    }

    if let Ok(conda) = env::var("CONDA_PREFIX") {
        let path = PathBuf::from(conda).join("lib");
        if has_openblas(&path) {
            return Some(path);
        }
    }

    let candidates: &[&str] = match target_os {
        "macos" => &[
            "/opt/homebrew/opt/openblas/lib",
            "/usr/local/opt/openblas/lib",
            "/usr/local/lib",
        ],
        "linux" => &[
            "/usr/lib/x86_64-linux-gnu",
            "/usr/lib/aarch64-linux-gnu",
            "/usr/lib64",
            "/usr/lib",
            "/usr/local/lib",
        ],
        _ => &[],
    };

    candidates
        .iter()
        .map(|p| PathBuf::from(*p))
        .find(has_openblas)
}

fn has_openblas(dir: &PathBuf) -> bool {
    if !dir.is_dir() {
        return false;
    }
    let direct = ["libopenblas.so", "libopenblas.dylib", "libopenblas.a"]
        .iter()
        .any(|f| dir.join(f).exists());
    if direct {
        return true;
    }
    // versioned sonames (libopenblas.so.0 and friends)
    std::fs::read_dir(dir)
        .map(|entries| {
            entries.flatten().any(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.starts_with("libopenblas.so") || n.starts_with("libopenblas.dylib"))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn is_system_path(path: &PathBuf) -> bool {
    let path = path.to_string_lossy();
    ["/usr/lib", "/usr/lib64", "/usr/local/lib", "/lib", "/lib64"]
        .iter()
        .any(|p| path.starts_with(p))
}
