// build.rs
// Compiles GLSL stages in resources/shaders to target/shaders/<name>.<stage>.spv

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const STAGE_EXTENSIONS: [&str; 2] = ["vert", "frag"];

fn glslc_path() -> Option<PathBuf> {
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    let sdk = env::var("VULKAN_SDK").ok()?;
    let glslc = if cfg!(target_os = "windows") {
        PathBuf::from(sdk).join("Bin").join("glslc.exe")
    } else {
        PathBuf::from(sdk).join("bin").join("glslc")
    };
    glslc.exists().then_some(glslc)
}

fn is_stale(source: &Path, output: &Path) -> bool {
    match (std::fs::metadata(source).and_then(|m| m.modified()), std::fs::metadata(output).and_then(|m| m.modified())) {
        (Ok(src), Ok(dst)) => src > dst,
        _ => true,
    }
}

fn main() {
    println!("cargo:rerun-if-changed=../../resources/shaders");

    if env::var("SKIP_SHADERS").is_ok() {
        eprintln!("info: Skipping shader compilation (SKIP_SHADERS set)");
        return;
    }

    let Some(glslc) = glslc_path() else {
        eprintln!("warning: glslc not found (set VULKAN_SDK), shader compilation skipped");
        return;
    };

    let shader_dir = PathBuf::from("../../resources/shaders");
    let target_dir = PathBuf::from("../../target/shaders");
    if let Err(e) = std::fs::create_dir_all(&target_dir) {
        eprintln!("warning: Failed to create {}: {}", target_dir.display(), e);
        return;
    }

    let entries = match std::fs::read_dir(&shader_dir) {
        Ok(entries) => entries,
        Err(_) => {
            eprintln!("info: No shader directory found at {}", shader_dir.display());
            return;
        }
    };

    let mut compiled = 0;
    for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
        let is_stage = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| STAGE_EXTENSIONS.contains(&ext));
        let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if !is_stage {
            continue;
        }

        // Builtin.ObjectShader.vert -> Builtin.ObjectShader.vert.spv
        let output = target_dir.join(format!("{file_name}.spv"));
        if !is_stale(&path, &output) {
            continue;
        }

        let status = Command::new(&glslc).arg(&path).arg("-o").arg(&output).status();
        match status {
            Ok(s) if s.success() => {
                eprintln!("info: Compiled {} -> {}", file_name, output.display());
                compiled += 1;
            }
            Ok(s) => panic!("glslc failed for {} with exit code {}", path.display(), s.code().unwrap_or(-1)),
            Err(e) => panic!("Failed to run glslc for {}: {}", path.display(), e),
        }
    }

    eprintln!("info: {} shader(s) compiled", compiled);
}
