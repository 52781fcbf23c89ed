use std::path::{Path, PathBuf};

/// Managed toolchain root: `~/.carapace/`
///
/// Everything the installer touches lives under this directory, so the
/// whole toolchain can be removed by deleting it.
pub fn carapace_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".carapace")
}

/// Path to the uv package manager binary: `<home>/uv/bin/uv`
pub fn uv_binary_path(home: &Path) -> PathBuf {
    home.join("uv").join("bin").join("uv")
}

/// Path to the managed sky CLI binary: `<home>/tools/bin/sky`
pub fn sky_binary_path(home: &Path) -> PathBuf {
    home.join("tools").join("bin").join("sky")
}

/// Directory uv installs tool entry points into.
pub fn uv_tool_bin_dir(home: &Path) -> PathBuf {
    home.join("tools").join("bin")
}

/// Directory uv installs tool environments into.
pub fn uv_tool_dir(home: &Path) -> PathBuf {
    home.join("tools").join("environments")
}

/// Directory uv installs managed Python interpreters into.
pub fn uv_python_dir(home: &Path) -> PathBuf {
    home.join("python")
}

/// Environment overrides that redirect every uv write under the managed root.
pub fn uv_env(home: &Path) -> Vec<(&'static str, PathBuf)> {
    vec![
        ("UV_TOOL_BIN_DIR", uv_tool_bin_dir(home)),
        ("UV_TOOL_DIR", uv_tool_dir(home)),
        ("UV_PYTHON_INSTALL_DIR", uv_python_dir(home)),
    ]
}
