use std::path::PathBuf;

/// Expands a leading `~` against `$HOME`; other paths pass through untouched.
pub fn expand_home_path(path: &str) -> PathBuf {
    let home = || std::env::var("HOME").ok().map(PathBuf::from);
    if path == "~" {
        if let Some(home) = home() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
