use dirs::data_dir;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};

static DATA_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    let base = data_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    base.join("event-scout")
});

pub fn data_root() -> PathBuf {
    DATA_ROOT.clone()
}

pub fn config_path() -> PathBuf {
    data_root().join("config.json")
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Cuts `text` to at most `max` characters, appending an ellipsis when shortened.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("café society", 5), "café…");
        assert_eq!(truncate_chars("café society", 5).chars().count(), 5);
    }

    #[test]
    fn config_lives_under_data_root() {
        assert!(config_path().starts_with(data_root()));
        assert!(config_path().ends_with("event-scout/config.json"));
    }
}
