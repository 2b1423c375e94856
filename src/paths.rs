//! Output file naming.

use std::path::{Path, PathBuf};

use time::macros::format_description;
use time::OffsetDateTime;

/// Builds a unique dated report path in `dir` (or the working directory),
/// suffixing `a`..`z` on collision.
pub fn unique_report_path<P: AsRef<Path>>(dir: Option<P>) -> Option<PathBuf> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let date_format = format_description!("[year]_[month]_[day]_[hour][minute][second]");
    let formatted_date = now.format(&date_format).ok()?;

    let candidate = |name: &str| {
        dir.as_ref()
            .map(|d| d.as_ref().join(name))
            .unwrap_or_else(|| PathBuf::from(name))
    };

    let name = format!("wattprof_{}.json", formatted_date);
    let p = candidate(&name);
    if !p.exists() {
        return Some(p);
    }

    for c in 'a'..='z' {
        let name = format!("wattprof_{}_{}.json", formatted_date, c);
        let p = candidate(&name);
        if !p.exists() {
            return Some(p);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_shape() {
        let p = unique_report_path(None::<&Path>).unwrap();
        let name = p.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("wattprof_"));
        assert!(name.ends_with(".json"));
    }
}
