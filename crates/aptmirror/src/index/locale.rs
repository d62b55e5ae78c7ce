//! Translation index (`i18n/Index`)

use tracing::debug;

const SHA1_SECTION: &str = "SHA1:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleEntry {
    pub size: u64,
    pub name: String,
}

/// Entries of a translation index. Lines that are not `sha1 size name` are
/// skipped. Only the size is kept; fetched translations are checked against it.
pub fn parse_locale_index(content: &str, source_name: &str) -> Vec<LocaleEntry> {
    let entries: Vec<_> = content
        .lines()
        .filter(|line| line.trim() != SHA1_SECTION)
        .filter_map(|line| {
            let fields: Vec<_> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_sha1, size, name] => Some(LocaleEntry {
                    size: size.parse().ok()?,
                    name: name.to_string(),
                }),
                _ => None,
            }
        })
        .collect();

    debug!(source = %source_name, entries = entries.len(), "Parsed translation index");
    entries
}

/// `…/i18n/Index` → `…/i18n`
pub fn locale_base(index_path: &str) -> &str {
    index_path.strip_suffix("/Index").unwrap_or(index_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locale_index() {
        let content = "SHA1:\n \
            da39a3ee5e6b4b0d3255bfef95601890afd80709   1234 Translation-en.bz2\n \
            DA39A3EE5E6B4B0D3255BFEF95601890AFD80709     56 Translation-de.bz2\n \
            garbage line\n";

        let entries = parse_locale_index(content, "main/i18n/Index");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "Translation-en.bz2");
        assert_eq!(entries[0].size, 1234);
        assert_eq!(entries[1].name, "Translation-de.bz2");
        assert_eq!(entries[1].size, 56);
    }

    #[test]
    fn test_locale_base() {
        assert_eq!(locale_base("ubuntu/dists/jammy/main/i18n/Index"), "ubuntu/dists/jammy/main/i18n");
    }
}
