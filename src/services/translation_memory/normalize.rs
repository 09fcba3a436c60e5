/// Collapses whitespace runs and trims, so cosmetic reformatting of a source
/// string keys to the same cache record.
pub fn normalize(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '\u{feff}')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
