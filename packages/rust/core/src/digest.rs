//! Packing digest items into size-bounded messages.

/// Greedy first-fit packer for digest messages.
///
/// Every chunk starts with the header and holds one or more entries
/// (`bullet + item + separator`). Lengths are counted in characters. An item
/// that does not fit even in an empty chunk is kept whole in a chunk of its
/// own; nothing is truncated.
#[derive(Debug, Clone)]
pub struct DigestBuilder {
    max_chunk_chars: usize,
    bullet: String,
    separator: String,
}

impl DigestBuilder {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self {
            max_chunk_chars,
            bullet: "• ".into(),
            separator: "\n\n".into(),
        }
    }

    /// Override the entry decoration.
    pub fn with_entry_format(mut self, bullet: impl Into<String>, separator: impl Into<String>) -> Self {
        self.bullet = bullet.into();
        self.separator = separator.into();
        self
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    /// Split `items` into chunks, each seeded with `header`.
    ///
    /// Returns no chunks when `items` is empty.
    pub fn build<S: AsRef<str>>(&self, header: &str, items: &[S]) -> Vec<String> {
        let header_len = header.chars().count();
        let mut chunks = Vec::new();
        let mut current = String::from(header);
        let mut current_len = header_len;
        let mut entries = 0usize;

        for item in items {
            let entry = format!("{}{}{}", self.bullet, item.as_ref(), self.separator);
            let entry_len = entry.chars().count();

            if entries > 0 && current_len + entry_len > self.max_chunk_chars {
                chunks.push(std::mem::replace(&mut current, header.to_string()));
                current_len = header_len;
                entries = 0;
            }

            current.push_str(&entry);
            current_len += entry_len;
            entries += 1;
        }

        if entries > 0 {
            chunks.push(current);
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(max: usize) -> DigestBuilder {
        DigestBuilder::new(max).with_entry_format("", "")
    }

    #[test]
    fn empty_items_produce_no_chunks() {
        let items: Vec<String> = Vec::new();
        assert!(DigestBuilder::new(4000).build("Header\n\n", &items).is_empty());
    }

    #[test]
    fn item_filling_budget_exactly_fits() {
        let item = "a".repeat(47);
        let chunks = plain(50).build("H\n", &[item.clone()]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chars().count(), 49);

        let chunks = plain(50).build("H\n", &[item.clone(), item]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.starts_with("H\n")));
        assert!(chunks.iter().all(|c| c.chars().count() == 49));
    }

    #[test]
    fn default_entries_are_bulleted() {
        let chunks = DigestBuilder::new(4000).build("Jobs:\n\n", &["one", "two"]);
        assert_eq!(chunks, vec!["Jobs:\n\n• one\n\n• two\n\n".to_string()]);
    }

    #[test]
    fn every_chunk_respects_budget_and_order() {
        let items: Vec<String> = (0..40).map(|i| format!("post number {i} {}", "x".repeat(i % 17))).collect();
        let builder = DigestBuilder::new(120);
        let chunks = builder.build("Digest\n", &items);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 120, "chunk too long: {chunk:?}");
            assert!(chunk.starts_with("Digest\n"));
        }

        // Concatenating the bodies reproduces the items in order
        let body: String = chunks.iter().map(|c| &c["Digest\n".len()..]).collect();
        let expected: String = items.iter().map(|i| format!("• {i}\n\n")).collect();
        assert_eq!(body, expected);
    }

    #[test]
    fn oversized_item_gets_its_own_chunk() {
        let huge = "z".repeat(200);
        let chunks = plain(50).build("H\n", &["small", huge.as_str(), "after"]);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "H\nsmall");
        assert_eq!(chunks[1], format!("H\n{huge}"));
        assert_eq!(chunks[2], "H\nafter");
    }

    #[test]
    fn oversized_first_item_is_not_preceded_by_empty_chunk() {
        let huge = "z".repeat(80);
        let chunks = plain(50).build("H\n", &[huge.as_str()]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chars().count(), 82);
    }

    #[test]
    fn budget_counts_characters_not_bytes() {
        // 10 four-byte characters: 40 bytes but 10 chars
        let item = "🚀".repeat(10);
        let chunks = plain(12).build("H\n", &[item.as_str(), item.as_str()]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 12);
    }
}
