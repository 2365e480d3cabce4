use roxmltree::{Document, Node, ParsingOptions};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::hash::{TextDigest, md5_hex};
use crate::core::models::{ContentFingerprint, SectionTree};
use crate::core::title::{normalize_title, prepare_text};

const ROOT: &str = "FictionBook";
const BODY: &str = "body";
const SECTION: &str = "section";
const SUBTITLE: &str = "title";
const TITLE_PATH: [&str; 4] = [ROOT, "description", "title-info", "book-title"];

#[derive(Debug, Error)]
pub enum TextError {
    #[error("Markup is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Malformed markup: {0}")]
    Parse(#[from] roxmltree::Error),

    #[error("Unexpected root element <{name}>")]
    UnexpectedRoot { name: String },
}

/// Builds content fingerprints from FictionBook markup
#[derive(Debug, Clone)]
pub struct TextFingerprinter {
    /// Body words count only when longer than this
    min_word_length: usize,
    top_words: usize,
}

struct OpenSection {
    index: usize,
    histogram: HashMap<String, usize>,
}

struct Walk<'a> {
    fingerprinter: &'a TextFingerprinter,
    digest: TextDigest,
    title: String,
    tree: SectionTree,
    open: Vec<OpenSection>,
    root_words: Vec<(usize, String)>,
}

impl TextFingerprinter {
    pub fn new(min_word_length: usize, top_words: usize) -> Self {
        Self {
            min_word_length,
            top_words,
        }
    }

    pub fn fingerprint(&self, body: &[u8]) -> Result<ContentFingerprint, TextError> {
        let text = std::str::from_utf8(body)?;
        let text = text.trim_start_matches('\u{feff}');

        let options = ParsingOptions {
            allow_dtd: true,
            ..ParsingOptions::default()
        };
        let document = Document::parse_with_options(text, options)?;

        let root = document.root_element();
        if root.tag_name().name() != ROOT {
            return Err(TextError::UnexpectedRoot {
                name: root.tag_name().name().to_string(),
            });
        }

        let mut walk = Walk {
            fingerprinter: self,
            digest: TextDigest::new(),
            title: String::new(),
            tree: SectionTree::new(),
            open: vec![OpenSection {
                index: SectionTree::ROOT,
                histogram: HashMap::new(),
            }],
            root_words: Vec::new(),
        };

        let mut path = Vec::new();
        walk.visit(root, &mut path);
        walk.close_section();

        let title = walk.title.trim().to_string();
        let root_section_hash = walk
            .tree
            .root()
            .map(|node| node.hash.clone())
            .unwrap_or_default();

        Ok(ContentFingerprint {
            content_hash: walk.digest.finalize_hex(),
            title_tokens: normalize_title(&title),
            title,
            root_section_hash,
            sections: walk.tree,
            top_words: walk.root_words,
        })
    }

    /// Top words of a histogram: count first, then longer words, then the word itself
    fn rank(&self, histogram: HashMap<String, usize>) -> Vec<(usize, String)> {
        let mut counter: Vec<(usize, String)> = histogram
            .into_iter()
            .map(|(word, count)| (count, word))
            .collect();
        counter.sort_by(|(lc, lw), (rc, rw)| {
            let length = |w: &str| w.chars().count().min(8);
            rc.cmp(lc)
                .then_with(|| length(rw).cmp(&length(lw)))
                .then_with(|| rw.cmp(lw))
        });
        counter.truncate(self.top_words);
        counter
    }
}

impl Default for TextFingerprinter {
    fn default() -> Self {
        Self::new(7, 10)
    }
}

impl Walk<'_> {
    fn visit<'a, 'input: 'a>(&mut self, node: Node<'a, 'input>, path: &mut Vec<&'a str>) {
        if node.is_text() {
            if let Some(value) = node.text() {
                self.on_text(path, value);
            }
            return;
        }
        if !node.is_element() {
            return;
        }

        let name = node.tag_name().name();
        if name == SECTION {
            let parent = self.open.last().map(|s| s.index).unwrap_or(SectionTree::ROOT);
            let index = self.tree.add_child(parent);
            self.open.push(OpenSection {
                index,
                histogram: HashMap::new(),
            });
        }

        path.push(name);
        for child in node.children() {
            self.visit(child, path);
        }
        path.pop();

        if name == SECTION {
            self.close_section();
        }
    }

    fn on_text(&mut self, path: &[&str], value: &str) {
        let lowercase: String = value
            .chars()
            .flat_map(char::to_lowercase)
            .filter(|ch| ch.is_lowercase())
            .collect();
        self.digest.update(&lowercase);

        if path == TITLE_PATH {
            self.title.push_str(value);
            return;
        }

        let in_body = path.len() > 1 && path[1].eq_ignore_ascii_case(BODY);
        if !in_body || path.contains(&SUBTITLE) {
            return;
        }

        for word in prepare_text(value).split_whitespace() {
            let word: String = word.chars().filter(|ch| ch.is_lowercase()).collect();
            if word.chars().count() <= self.fingerprinter.min_word_length {
                continue;
            }
            for section in &mut self.open {
                *section.histogram.entry(word.clone()).or_default() += 1;
            }
        }
    }

    fn close_section(&mut self) {
        let Some(section) = self.open.pop() else {
            return;
        };

        let distinct_words = section.histogram.len();
        let ranked = self.fingerprinter.rank(section.histogram);
        let hash = md5_hex(ranked.iter().map(|(_, word)| word.as_str()));
        self.tree.set_summary(section.index, hash, distinct_words);

        if section.index == SectionTree::ROOT {
            self.root_words = ranked;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(title: &str, body: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<FictionBook xmlns="http://www.gribuser.ru/xml/fictionbook/2.0">
  <description><title-info><book-title>{}</book-title></title-info></description>
  <body>{}</body>
</FictionBook>"#,
            title, body
        )
        .into_bytes()
    }

    #[test]
    fn test_title_and_tokens() {
        let fp = TextFingerprinter::default()
            .fingerprint(&book("Foundation 2", "<p>text</p>"))
            .unwrap();
        assert_eq!(fp.title, "Foundation 2");
        assert!(fp.title_tokens.contains("foundation"));
        assert!(fp.title_tokens.contains("2"));
    }

    #[test]
    fn test_content_hash_ignores_structure() {
        let fingerprinter = TextFingerprinter::default();
        let flat = fingerprinter
            .fingerprint(&book("T", "<p>Alpha beta gamma</p>"))
            .unwrap();
        let nested = fingerprinter
            .fingerprint(&book(
                "T",
                "<section><p>Alpha</p><section><p>beta</p></section></section><p>gamma</p>",
            ))
            .unwrap();
        assert_eq!(flat.content_hash, nested.content_hash);
        assert_eq!(flat.content_hash.len(), 32);
    }

    #[test]
    fn test_content_hash_uses_only_lowercase_letters() {
        let fingerprinter = TextFingerprinter::default();
        let a = fingerprinter.fingerprint(&book("T", "<p>Hello, world! 42</p>")).unwrap();
        let b = fingerprinter.fingerprint(&book("T", "<p>hello world</p>")).unwrap();
        let c = fingerprinter.fingerprint(&book("T", "<p>hello there</p>")).unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn test_section_tree_inherits_counts() {
        let body = "<section><p>elephantine elephantine</p>\
                    <section><p>magnificent</p></section></section>\
                    <section><p>short words only</p></section>";
        let fp = TextFingerprinter::default().fingerprint(&book("T", body)).unwrap();

        let nodes: Vec<_> = fp.sections.iter().collect();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].depth, 0);
        assert_eq!(nodes[0].distinct_words, 2);
        assert_eq!(nodes[1].depth, 1);
        assert_eq!(nodes[1].distinct_words, 2);
        assert_eq!(nodes[2].depth, 2);
        assert_eq!(nodes[2].distinct_words, 1);
        assert_eq!(nodes[3].distinct_words, 0);
        assert_eq!(nodes[3].hash, md5_hex([]));

        assert_eq!(fp.root_section_hash, nodes[0].hash);
        assert_eq!(
            fp.top_words,
            vec![(2, "elephantine".to_string()), (1, "magnificent".to_string())]
        );
        assert_eq!(nodes[0].hash, md5_hex(["elephantine", "magnificent"]));
    }

    #[test]
    fn test_section_titles_are_not_counted() {
        let body = "<section><title><p>Chapterheading</p></title><p>paragraphs</p></section>";
        let fp = TextFingerprinter::default().fingerprint(&book("T", body)).unwrap();
        assert_eq!(fp.top_words, vec![(1, "paragraphs".to_string())]);
    }

    #[test]
    fn test_ranking_prefers_count_then_length() {
        let fingerprinter = TextFingerprinter::new(0, 3);
        let histogram: HashMap<String, usize> = [("aa", 2), ("bbbb", 2), ("c", 5), ("dddddd", 1)]
            .into_iter()
            .map(|(w, c)| (w.to_string(), c))
            .collect();
        let ranked: Vec<_> = fingerprinter
            .rank(histogram)
            .into_iter()
            .map(|(_, w)| w)
            .collect();
        assert_eq!(ranked, vec!["c", "bbbb", "aa"]);
    }

    #[test]
    fn test_malformed_markup_is_error() {
        let fingerprinter = TextFingerprinter::default();
        assert!(matches!(
            fingerprinter.fingerprint(b"<FictionBook><body>"),
            Err(TextError::Parse(_))
        ));
        assert!(matches!(
            fingerprinter.fingerprint(&[0xff, 0xfe, 0x00]),
            Err(TextError::Encoding(_))
        ));
        assert!(matches!(
            fingerprinter.fingerprint(b"<html/>"),
            Err(TextError::UnexpectedRoot { .. })
        ));
    }
}
