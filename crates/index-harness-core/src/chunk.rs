//! Token-budgeted document chunker.
//!
//! Splits a [`Document`] body into [`Chunk`]s of at most `max_tokens`
//! whitespace-delimited tokens. The document's semantic identifier is
//! prepended to the first chunk so a chunk retrieved on its own still says
//! where it came from. The indexing pipeline only needs the chunk count for
//! run accounting; the SQLite sink also stores the chunk text.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Document;

/// A contiguous slice of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Split `doc` into chunks of at most `max_tokens` tokens.
///
/// Always returns at least one chunk, and indices are contiguous from 0.
/// A `max_tokens` of 0 is treated as 1.
pub fn chunk_document(doc: &Document, max_tokens: usize) -> Vec<Chunk> {
    let budget = max_tokens.max(1);
    let tokens: Vec<&str> = doc.body.split_whitespace().collect();

    if tokens.is_empty() {
        return vec![make_chunk(&doc.id, 0, doc.semantic_identifier.trim())];
    }

    tokens
        .chunks(budget)
        .enumerate()
        .map(|(i, window)| {
            let body = window.join(" ");
            let text = if i == 0 && !doc.semantic_identifier.is_empty() {
                format!("{}\n{}", doc.semantic_identifier, body)
            } else {
                body
            };
            make_chunk(&doc.id, i as i64, &text)
        })
        .collect()
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let hash = format!("{:x}", Sha256::digest(text.as_bytes()));
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Document {
        Document {
            id: "doc-1".into(),
            source: "fixture:test".into(),
            semantic_identifier: "#general".into(),
            link: None,
            body: body.into(),
            updated_at: None,
            metadata: Default::default(),
            resource_id: None,
            external_access: None,
        }
    }

    #[test]
    fn empty_body_yields_one_chunk() {
        let chunks = chunk_document(&doc(""), 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "#general");
    }

    #[test]
    fn splits_on_token_budget() {
        let chunks = chunk_document(&doc("a b c d e f g"), 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "#general\na b c");
        assert_eq!(chunks[2].text, "g");
        let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn same_text_same_hash() {
        let a = chunk_document(&doc("one two"), 8);
        let b = chunk_document(&doc("one two"), 8);
        assert_eq!(a[0].hash, b[0].hash);
        assert_ne!(a[0].id, b[0].id);
    }
}
