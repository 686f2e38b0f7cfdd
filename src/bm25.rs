// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-call BM25 scoring using tantivy.
//!
//! The candidate set arrives pre-filtered (keyword search or sampling in
//! the external store), so ranking is always relative to this call's
//! candidates: a fresh in-RAM index is built over exactly the given
//! texts and discarded afterwards. Tokenization is lowercase
//! whitespace-split with no stemming or stopword removal.

use anyhow::{Context, Result};
use tantivy::{
    collector::TopDocs,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::{IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, INDEXED, STORED},
    tokenizer::{LowerCaser, TextAnalyzer, WhitespaceTokenizer},
    Index, IndexWriter, TantivyDocument, Term,
};
use tracing::warn;

const TOKENIZER_NAME: &str = "whitespace_lower";
const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Scores candidate texts against a query with BM25.
///
/// Returns one score per input text, in input order; higher is more
/// relevant, the range is unbounded and corpus-relative. Texts that
/// match no query term score 0.0, as do empty texts. Any index failure
/// degrades to an all-zeros array — lexical scoring must never abort
/// the retrieval pipeline.
pub fn score(query: &str, texts: &[String]) -> Vec<f32> {
    if texts.is_empty() {
        return Vec::new();
    }
    match score_inner(query, texts) {
        Ok(scores) => scores,
        Err(err) => {
            warn!(error = %err, "BM25 scoring failed; substituting zero scores");
            vec![0.0; texts.len()]
        }
    }
}

fn score_inner(query: &str, texts: &[String]) -> Result<Vec<f32>> {
    let mut schema_builder = Schema::builder();
    let ord_field = schema_builder.add_u64_field("ord", INDEXED | STORED);
    let text_options = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER_NAME)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let text_field = schema_builder.add_text_field("text", text_options);
    let schema = schema_builder.build();

    let index = Index::create_in_ram(schema);
    index.tokenizers().register(
        TOKENIZER_NAME,
        TextAnalyzer::builder(WhitespaceTokenizer::default())
            .filter(LowerCaser)
            .build(),
    );

    let mut writer: IndexWriter = index
        .writer(WRITER_HEAP_BYTES)
        .context("Failed to create index writer")?;
    for (ord, text) in texts.iter().enumerate() {
        let mut doc = TantivyDocument::default();
        doc.add_u64(ord_field, ord as u64);
        // Unextractable texts become empty documents that simply never
        // match, instead of crashing the index build.
        doc.add_text(text_field, text);
        writer.add_document(doc).context("Failed to add document")?;
    }
    writer.commit().context("Failed to commit index")?;

    let terms: Vec<(Occur, Box<dyn Query>)> = query
        .split_whitespace()
        .map(|token| {
            let term = Term::from_field_text(text_field, &token.to_lowercase());
            let term_query = TermQuery::new(term, IndexRecordOption::WithFreqs);
            (Occur::Should, Box::new(term_query) as Box<dyn Query>)
        })
        .collect();

    let mut scores = vec![0.0; texts.len()];
    if terms.is_empty() {
        return Ok(scores);
    }

    let boolean_query = BooleanQuery::new(terms);
    let reader = index.reader().context("Failed to open index reader")?;
    let searcher = reader.searcher();
    let top_docs = searcher
        .search(&boolean_query, &TopDocs::with_limit(texts.len()))
        .context("BM25 search failed")?;

    for (doc_score, doc_address) in top_docs {
        let doc: TantivyDocument = searcher.doc(doc_address).context("Failed to load document")?;
        let Some(ord) = doc.get_first(ord_field).and_then(|v| v.as_u64()) else {
            continue;
        };
        if let Some(slot) = scores.get_mut(ord as usize) {
            *slot = doc_score;
        }
    }

    Ok(scores)
}
