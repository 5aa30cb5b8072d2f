use tantivy::schema::{IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING};
use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer,
    TokenStream,
};
use tantivy::Index;

use repolens_core::tokens::{identifier_parts, word_tokens, STOP_WORDS};

pub const CODE_TOKENIZER: &str = "code_text";
pub const PATH_FIELD: &str = "path";
pub const BODY_FIELD: &str = "body";

pub fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field(PATH_FIELD, STRING | STORED);
    let body_indexing = TextFieldIndexing::default()
        .set_tokenizer(CODE_TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    schema_builder.add_text_field(
        BODY_FIELD,
        TextOptions::default().set_indexing_options(body_indexing),
    );
    schema_builder.build()
}

/// Lowercase, word-boundary split, stop-words dropped, English stemming.
pub fn build_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(STOP_WORDS.iter().map(|s| (*s).to_string())))
        .filter(Stemmer::new(Language::English))
        .build()
}

pub fn register_analyzer(index: &Index) {
    index.tokenizers().register(CODE_TOKENIZER, build_analyzer());
}

/// Terms produced by `analyzer` for `text`, in order, duplicates kept.
pub fn analyze(analyzer: &mut TextAnalyzer, text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut stream = analyzer.token_stream(text);
    stream.process(&mut |token| terms.push(token.text.clone()));
    terms
}

/// The text indexed for one document: path words, the leading
/// `summary_chars` characters, and split identifier names.
pub fn token_bag(path: &str, text: &str, summary_chars: usize) -> String {
    let summary: String = text.chars().take(summary_chars).collect();
    let mut bag = word_tokens(path).join(" ");
    for part in identifier_parts(path) {
        bag.push(' ');
        bag.push_str(&part);
    }
    bag.push('\n');
    bag.push_str(&summary);
    bag.push('\n');
    bag.push_str(&identifier_parts(&summary).join(" "));
    bag
}
