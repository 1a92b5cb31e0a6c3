/// Client-side token count estimate for text the server has not metered yet.
///
/// Blend of a word-based and a character-based heuristic; matches no
/// particular tokenizer but tracks real counts closely enough for context
/// budgeting in the UI.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count() as f64;
    let chars = text.chars().count() as f64;

    ((words * 1.3 + chars / 4.0) / 2.0).ceil() as u64
}
