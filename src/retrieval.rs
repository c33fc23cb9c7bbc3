use crate::doc_processor::Chunk;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

/// Function words ignored when tokenizing a question (already diacritic-free).
const STOP_WORDS: &[&str] = &[
    // Portuguese
    "que", "qual", "quais", "quando", "onde", "como", "para", "pra", "por", "pelo", "pela",
    "pelos", "pelas", "com", "sem", "uma", "umas", "uns", "dos", "das", "nos", "nas", "aos",
    "ate", "mais", "menos", "mas", "nao", "sim", "sao", "ser", "foi", "tem", "ter", "esta",
    "este", "isto", "essa", "esse", "isso", "aquele", "aquela", "sobre", "entre", "seu", "sua",
    "seus", "suas", "meu", "minha", "voce", "ele", "ela", "eles", "elas", "muito", "tambem",
    "quem", "porque", "pode", "posso", "existe", "num", "numa",
    // English
    "the", "and", "for", "what", "which", "who", "how", "when", "where", "with", "this",
    "that", "from", "are", "was", "were", "can", "does", "about", "have", "has", "you",
    "your", "there", "into",
];

const MIN_TOKEN_CHARS: usize = 3;

/// Bounds applied by [`select`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionLimits {
    pub max_chunks: usize,
    pub max_chars: usize,
    pub min_score: usize,
}

/// Lowercase, strip diacritics, and reduce everything that is not a letter
/// or digit to single spaces.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_space = true;
    for c in text
        .nfkd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
    {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            prev_space = false;
        } else if !prev_space {
            out.push(' ');
            prev_space = true;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Distinct, meaningful tokens of a question, in first-seen order
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    normalize(query)
        .split(' ')
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS && !STOP_WORDS.contains(t))
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// Number of distinct tokens that occur anywhere in the chunk
fn score(normalized_chunk: &str, tokens: &[String]) -> usize {
    tokens
        .iter()
        .filter(|t| normalized_chunk.contains(t.as_str()))
        .count()
}

/// Pick the chunks most relevant to `query`, best first.
///
/// Chunks are ranked by lexical overlap with the question and accepted
/// greedily within `limits`; a chunk that would overflow the character
/// budget is skipped and smaller ones after it may still fit. When nothing
/// qualifies, the opening of the first chunk is returned instead so an
/// attached document always contributes some text. The result never holds
/// more than `limits.max_chunks` chunks.
pub fn select(chunks: &[Chunk], query: &str, limits: &SelectionLimits) -> Vec<Chunk> {
    let Some(first) = chunks.first() else {
        return Vec::new();
    };
    if limits.max_chunks == 0 {
        return Vec::new();
    }

    let tokens = query_tokens(query);
    let mut selected = Vec::new();

    if !tokens.is_empty() {
        let mut ranked: Vec<(usize, &Chunk)> = chunks
            .iter()
            .map(|c| (score(&normalize(&c.text), &tokens), c))
            .collect();
        // sort_by is stable: equal scores keep document order
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let mut used_chars = 0;
        for (chunk_score, chunk) in ranked {
            if selected.len() >= limits.max_chunks || chunk_score < limits.min_score {
                break;
            }
            let len = chunk.char_len();
            if used_chars + len > limits.max_chars {
                continue;
            }
            used_chars += len;
            selected.push(chunk.clone());
        }
    }

    if selected.is_empty() {
        selected.push(Chunk {
            index: first.index,
            text: first.text.chars().take(limits.max_chars).collect(),
        });
    }

    selected
}
