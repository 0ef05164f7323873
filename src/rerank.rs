//! Okapi BM25 reranking of retrieved chunks.
//!
//! The retrieved chunks are the whole corpus: document frequencies and the
//! average length come from that set alone. Terms occurring in more than half
//! of the chunks would get a negative idf; those are floored at
//! `EPSILON × average idf`.

use std::collections::HashMap;

use crate::models::RankedChunk;

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Bm25 {
    doc_freqs: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    avgdl: f64,
    idf: HashMap<String, f64>,
}

impl Bm25 {
    pub fn new<S: AsRef<str>>(corpus: &[S]) -> Self {
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut doc_lens = Vec::with_capacity(corpus.len());
        let mut containing: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            let tokens = tokenize(doc.as_ref());
            doc_lens.push(tokens.len());
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *freqs.entry(token).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *containing.entry(term.clone()).or_insert(0) += 1;
            }
            doc_freqs.push(freqs);
        }

        let n = corpus.len() as f64;
        let total_len: usize = doc_lens.iter().sum();
        let avgdl = if corpus.is_empty() {
            0.0
        } else {
            total_len as f64 / n
        };

        let mut idf: HashMap<String, f64> = containing
            .into_iter()
            .map(|(term, df)| {
                let df = df as f64;
                (term, (n - df + 0.5).ln() - (df + 0.5).ln())
            })
            .collect();

        if !idf.is_empty() {
            let average_idf = idf.values().sum::<f64>() / idf.len() as f64;
            let floor = EPSILON * average_idf;
            for value in idf.values_mut() {
                if *value < 0.0 {
                    *value = floor;
                }
            }
        }

        Self {
            doc_freqs,
            doc_lens,
            avgdl,
            idf,
        }
    }

    /// One score per corpus document, in corpus order.
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let terms = tokenize(query);
        self.doc_freqs
            .iter()
            .zip(self.doc_lens.iter())
            .map(|(freqs, &len)| {
                if self.avgdl == 0.0 {
                    return 0.0;
                }
                let norm = K1 * (1.0 - B + B * len as f64 / self.avgdl);
                terms
                    .iter()
                    .map(|term| {
                        let f = freqs.get(term).copied().unwrap_or(0) as f64;
                        let idf = self.idf.get(term).copied().unwrap_or(0.0);
                        idf * (f * (K1 + 1.0)) / (f + norm)
                    })
                    .sum()
            })
            .collect()
    }
}

/// Score `chunks` against `query` and sort best first. Ties keep their
/// retrieval order.
pub fn rerank<S: AsRef<str>>(query: &str, chunks: &[S]) -> Vec<RankedChunk> {
    if chunks.is_empty() {
        return Vec::new();
    }
    let scores = Bm25::new(chunks).scores(query);
    let mut ranked: Vec<RankedChunk> = chunks
        .iter()
        .zip(scores)
        .map(|(text, bm25_score)| RankedChunk {
            text: text.as_ref().to_string(),
            bm25_score,
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.bm25_score
            .partial_cmp(&a.bm25_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("Hello, World! It's 2024."),
            vec!["hello", "world", "it", "s", "2024"]
        );
    }

    #[test]
    fn test_unique_term_scores_highest() {
        let chunks = [
            "the cat sat on the mat",
            "the dog chased a ball",
            "a bird sang in the tree",
            "the fish swam in the pond",
        ];
        let scores = Bm25::new(&chunks).scores("dog");
        for (i, s) in scores.iter().enumerate() {
            if i != 1 {
                assert!(scores[1] >= *s);
            }
        }
        assert!(scores[1] > 0.0);
    }

    #[test]
    fn test_common_term_idf_is_floored_not_negative() {
        let chunks = ["the apple tree", "the pear orchard", "the plum jam"];
        let scores = Bm25::new(&chunks).scores("the");
        assert!(scores.iter().all(|s| *s > 0.0), "{:?}", scores);
    }

    #[test]
    fn test_rerank_sorted_descending_and_stable() {
        let chunks = ["no match here", "rust ownership rules", "also nothing"];
        let ranked = rerank("ownership", &chunks);
        assert_eq!(ranked[0].text, "rust ownership rules");
        // equal scores keep retrieval order
        assert_eq!(ranked[1].text, "no match here");
        assert_eq!(ranked[2].text, "also nothing");
        assert!(ranked.windows(2).all(|w| w[0].bm25_score >= w[1].bm25_score));
    }

    #[test]
    fn test_empty_corpus() {
        let empty: [&str; 0] = [];
        assert!(rerank("anything", &empty).is_empty());
    }
}
