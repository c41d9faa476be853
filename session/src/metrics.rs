use std::collections::HashMap;

/// Characters stripped during answer normalization.
const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<>?@[\\]^_`{|}~";

/// Canonical answer form: lowercase, punctuation removed, the articles
/// a/an/the dropped, whitespace collapsed.
pub fn normalize_answer(answer: &str) -> String {
    let lowered = answer.to_lowercase();
    let depunctuated: String = lowered
        .chars()
        .filter(|c| !PUNCTUATION.contains(*c))
        .collect();
    depunctuated
        .split_whitespace()
        .filter(|token| !matches!(*token, "a" | "an" | "the"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn exact_match(gold: &str, prediction: &str) -> bool {
    normalize_answer(gold) == normalize_answer(prediction)
}

/// Token-overlap F1 between normalized answers.
pub fn f1(gold: &str, prediction: &str) -> f64 {
    let gold = normalize_answer(gold);
    let prediction = normalize_answer(prediction);
    let gold_tokens: Vec<&str> = gold.split_whitespace().collect();
    let prediction_tokens: Vec<&str> = prediction.split_whitespace().collect();

    if gold_tokens.is_empty() || prediction_tokens.is_empty() {
        return if gold_tokens == prediction_tokens { 1.0 } else { 0.0 };
    }

    let mut gold_counts: HashMap<&str, usize> = HashMap::new();
    for token in &gold_tokens {
        *gold_counts.entry(token).or_insert(0) += 1;
    }
    let mut common = 0usize;
    for token in &prediction_tokens {
        if let Some(count) = gold_counts.get_mut(token) {
            if *count > 0 {
                *count -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return 0.0;
    }

    let precision = common as f64 / prediction_tokens.len() as f64;
    let recall = common as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Best score across the gold aliases of one question.
pub fn best_over_golds(golds: &[String], prediction: &str) -> (f64, f64) {
    let mut best_em = 0.0f64;
    let mut best_f1 = 0.0f64;
    for gold in golds {
        if exact_match(gold, prediction) {
            best_em = 1.0;
        }
        best_f1 = best_f1.max(f1(gold, prediction));
    }
    (best_em, best_f1)
}
