//! Token sampling.
//!
//! Temperature, top-k, top-p, and min-p filtering over the output logits,
//! optionally constrained by a compiled grammar. Zero temperature is
//! greedy argmax.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::model::vocab::TokenId;

#[derive(Error, Debug)]
pub enum GrammarError {
    #[error("grammar has no root rule")]
    MissingRoot,

    #[error("grammar line {line}: expected `name ::= body`")]
    MalformedRule { line: usize },

    #[error("grammar rule {0:?} is referenced but never defined")]
    UndefinedRule(String),
}

/// Sampling knobs, one set per sequence.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub min_p: f32,
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
            seed: None,
        }
    }
}

/// A compiled GBNF grammar.
///
/// Compilation validates the full rule syntax; constrained sampling is
/// supported for grammars whose root expands to an alternation of string
/// literals, which covers the closed-choice use of the endpoint. Richer
/// grammars still compile and pass through unconstrained.
#[derive(Debug, Clone)]
pub struct Grammar {
    /// Literal alternatives of the root rule, empty when the root is not a
    /// pure literal alternation.
    literals: Vec<String>,
}

impl Grammar {
    pub fn compile(text: &str) -> Result<Self, GrammarError> {
        let mut root_body = None;
        let mut names = Vec::new();
        let mut referenced = Vec::new();

        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, body) = line
                .split_once("::=")
                .ok_or(GrammarError::MalformedRule { line: i + 1 })?;
            let name = name.trim();
            let body = body.trim();
            if name.is_empty() || body.is_empty() {
                return Err(GrammarError::MalformedRule { line: i + 1 });
            }
            names.push(name.to_string());
            for alt in body.split('|') {
                let alt = alt.trim();
                if !alt.starts_with('"') {
                    referenced.push((alt.to_string(), i + 1));
                }
            }
            if name == "root" {
                root_body = Some(body.to_string());
            }
        }

        let root_body = root_body.ok_or(GrammarError::MissingRoot)?;
        for (r, _) in &referenced {
            if !names.contains(r) {
                return Err(GrammarError::UndefinedRule(r.clone()));
            }
        }

        let literals = root_body
            .split('|')
            .map(str::trim)
            .filter_map(|alt| {
                alt.strip_prefix('"')
                    .and_then(|s| s.strip_suffix('"'))
                    .map(str::to_string)
            })
            .collect::<Vec<_>>();

        // Only keep the literal set when every alternative was literal.
        let alt_count = root_body.split('|').count();
        let literals = if literals.len() == alt_count {
            literals
        } else {
            Vec::new()
        };

        Ok(Self { literals })
    }

    /// Whether emitting `piece` after `generated` keeps the output a
    /// prefix of some alternative. Unconstrained grammars allow anything.
    pub fn allows(&self, generated: &str, piece: &str) -> bool {
        if self.literals.is_empty() {
            return true;
        }
        let candidate = format!("{generated}{piece}");
        self.literals.iter().any(|l| l.starts_with(&candidate))
    }
}

/// Per-sequence sampler state.
pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
    pub grammar: Option<Grammar>,
}

impl Sampler {
    pub fn new(config: SamplerConfig, grammar: Option<Grammar>) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            grammar,
        }
    }

    pub fn greedy() -> Self {
        Self::new(
            SamplerConfig {
                temperature: 0.0,
                ..Default::default()
            },
            None,
        )
    }

    /// Pick a token from one row of logits. `allowed` filters candidates
    /// (grammar constraints); when it rejects everything the filter is
    /// dropped rather than stalling the sequence.
    pub fn sample(&mut self, logits: &[f32], allowed: impl Fn(TokenId) -> bool) -> TokenId {
        debug_assert!(!logits.is_empty());

        let mut candidates: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as TokenId, l))
            .filter(|&(id, _)| allowed(id))
            .collect();
        if candidates.is_empty() {
            candidates = logits
                .iter()
                .enumerate()
                .map(|(i, &l)| (i as TokenId, l))
                .collect();
        }

        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.config.temperature <= 0.0 {
            return candidates[0].0;
        }

        if self.config.top_k > 0 {
            candidates.truncate(self.config.top_k);
        }

        // Softmax over the survivors at the configured temperature.
        let max = candidates[0].1;
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|&(_, l)| ((l - max) / self.config.temperature).exp())
            .collect();
        let sum: f32 = probs.iter().sum();
        for p in &mut probs {
            *p /= sum;
        }

        // min-p: drop candidates below a fraction of the best.
        if self.config.min_p > 0.0 {
            let floor = probs[0] * self.config.min_p;
            let keep = probs.iter().take_while(|&&p| p >= floor).count().max(1);
            candidates.truncate(keep);
            probs.truncate(keep);
        }

        // top-p: smallest prefix of cumulative mass.
        if self.config.top_p < 1.0 {
            let mut cum = 0.0;
            let mut keep = probs.len();
            for (i, &p) in probs.iter().enumerate() {
                cum += p;
                if cum >= self.config.top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
            probs.truncate(keep);
        }

        let total: f32 = probs.iter().sum();
        let mut pick = self.rng.gen::<f32>() * total;
        for (i, &p) in probs.iter().enumerate() {
            pick -= p;
            if pick <= 0.0 {
                return candidates[i].0;
            }
        }
        candidates[candidates.len() - 1].0
    }

    /// Log-probability of one token under the full-vocabulary softmax.
    pub fn logprob_of(logits: &[f32], token: TokenId) -> f32 {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;
        logits.get(token as usize).copied().unwrap_or(f32::NEG_INFINITY) - log_sum
    }

    /// Log-probabilities of the top `k` tokens for one row, normalized
    /// over the full vocabulary.
    pub fn top_logprobs(logits: &[f32], k: usize) -> Vec<(TokenId, f32)> {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum: f32 = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln() + max;

        let mut indexed: Vec<(TokenId, f32)> = logits
            .iter()
            .enumerate()
            .map(|(i, &l)| (i as TokenId, l - log_sum))
            .collect();
        indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
        indexed.truncate(k);
        indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_argmax() {
        let mut s = Sampler::greedy();
        let logits = [0.1, 3.0, 0.5, 2.0];
        assert_eq!(s.sample(&logits, |_| true), 1);
    }

    #[test]
    fn test_seeded_sampling_deterministic() {
        let cfg = SamplerConfig {
            temperature: 1.0,
            seed: Some(42),
            ..Default::default()
        };
        let logits = [1.0, 1.1, 0.9, 1.05];
        let a: Vec<TokenId> = {
            let mut s = Sampler::new(cfg.clone(), None);
            (0..8).map(|_| s.sample(&logits, |_| true)).collect()
        };
        let b: Vec<TokenId> = {
            let mut s = Sampler::new(cfg, None);
            (0..8).map(|_| s.sample(&logits, |_| true)).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_allowed_filter() {
        let mut s = Sampler::greedy();
        let logits = [0.1, 3.0, 0.5, 2.0];
        assert_eq!(s.sample(&logits, |id| id != 1), 3);
    }

    #[test]
    fn test_top_logprobs_sorted_and_negative() {
        let lp = Sampler::top_logprobs(&[0.0, 2.0, 1.0], 2);
        assert_eq!(lp.len(), 2);
        assert_eq!(lp[0].0, 1);
        assert!(lp[0].1 < 0.0);
        assert!(lp[0].1 > lp[1].1);
    }

    #[test]
    fn test_grammar_compile_and_constrain() {
        let g = Grammar::compile("root ::= \"yes\" | \"no\"").unwrap();
        assert!(g.allows("", "y"));
        assert!(g.allows("ye", "s"));
        assert!(!g.allows("", "maybe"));
    }

    #[test]
    fn test_grammar_compile_failures() {
        assert!(matches!(
            Grammar::compile("choice ::= \"a\""),
            Err(GrammarError::MissingRoot)
        ));
        assert!(matches!(
            Grammar::compile("root \"a\""),
            Err(GrammarError::MalformedRule { line: 1 })
        ));
        assert!(matches!(
            Grammar::compile("root ::= answer"),
            Err(GrammarError::UndefinedRule(_))
        ));
    }

    #[test]
    fn test_nonliteral_grammar_unconstrained() {
        let g = Grammar::compile("root ::= word\nword ::= \"a\" | \"b\"").unwrap();
        assert!(g.allows("", "anything"));
    }
}
