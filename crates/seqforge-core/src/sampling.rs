//! Temperature scaling, top-p (nucleus) filtering, and token sampling for
//! the `Completion` operation (§4.4.2).
//!
//! This stands in for the `llama_sample_temp` / `llama_sample_top_p` /
//! `llama_sample_token` trio a native sampler chain (`slab-llama`'s
//! `SamplerChainBuilder`, for one) would expose — implemented directly over
//! a logits slice since the engine adapter contract (§6.1) hands back raw
//! logits rather than a native sampler chain.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::engine::TokenId;

const TOP_P: f32 = 0.9;

/// One candidate retained after top-p filtering, in the shape streamed back
/// to clients (§4.2): `(token_id, logit)`.
pub type Candidate = (TokenId, f32);

/// Sample one token from `logits` under temperature `temperature` and
/// top-p filtering, reporting at most `top_p_k` of the retained candidates
/// (§4.4.2 steps 1-5; the GLOSSARY: "0 means report none, sample only").
pub fn sample_completion(
    logits: &[f32],
    temperature: f32,
    top_p_k: u32,
    rng: &mut impl Rng,
) -> (TokenId, Vec<Candidate>) {
    let min_keep = (top_p_k as usize).max(1).min(logits.len());

    let mut ranked: Vec<Candidate> = logits
        .iter()
        .enumerate()
        .map(|(id, &logit)| {
            let scaled = if temperature > 0.0 {
                logit / temperature
            } else {
                logit
            };
            (id as TokenId, scaled)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let max_logit = ranked[0].1;
    let exps: Vec<f32> = ranked.iter().map(|(_, l)| (l - max_logit).exp()).collect();
    let norm: f32 = exps.iter().sum();
    let probs: Vec<f32> = exps.iter().map(|e| e / norm).collect();

    let mut cumulative = 0.0_f32;
    let mut keep = 0usize;
    for (i, p) in probs.iter().enumerate() {
        cumulative += p;
        keep = i + 1;
        if cumulative >= TOP_P && keep >= min_keep {
            break;
        }
    }
    keep = keep.max(min_keep).min(ranked.len());

    let kept = &ranked[..keep];
    let kept_probs = &probs[..keep];

    let token = if kept.len() == 1 {
        kept[0].0
    } else {
        let dist = WeightedIndex::new(kept_probs).expect("at least one positive-probability candidate");
        kept[dist.sample(rng)].0
    };

    let report_n = (top_p_k as usize).min(keep);
    let candidates = kept[..report_n].to_vec();
    (token, candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn spiked_logits(vocab: usize, peak: usize) -> Vec<f32> {
        let mut logits = vec![-10.0_f32; vocab];
        logits[peak] = 1000.0;
        logits
    }

    #[test]
    fn overwhelming_peak_is_always_selected() {
        let logits = spiked_logits(16, 7);
        let mut rng = StdRng::seed_from_u64(42);
        let (token, _) = sample_completion(&logits, 1.0, 0, &mut rng);
        assert_eq!(token, 7);
    }

    #[test]
    fn top_p_k_zero_reports_no_candidates() {
        let logits = spiked_logits(16, 3);
        let mut rng = StdRng::seed_from_u64(1);
        let (_, candidates) = sample_completion(&logits, 1.0, 0, &mut rng);
        assert!(candidates.is_empty());
    }

    #[test]
    fn top_p_k_reports_requested_count() {
        let mut logits = vec![0.0_f32; 32];
        for (i, l) in logits.iter_mut().enumerate() {
            *l = i as f32;
        }
        let mut rng = StdRng::seed_from_u64(7);
        let (_, candidates) = sample_completion(&logits, 1.0, 5, &mut rng);
        assert_eq!(candidates.len(), 5);
        assert_eq!(candidates[0].0, 31);
    }
}
