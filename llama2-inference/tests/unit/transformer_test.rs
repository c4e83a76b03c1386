use super::*;

const TOLERANCE: f32 = 1e-4;

fn tiny_config(n_layers: usize, n_kv_heads: usize, shared_classifier: bool) -> ModelConfig {
    ModelConfig { dim: 8, hidden_dim: 12, n_layers, n_heads: 4, n_kv_heads, vocab_size: 6, seq_len: 5, shared_classifier }
}

fn tiny_weights(config: &ModelConfig) -> Vec<f32> {
    let total = TensorLayout::new(config).unwrap().total;
    (0..total).map(|i| (i as f32 * 0.37).sin() * 0.5).collect()
}

fn naive_matmul(w: &[f32], x: &[f32]) -> Vec<f32> {
    let n = x.len();
    (0..w.len() / n).map(|i| (0..n).map(|j| w[i * n + j] * x[j]).sum()).collect()
}

fn naive_rmsnorm(x: &[f32], w: &[f32]) -> Vec<f32> {
    let ms = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let scale = 1.0 / (ms + 1e-5).sqrt();
    x.iter().zip(w).map(|(v, w)| v * scale * w).collect()
}

fn naive_rotate(v: &mut [f32], pos: usize, head_size: usize) {
    for i in (0..v.len()).step_by(2) {
        let head_dim = i % head_size;
        let freq = 1.0 / 10000f32.powf(head_dim as f32 / head_size as f32);
        let (sin, cos) = (pos as f32 * freq).sin_cos();
        let (v0, v1) = (v[i], v[i + 1]);
        v[i] = v0 * cos - v1 * sin;
        v[i + 1] = v0 * sin + v1 * cos;
    }
}

fn layer<'a>(data: &'a [f32], range: &std::ops::Range<usize>, l: usize, size: usize) -> &'a [f32] {
    &data[range.start + l * size..][..size]
}

/// Straightforward sequential forward pass over a whole token sequence, returning logits per position.
fn reference_logits(config: &ModelConfig, data: &[f32], tokens: &[usize]) -> Vec<Vec<f32>> {
    let layout = TensorLayout::new(config).unwrap();
    let (dim, hidden, kv_dim, hs) = (config.dim, config.hidden_dim, config.kv_dim(), config.head_size());

    let mut keys = vec![Vec::<Vec<f32>>::new(); config.n_layers];
    let mut values = vec![Vec::<Vec<f32>>::new(); config.n_layers];
    let mut all_logits = Vec::new();

    for (pos, &token) in tokens.iter().enumerate() {
        let mut x = data[layout.token_embedding_table.start + token * dim..][..dim].to_vec();

        for l in 0..config.n_layers {
            let xb = naive_rmsnorm(&x, layer(data, &layout.rms_att_weight, l, dim));
            let mut q = naive_matmul(layer(data, &layout.wq, l, dim * dim), &xb);
            let mut k = naive_matmul(layer(data, &layout.wk, l, kv_dim * dim), &xb);
            let v = naive_matmul(layer(data, &layout.wv, l, kv_dim * dim), &xb);
            naive_rotate(&mut q, pos, hs);
            naive_rotate(&mut k, pos, hs);
            keys[l].push(k);
            values[l].push(v);

            let mut out = vec![0.0; dim];
            for h in 0..config.n_heads {
                let kv_h = h / config.kv_mul();
                let mut scores: Vec<f32> = (0..=pos)
                    .map(|t| (0..hs).map(|i| q[h * hs + i] * keys[l][t][kv_h * hs + i]).sum::<f32>() / (hs as f32).sqrt())
                    .collect();
                let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = scores.iter().map(|s| (s - max).exp()).sum();
                scores.iter_mut().for_each(|s| *s = (*s - max).exp() / sum);

                for (t, s) in scores.iter().enumerate() {
                    for i in 0..hs {
                        out[h * hs + i] += s * values[l][t][kv_h * hs + i];
                    }
                }
            }
            let attn = naive_matmul(layer(data, &layout.wo, l, dim * dim), &out);
            x.iter_mut().zip(&attn).for_each(|(x, a)| *x += a);

            let xb = naive_rmsnorm(&x, layer(data, &layout.rms_ffn_weight, l, dim));
            let h1 = naive_matmul(layer(data, &layout.w1, l, hidden * dim), &xb);
            let h3 = naive_matmul(layer(data, &layout.w3, l, hidden * dim), &xb);
            let gated: Vec<f32> = h1.iter().zip(&h3).map(|(a, b)| a / (1.0 + (-a).exp()) * b).collect();
            let ffn = naive_matmul(layer(data, &layout.w2, l, dim * hidden), &gated);
            x.iter_mut().zip(&ffn).for_each(|(x, f)| *x += f);
        }

        let normed = naive_rmsnorm(&x, &data[layout.rms_final_weight.clone()]);
        all_logits.push(naive_matmul(&data[layout.wcls.clone()], &normed));
    }

    all_logits
}

fn assert_close(actual: &[f32], expected: &[f32], context: &str) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < TOLERANCE, "{context}, index {i}: {a} != {e}");
    }
}

fn check_against_reference(config: ModelConfig) {
    let data = tiny_weights(&config);
    let tokens = [1, 4, 2, 5, 3];
    let expected = reference_logits(&config, &data, &tokens);

    let transformer = Transformer::from_weights(config, data).unwrap();
    let mut state = transformer.new_state();

    for (pos, &token) in tokens.iter().enumerate() {
        let logits = transformer.forward(&mut state, token, pos);
        assert_close(logits, &expected[pos], &format!("pos {pos}"));
    }
}

#[test]
fn test_forward_single_layer_matches_reference() {
    check_against_reference(tiny_config(1, 4, false));
}

#[test]
fn test_forward_grouped_query_matches_reference() {
    check_against_reference(tiny_config(2, 2, false));
    check_against_reference(tiny_config(2, 1, true));
}

#[test]
fn test_shared_classifier_uses_embeddings() {
    let config = tiny_config(1, 2, true);
    let transformer = Transformer::from_weights(config.clone(), tiny_weights(&config)).unwrap();
    let weights = transformer.weights();

    assert_eq!(weights.wcls().as_ptr(), weights.token_embedding_table().as_ptr());
    assert_eq!(weights.wcls().len(), config.vocab_size * config.dim);
}

#[test]
fn test_kv_cache_is_append_only() {
    let config = tiny_config(2, 2, false);
    let transformer = Transformer::from_weights(config.clone(), tiny_weights(&config)).unwrap();
    let mut state = transformer.new_state();

    let mut snapshots: Vec<Vec<(Vec<f32>, Vec<f32>)>> = Vec::new();

    for (pos, token) in [3, 1, 4, 1].into_iter().enumerate() {
        transformer.forward(&mut state, token, pos);

        for (earlier, snapshot) in snapshots.iter().enumerate() {
            for (layer, (keys, values)) in snapshot.iter().enumerate() {
                let (k, v) = state.kv_at(layer, earlier);
                assert_eq!(k, keys.as_slice(), "key at layer {layer}, pos {earlier} changed");
                assert_eq!(v, values.as_slice(), "value at layer {layer}, pos {earlier} changed");
            }
        }

        let (k, _) = state.kv_at(0, pos);
        assert!(k.iter().any(|&value| value != 0.0));

        snapshots.push(
            (0..config.n_layers).map(|layer| {
                let (k, v) = state.kv_at(layer, pos);
                (k.to_vec(), v.to_vec())
            })
            .collect(),
        );
    }

    // slots past the last position are still untouched
    let (k, v) = state.kv_at(1, 4);
    assert!(k.iter().chain(v).all(|&value| value == 0.0));
}

#[test]
#[should_panic(expected = "exceeds sequence length")]
fn test_forward_rejects_position_past_sequence() {
    let config = tiny_config(1, 4, false);
    let transformer = Transformer::from_weights(config.clone(), tiny_weights(&config)).unwrap();
    let mut state = transformer.new_state();

    transformer.forward(&mut state, 1, config.seq_len);
}

#[test]
#[should_panic(expected = "outside the vocabulary")]
fn test_forward_rejects_unknown_token() {
    let config = tiny_config(1, 4, false);
    let transformer = Transformer::from_weights(config.clone(), tiny_weights(&config)).unwrap();
    let mut state = transformer.new_state();

    transformer.forward(&mut state, config.vocab_size, 0);
}

#[test]
fn test_rope_identity_at_position_zero() {
    let rope = RoPE::new(4);
    let mut freqs = vec![(0.0, 0.0); 2];
    rope.compute_freqs(0, &mut freqs);
    assert_eq!(freqs, vec![(1.0, 0.0), (1.0, 0.0)]);

    let mut x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
    let original = x;
    rope.apply(&mut x, &freqs);
    assert_eq!(x, original);
}

#[test]
fn test_rope_rotates_pairs() {
    let rope = RoPE::new(4);
    let mut freqs = vec![(0.0, 0.0); 2];
    rope.compute_freqs(1, &mut freqs);

    let mut x = [1.0, 0.0, 1.0, 0.0];
    rope.apply(&mut x, &freqs);

    // pair 0 rotates by 1 rad, pair 1 by 10000^(-1/2) rad
    let slow = 0.01f32;
    assert_close(&x, &[1.0f32.cos(), 1.0f32.sin(), slow.cos(), slow.sin()], "rope");

    // rotation keeps the norm of every pair
    let norm = (x[0] * x[0] + x[1] * x[1]).sqrt();
    assert!((norm - 1.0).abs() < TOLERANCE);
}

#[test]
fn test_from_weights_too_short() {
    let config = tiny_config(1, 4, false);
    let mut data = tiny_weights(&config);
    data.pop();

    assert!(Transformer::from_weights(config, data).is_err());
}
