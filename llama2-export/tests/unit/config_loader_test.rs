use super::*;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

fn write_config(temp_dir: &TempDir, content: &str) -> Result<()> {
    fs::write(temp_dir.path().join("config.json"), content)?;
    Ok(())
}

#[test]
fn test_load_hf_config_valid() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_config(
        &temp_dir,
        r#"{
            "architectures": ["LlamaForCausalLM"],
            "hidden_size": 256,
            "intermediate_size": 688,
            "num_hidden_layers": 4,
            "num_attention_heads": 8,
            "num_key_value_heads": 4,
            "vocab_size": 32000,
            "max_position_embeddings": 512,
            "rms_norm_eps": 1e-5,
            "tie_word_embeddings": true
        }"#,
    )?;

    let config = load_hf_config(temp_dir.path())?;

    assert_eq!(
        config,
        ModelConfig {
            dim: 256,
            hidden_dim: 688,
            n_layers: 4,
            n_heads: 8,
            n_kv_heads: 4,
            vocab_size: 32000,
            max_seq_len: 512,
            tie_word_embeddings: true,
        }
    );
    assert_eq!(config.head_size(), 32);
    assert_eq!(config.kv_dim(), 128);

    Ok(())
}

#[test]
fn test_load_hf_config_defaults() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_config(
        &temp_dir,
        r#"{
            "hidden_size": 64,
            "intermediate_size": 172,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "vocab_size": 512,
            "max_position_embeddings": 128
        }"#,
    )?;

    let config = load_hf_config(temp_dir.path())?;

    assert_eq!(config.n_kv_heads, config.n_heads);
    assert!(!config.tie_word_embeddings);

    Ok(())
}

#[test]
fn test_load_hf_config_invalid_json() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_config(&temp_dir, "invalid json")?;

    let result = load_hf_config(temp_dir.path());
    assert_eq!(result.unwrap_err().to_string(), "Failed to parse config.json: expected value at line 1 column 1");

    Ok(())
}

#[test]
fn test_load_hf_config_missing_required_field() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_config(&temp_dir, r#"{ "intermediate_size": 1024, "num_hidden_layers": 4 }"#)?;

    let error = load_hf_config(temp_dir.path()).unwrap_err();
    assert!(error.to_string().contains("hidden_size"), "unexpected error: {error}");

    Ok(())
}

#[test]
fn test_load_hf_config_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let error = load_hf_config(temp_dir.path()).unwrap_err();
    assert!(error.to_string().starts_with("Failed to open config.json"));
}

#[test]
fn test_load_hf_config_rejects_other_architectures() -> Result<()> {
    let temp_dir = TempDir::new()?;
    write_config(
        &temp_dir,
        r#"{
            "architectures": ["Qwen3ForCausalLM"],
            "hidden_size": 64,
            "intermediate_size": 172,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "vocab_size": 512,
            "max_position_embeddings": 128
        }"#,
    )?;

    let error = load_hf_config(temp_dir.path()).unwrap_err();
    assert!(error.to_string().contains("Unsupported architectures"));

    Ok(())
}

#[test]
fn test_validate_rejects_bad_shapes() {
    let valid = ModelConfig {
        dim: 64,
        hidden_dim: 172,
        n_layers: 2,
        n_heads: 4,
        n_kv_heads: 2,
        vocab_size: 512,
        max_seq_len: 128,
        tie_word_embeddings: false,
    };
    assert!(valid.validate().is_ok());

    assert!(ModelConfig { n_layers: 0, ..valid.clone() }.validate().is_err());
    assert!(ModelConfig { n_heads: 6, ..valid.clone() }.validate().is_err());
    assert!(ModelConfig { n_kv_heads: 3, ..valid.clone() }.validate().is_err());
    // head size 64 / 64 = 1 is odd
    assert!(ModelConfig { n_heads: 64, n_kv_heads: 64, ..valid.clone() }.validate().is_err());
    assert!(ModelConfig { vocab_size: usize::MAX, ..valid }.validate().is_err());
}
