use crate::sampler::Sampler;
use crate::tokenizer::{BOS_TOKEN_ID, EOS_TOKEN_ID, Tokenizer};
use crate::transformer::Transformer;
use anyhow::{Context, Result};
use log::{debug, info};
use std::io::{BufRead, Write};
use std::time::Instant;

/// Limits shared by both generation modes.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    /// Maximum number of positions to run, 0 means the model's sequence length
    pub steps: usize,
    /// Stop generating once BOS or EOS is sampled
    pub stop_at_eos: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self { steps: 256, stop_at_eos: true }
    }
}

impl GenerationOptions {
    fn step_limit(&self, seq_len: usize) -> usize {
        if self.steps == 0 || self.steps > seq_len { seq_len } else { self.steps }
    }
}

/// Prompts given up front for a chat session.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatPrompts<'a> {
    /// Single-turn user prompt, the session ends after the reply
    pub user: Option<&'a str>,
    pub system: Option<&'a str>,
}

/// Outcome of a generation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationSummary {
    /// Number of prompt tokens fed to the model, BOS included
    pub prompt_tokens: usize,
    /// Sampled tokens that were emitted as text
    pub generated: Vec<usize>,
    /// Sampled BOS/EOS that ended the last reply, if any
    pub stop_token: Option<usize>,
    /// Number of forward passes, equal to the positions filled in the key/value cache
    pub positions: usize,
}

/// Completes `prompt` and writes the prompt pieces followed by the generated text to `out`.
pub fn generate<W: Write>(
    transformer: &Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompt: &str,
    options: GenerationOptions,
    out: &mut W,
) -> Result<GenerationSummary> {
    let prompt_tokens = tokenizer.encode(prompt, true, false);
    debug!("Prompt encoded into {} tokens", prompt_tokens.len());

    let Some(&first_token) = prompt_tokens.first() else {
        anyhow::bail!("Prompt produced no tokens");
    };

    let steps = options.step_limit(transformer.config().seq_len);
    let mut run_state = transformer.new_state();
    let mut state = GenerationState::new(first_token);
    let mut summary = GenerationSummary { prompt_tokens: prompt_tokens.len(), ..Default::default() };

    while state.pos < steps {
        let logits = transformer.forward(&mut run_state, state.token, state.pos);
        summary.positions += 1;

        let next_token = if state.pos + 1 < prompt_tokens.len() {
            // Still processing prompt tokens
            prompt_tokens[state.pos + 1]
        } else {
            state.metrics.start_generation();
            let next = sampler.sample(logits);
            state.metrics.increment_token();

            if options.stop_at_eos && is_termination_token(next) {
                summary.stop_token = Some(next);
                break;
            }
            summary.generated.push(next);
            next
        };

        write_piece(out, tokenizer.decode(state.token, next_token))?;
        state.advance(next_token);
    }

    writeln!(out)?;
    state.metrics.report_and_reset();

    Ok(summary)
}

/// Interactive Llama-2 chat.
///
/// Prompts come from `prompts` or are read line by line from `input`; the session ends on an empty
/// user prompt or when the step budget is used up. A sampled BOS/EOS hands the turn back to the user.
pub fn chat<R: BufRead, W: Write>(
    transformer: &Transformer,
    tokenizer: &Tokenizer,
    sampler: &mut Sampler,
    prompts: ChatPrompts<'_>,
    options: GenerationOptions,
    input: &mut R,
    out: &mut W,
) -> Result<GenerationSummary> {
    let steps = options.step_limit(transformer.config().seq_len);
    let mut run_state = transformer.new_state();
    let mut state = GenerationState::new(BOS_TOKEN_ID);
    let mut summary = GenerationSummary::default();

    let mut turn_tokens: Vec<usize> = Vec::new();
    let mut turn_idx = 0;
    let mut user_turn = true;

    while state.pos < steps {
        if user_turn {
            state.metrics.report_and_reset();

            let Some(rendered_prompt) = read_turn(input, out, state.pos, prompts)? else {
                break;
            };

            let prompt_tokens = tokenizer.encode(&rendered_prompt, true, false);
            summary.prompt_tokens += prompt_tokens.len();

            turn_tokens.clear();
            if state.pos > 0 {
                // The token that closed the previous reply goes into the context first
                turn_tokens.push(state.token);
            }
            turn_tokens.extend(prompt_tokens);
            turn_idx = 0;
            user_turn = false;

            write!(out, "Assistant: ")?;
            out.flush()?;
        }

        let token = match turn_tokens.get(turn_idx) {
            Some(&prompt_token) => {
                turn_idx += 1;
                prompt_token
            }
            None => state.token,
        };
        let replying = turn_idx >= turn_tokens.len();

        let logits = transformer.forward(&mut run_state, token, state.pos);
        summary.positions += 1;

        if replying {
            state.metrics.start_generation();
        }
        let next_token = sampler.sample(logits);
        state.advance(next_token);

        if replying {
            state.metrics.increment_token();

            if is_termination_token(next_token) {
                summary.stop_token = Some(next_token);
                writeln!(out)?;
                user_turn = true;
            } else {
                summary.generated.push(next_token);
                write_piece(out, tokenizer.decode(token, next_token))?;
            }
        }
    }

    writeln!(out)?;
    state.metrics.report_and_reset();

    Ok(summary)
}

fn read_turn<R: BufRead, W: Write>(
    input: &mut R,
    out: &mut W,
    pos: usize,
    prompts: ChatPrompts<'_>,
) -> Result<Option<String>> {
    let first_turn = pos == 0;

    let system_prompt = match (first_turn, prompts.system, prompts.user) {
        (true, Some(system), _) => system.to_string(),
        (true, None, None) => read_line(input, out, "Enter system prompt (optional): ")?,
        _ => String::new(),
    };

    let user_prompt = match (first_turn, prompts.user) {
        (true, Some(user)) => user.to_string(),
        (false, Some(_)) => return Ok(None),
        _ => read_line(input, out, "User: ")?,
    };

    if user_prompt.is_empty() {
        return Ok(None);
    }

    let system_prompt = Some(system_prompt.as_str()).filter(|system| !system.is_empty());
    Ok(Some(render_prompt(system_prompt, &user_prompt)))
}

fn read_line<R: BufRead, W: Write>(input: &mut R, out: &mut W, label: &str) -> Result<String> {
    write!(out, "{label}")?;
    out.flush()?;

    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read user input")?;
    Ok(line.trim().to_string())
}

/// Renders one user turn in the Llama-2 chat format, with the system block only on the first turn.
pub fn render_prompt(system_prompt: Option<&str>, user_prompt: &str) -> String {
    match system_prompt {
        Some(system) => format!("[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user_prompt} [/INST]"),
        None => format!("[INST] {user_prompt} [/INST]"),
    }
}

fn is_termination_token(token: usize) -> bool {
    token == BOS_TOKEN_ID || token == EOS_TOKEN_ID
}

/// Writes a decoded piece, skipping single bytes that are control characters other than whitespace.
fn write_piece<W: Write>(out: &mut W, piece: &[u8]) -> Result<()> {
    if let [byte] = piece {
        if byte.is_ascii_control() && !byte.is_ascii_whitespace() {
            return Ok(());
        }
    }

    out.write_all(piece)?;
    out.flush()?;
    Ok(())
}

/// Tracks token generation performance metrics
struct TokenMetrics {
    start_time: Option<Instant>,
    generated_count: usize,
}

impl TokenMetrics {
    fn new() -> Self {
        Self { start_time: None, generated_count: 0 }
    }

    fn start_generation(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Instant::now());
        }
    }

    fn increment_token(&mut self) {
        self.generated_count += 1;
    }

    fn report_and_reset(&mut self) {
        if let Some(start_time) = self.start_time.take() {
            let duration = start_time.elapsed();
            if self.generated_count > 0 && duration.as_secs_f64() > 0.0 {
                let tps = self.generated_count as f64 / duration.as_secs_f64();
                info!(
                    "Generated {} tokens in {:.2}s - {:.2} tokens/sec",
                    self.generated_count,
                    duration.as_secs_f64(),
                    tps
                );
            }
        }
        self.generated_count = 0;
    }
}

/// Represents the current generation state
struct GenerationState {
    pos: usize,
    token: usize,
    metrics: TokenMetrics,
}

impl GenerationState {
    fn new(initial_token: usize) -> Self {
        Self { pos: 0, token: initial_token, metrics: TokenMetrics::new() }
    }

    fn advance(&mut self, next_token: usize) {
        self.token = next_token;
        self.pos += 1;
    }
}
