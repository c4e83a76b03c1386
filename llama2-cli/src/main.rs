use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use llama2_export::export_model;
use llama2_inference::{InferenceConfigBuilder, run_inference};
use log::{error, info};

/// File name of the exported vocabulary when no explicit path is given.
const DEFAULT_TOKENIZER_FILE: &str = "tokenizer.bin";

/// Define the export subcommand.
fn export_subcommand() -> Command {
    Command::new("export")
        .about("Export a Llama model from HuggingFace format to the f32 checkpoint format")
        .arg(Arg::new("MODEL_PATH")
            .help("Path to the HuggingFace model directory (containing config.json, *.safetensors, tokenizer.json)")
            .required(true)
            .index(1))
        .arg(Arg::new("OUTPUT_PATH")
            .help("Output path for the checkpoint file")
            .required(true)
            .index(2))
        .arg(Arg::new("tokenizer-output")
            .long("tokenizer-output")
            .value_name("PATH")
            .help("Output path for the vocabulary file [default: tokenizer.bin next to the checkpoint]"))
}

/// Define the inference subcommand.
fn inference_subcommand() -> Command {
    Command::new("inference")
        .about("Llama 2 inference in Rust")
        .arg(
            Arg::new("checkpoint")
                .help("Model checkpoint file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("tokenizer")
                .short('z')
                .long("tokenizer")
                .value_name("PATH")
                .help("Vocabulary file [default: tokenizer.bin]"),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 means greedy")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1], 1 disables it")
                .default_value("0.9")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed [default: current time]")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Number of positions to run, 0 = max_seq_len")
                .default_value("256")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max_seq_len")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("STRING")
                .help("Mode: generate|chat")
                .default_value("generate"),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt"),
        )
        .arg(
            Arg::new("system")
                .short('y')
                .long("system")
                .value_name("STRING")
                .help("System prompt in chat mode"),
        )
        .arg(
            Arg::new("ignore-eos")
                .long("ignore-eos")
                .help("Keep generating after the end-of-sequence token")
                .action(ArgAction::SetTrue),
        )
}

/// Default vocabulary location: next to the checkpoint.
fn default_tokenizer_output(checkpoint_path: &Path) -> PathBuf {
    checkpoint_path.with_file_name(DEFAULT_TOKENIZER_FILE)
}

/// Run the export command with the provided arguments
fn run_export_command(matches: &ArgMatches) -> Result<()> {
    let model_path = matches
        .get_one::<String>("MODEL_PATH")
        .ok_or_else(|| anyhow::anyhow!("MODEL_PATH is required"))?;
    let output_path = matches
        .get_one::<String>("OUTPUT_PATH")
        .ok_or_else(|| anyhow::anyhow!("OUTPUT_PATH is required"))?;

    let model_dir = Path::new(model_path);
    if !model_dir.is_dir() {
        anyhow::bail!("Model directory does not exist: {model_path}");
    }

    let checkpoint_path = PathBuf::from(output_path);
    let tokenizer_path = matches
        .get_one::<String>("tokenizer-output")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_tokenizer_output(&checkpoint_path));

    info!("");
    info!("🚀 Llama 2 Model Exporter");
    info!("📁 Model path: {model_path}");
    info!("💾 Checkpoint: {}", checkpoint_path.display());
    info!("🔤 Tokenizer: {}\n", tokenizer_path.display());

    export_model(model_dir, &checkpoint_path, &tokenizer_path)
}

/// Run the inference command with the provided arguments
fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .checkpoint_path(matches.get_one::<String>("checkpoint"))
        .tokenizer_path(matches.get_one::<String>("tokenizer"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .steps(matches.get_one::<usize>("steps").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .mode(matches.get_one::<String>("mode"))
        .prompt(matches.get_one::<String>("input"))
        .system_prompt(matches.get_one::<String>("system"))
        .seed(matches.get_one::<u64>("seed").copied())
        .stop_at_eos(Some(!matches.get_flag("ignore-eos")))
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))
}

fn cli() -> Command {
    Command::new("llama2")
        .about("Llama 2 CLI: export HuggingFace Llama models and run them on the CPU")
        .subcommand(export_subcommand())
        .subcommand(inference_subcommand())
}

fn execute_commands() -> Result<()> {
    // Bare message format, no timestamp or module prefix
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("export", matches)) => run_export_command(matches),
        Some(("inference", matches)) => run_inference_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
